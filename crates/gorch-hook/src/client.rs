use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::HookConfig;
use crate::{HookError, Result};

/// Counters reported by a finished delivery task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub delivered: u64,
    pub failed: u64,
    pub keepalives: u64,
    pub finished: bool,
}

struct Session {
    tx: mpsc::Sender<Bytes>,
    task: JoinHandle<DeliveryStats>,
}

/// Producer side of a hook session.
///
/// Chunks passed to [`send`](Self::send) are queued on a bounded channel and
/// posted to the listener's `/update` endpoint by a single background task,
/// in submission order.
pub struct HookClient {
    address: String,
    config: HookConfig,
    http: reqwest::Client,
    cancel: CancellationToken,
    session: Option<Session>,
}

impl HookClient {
    /// `address` is the listener's `host:port`.
    pub fn new(address: impl Into<String>, config: HookConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(HookError::Client)?;
        Ok(Self {
            address: address.into(),
            config,
            http,
            cancel: CancellationToken::new(),
            session: None,
        })
    }

    /// Tie the session to a parent shutdown signal.
    pub fn with_cancellation(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_running(&self) -> bool {
        self.session.is_some() && !self.cancel.is_cancelled()
    }

    /// Spawn the delivery task. Must be called from inside a Tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Err(HookError::AlreadyStarted);
        }
        let (tx, rx) = mpsc::channel(self.config.buffer.max(1));
        let task = tokio::spawn(deliver(
            self.http.clone(),
            format!("http://{}", self.address),
            rx,
            self.cancel.clone(),
            self.config.keepalive_period(),
        ));
        self.session = Some(Session { tx, task });
        debug!(address = %self.address, "hook client started");
        Ok(())
    }

    /// Queue a chunk for delivery.
    ///
    /// Fails immediately once the client is stopped or cancelled; waits only
    /// while the buffer is full.
    pub async fn send(&self, chunk: impl Into<Bytes>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(HookError::SessionEnded);
        }
        let session = self.session.as_ref().ok_or(HookError::NotRunning)?;
        tokio::select! {
            res = session.tx.send(chunk.into()) => res.map_err(|_| HookError::SessionEnded),
            _ = self.cancel.cancelled() => Err(HookError::SessionEnded),
        }
    }

    /// Stop accepting chunks, let the delivery task drain and post `/finish`,
    /// and wait for it.
    pub async fn stop(&mut self) -> Result<DeliveryStats> {
        let session = self.session.take().ok_or(HookError::NotRunning)?;
        drop(session.tx);
        self.cancel.cancel();
        let stats = session.task.await.unwrap_or_default();
        debug!(address = %self.address, ?stats, "hook client stopped");
        Ok(stats)
    }
}

impl Drop for HookClient {
    fn drop(&mut self) {
        // A dropped client still drains and finishes in the background.
        self.cancel.cancel();
    }
}

async fn deliver(
    http: reqwest::Client,
    base: String,
    mut rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    keepalive_period: std::time::Duration,
) -> DeliveryStats {
    let mut stats = DeliveryStats::default();
    let mut keepalive = interval_at(Instant::now() + keepalive_period, keepalive_period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let update_url = format!("{base}/update");
    loop {
        tokio::select! {
            biased;
            chunk = rx.recv() => match chunk {
                Some(chunk) => {
                    record(&mut stats, post(&http, &update_url, chunk).await);
                    keepalive.reset();
                }
                None => break,
            },
            _ = cancel.cancelled() => {
                rx.close();
                while let Some(chunk) = rx.recv().await {
                    record(&mut stats, post(&http, &update_url, chunk).await);
                }
                break;
            }
            _ = keepalive.tick() => {
                match post(&http, &format!("{base}/keepalive"), Bytes::new()).await {
                    Ok(()) => stats.keepalives += 1,
                    Err(e) => warn!(error = %e, "hook keepalive failed"),
                }
            }
        }
    }

    match post(&http, &format!("{base}/finish"), Bytes::new()).await {
        Ok(()) => stats.finished = true,
        Err(e) => warn!(error = %e, "hook finish failed"),
    }
    stats
}

fn record(stats: &mut DeliveryStats, result: Result<()>) {
    match result {
        Ok(()) => stats.delivered += 1,
        Err(e) => {
            stats.failed += 1;
            warn!(error = %e, "hook update failed");
        }
    }
}

async fn post(http: &reqwest::Client, url: &str, body: Bytes) -> Result<()> {
    let resp = http
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "text/plain")
        .body(body)
        .send()
        .await
        .map_err(|source| HookError::Http {
            url: url.to_string(),
            source,
        })?;
    if !resp.status().is_success() {
        return Err(HookError::Status {
            url: url.to_string(),
            status: resp.status().as_u16(),
        });
    }
    Ok(())
}
