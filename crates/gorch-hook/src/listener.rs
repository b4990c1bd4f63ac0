use std::future::IntoFuture;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use futures::Stream;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HookConfig;
use crate::{Result, ACK};

/// Why a listener stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The producer called `/finish`.
    Finished,
    /// No update or keepalive arrived within the idle timeout.
    IdleTimeout,
    /// The parent shutdown signal fired.
    Cancelled,
}

/// Everything a listener received, in arrival order.
#[derive(Debug, Clone)]
pub struct HookSession {
    pub chunks: Vec<Bytes>,
    pub end: SessionEnd,
}

impl HookSession {
    /// All chunks concatenated, lossily decoded as UTF-8.
    pub fn text(&self) -> String {
        self.chunks
            .iter()
            .map(|c| String::from_utf8_lossy(c))
            .collect::<Vec<_>>()
            .join("")
    }
}

struct Inner {
    chunks: Mutex<Vec<Bytes>>,
    live: Option<mpsc::UnboundedSender<Bytes>>,
    activity: Notify,
    shutdown: CancellationToken,
    end: Mutex<Option<SessionEnd>>,
}

impl Inner {
    fn end_with(&self, reason: SessionEnd) {
        let mut end = self.end.lock().unwrap_or_else(PoisonError::into_inner);
        if end.is_none() {
            *end = Some(reason);
        }
        drop(end);
        self.shutdown.cancel();
    }
}

/// Consumer side of a hook session: a small HTTP server with `/update`,
/// `/keepalive` and `/finish`, plus an idle watchdog.
pub struct HookListener {
    listener: TcpListener,
    config: HookConfig,
    shutdown: CancellationToken,
    live: Option<mpsc::UnboundedSender<Bytes>>,
}

impl HookListener {
    pub async fn bind(addr: impl ToSocketAddrs, config: HookConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            config,
            shutdown: CancellationToken::new(),
            live: None,
        })
    }

    /// Bind on all interfaces at `port` and run until the session ends.
    pub async fn listen(port: u16, config: HookConfig) -> Result<HookSession> {
        Self::bind(("0.0.0.0", port), config).await?.run().await
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn with_cancellation(mut self, parent: &CancellationToken) -> Self {
        self.shutdown = parent.child_token();
        self
    }

    /// Receive chunks as they arrive, in addition to the final [`HookSession`].
    pub fn chunks(&mut self) -> ChunkStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.live = Some(tx);
        ChunkStream { rx }
    }

    /// Serve until `/finish`, the idle watchdog, or cancellation.
    pub async fn run(self) -> Result<HookSession> {
        let addr = self.listener.local_addr()?;
        let inner = Arc::new(Inner {
            chunks: Mutex::new(Vec::new()),
            live: self.live,
            activity: Notify::new(),
            shutdown: self.shutdown.clone(),
            end: Mutex::new(None),
        });

        let app = Router::new()
            .route("/update", post(update))
            .route("/keepalive", post(keepalive))
            .route("/finish", post(finish))
            .with_state(Arc::clone(&inner));

        let watchdog = tokio::spawn(watchdog(Arc::clone(&inner), self.config.idle_timeout));

        info!(%addr, "hook listener started");
        let signal = {
            let token = self.shutdown.clone();
            async move { token.cancelled().await }
        };
        let server = axum::serve(self.listener, app)
            .with_graceful_shutdown(signal)
            .into_future();
        let grace = {
            let token = self.shutdown.clone();
            let grace = self.config.shutdown_grace;
            async move {
                token.cancelled().await;
                tokio::time::sleep(grace).await;
            }
        };

        tokio::select! {
            res = server => res?,
            _ = grace => warn!(%addr, "hook listener shutdown grace period elapsed"),
        }

        inner.shutdown.cancel();
        let _ = watchdog.await;

        let end = inner
            .end
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unwrap_or(SessionEnd::Cancelled);
        let chunks = std::mem::take(&mut *inner.chunks.lock().unwrap_or_else(PoisonError::into_inner));
        info!(%addr, ?end, chunks = chunks.len(), "hook listener stopped");
        Ok(HookSession { chunks, end })
    }
}

async fn update(State(inner): State<Arc<Inner>>, body: Bytes) -> (StatusCode, &'static str) {
    if inner.shutdown.is_cancelled() {
        return (StatusCode::SERVICE_UNAVAILABLE, "session closed");
    }
    inner.activity.notify_one();
    debug!(bytes = body.len(), "hook update");
    if let Some(live) = &inner.live {
        let _ = live.send(body.clone());
    }
    inner
        .chunks
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(body);
    (StatusCode::OK, ACK)
}

async fn keepalive(State(inner): State<Arc<Inner>>) -> &'static str {
    debug!("hook keepalive");
    inner.activity.notify_one();
    ACK
}

async fn finish(State(inner): State<Arc<Inner>>) -> &'static str {
    debug!("hook finish");
    inner.end_with(SessionEnd::Finished);
    ACK
}

async fn watchdog(inner: Arc<Inner>, idle: std::time::Duration) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = inner.activity.notified() => continue,
            _ = tokio::time::sleep(idle) => {
                warn!("hook watchdog tripped");
                inner.end_with(SessionEnd::IdleTimeout);
                return;
            }
        }
    }
}

/// Live view of the chunks a listener receives.
pub struct ChunkStream {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl Stream for ChunkStream {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
