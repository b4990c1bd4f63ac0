//! Node-side heartbeat: register with the orchestrator, then keep pinging.
//!
//! The machine is driven by a single task. [`Liveness::tick`] performs one
//! step against an [`OrchestratorLink`] and reports the cadence the next tick
//! should use; [`run`] wires that to a Tokio interval and the node's
//! cancellation token.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gorch_core::config::LivenessConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeCommState {
    Idle,
    Polling,
    QuickPolling,
    Registered,
    Disconnecting,
    Disconnected,
}

impl std::fmt::Display for NodeCommState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeCommState::Idle => "idle",
            NodeCommState::Polling => "polling",
            NodeCommState::QuickPolling => "quick-polling",
            NodeCommState::Registered => "registered",
            NodeCommState::Disconnecting => "disconnecting",
            NodeCommState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Tick rate the machine wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Normal,
    Quick,
    /// The task should exit.
    Stop,
}

/// The calls a node makes against its orchestrator. Any error counts as a
/// failure; no payload-level codes exist.
#[async_trait]
pub trait OrchestratorLink: Send + Sync {
    async fn register(&self) -> anyhow::Result<()>;
    async fn ping(&self) -> anyhow::Result<()>;
    async fn disconnect(&self) -> anyhow::Result<()>;
}

#[derive(Debug)]
pub struct Liveness {
    state: NodeCommState,
    poll_count: u32,
    threshold: u32,
    has_orchestrator: bool,
}

impl Liveness {
    pub fn new(has_orchestrator: bool, quick_poll_threshold: u32) -> Self {
        Self {
            state: if has_orchestrator {
                NodeCommState::Polling
            } else {
                NodeCommState::Idle
            },
            poll_count: 0,
            threshold: quick_poll_threshold,
            has_orchestrator,
        }
    }

    pub fn state(&self) -> NodeCommState {
        self.state
    }

    pub fn poll_count(&self) -> u32 {
        self.poll_count
    }

    /// Mark the orchestrator address as known; an idle machine starts
    /// quick-polling on its next tick.
    pub fn set_orchestrator_known(&mut self) {
        self.has_orchestrator = true;
    }

    /// Ask the machine to leave: the next tick sends the disconnect notice.
    pub fn begin_disconnect(&mut self) {
        if self.state != NodeCommState::Disconnected {
            self.change(NodeCommState::Disconnecting);
        }
    }

    fn change(&mut self, next: NodeCommState) {
        if self.state != next {
            info!(old = %self.state, new = %next, "node comm state changed");
        }
        self.state = next;
    }

    /// One registration attempt before the first tick. A success moves
    /// straight to `Registered`, so the first tick pings instead of
    /// registering a second time.
    pub async fn startup(&mut self, link: &dyn OrchestratorLink) -> Cadence {
        if self.state == NodeCommState::Polling {
            match link.register().await {
                Ok(()) => {
                    debug!("start-up registration succeeded");
                    self.change(NodeCommState::Registered);
                }
                Err(e) => debug!(error = %e, "start-up registration failed"),
            }
        }
        self.cadence()
    }

    fn cadence(&self) -> Cadence {
        match self.state {
            NodeCommState::QuickPolling => Cadence::Quick,
            NodeCommState::Disconnected => Cadence::Stop,
            _ => Cadence::Normal,
        }
    }

    /// Advance one step.
    pub async fn tick(&mut self, link: &dyn OrchestratorLink) -> Cadence {
        match self.state {
            NodeCommState::Idle => {
                if self.has_orchestrator {
                    self.change(NodeCommState::QuickPolling);
                }
            }
            NodeCommState::QuickPolling => {
                self.poll_count += 1;
                if self.poll_count > self.threshold {
                    self.poll_count = 0;
                    self.change(NodeCommState::Polling);
                }
                self.try_register(link).await;
            }
            NodeCommState::Polling => self.try_register(link).await,
            NodeCommState::Registered => {
                if let Err(e) = link.ping().await {
                    warn!(error = %e, "ping failed, quick-polling");
                    self.change(NodeCommState::QuickPolling);
                }
            }
            NodeCommState::Disconnecting => {
                if let Err(e) = link.disconnect().await {
                    debug!(error = %e, "disconnect notice failed");
                }
                self.change(NodeCommState::Disconnected);
            }
            NodeCommState::Disconnected => {}
        }
        self.cadence()
    }

    async fn try_register(&mut self, link: &dyn OrchestratorLink) {
        match link.register().await {
            Ok(()) => {
                self.poll_count = 0;
                self.change(NodeCommState::Registered);
            }
            Err(e) => debug!(state = %self.state, error = %e, "registration failed"),
        }
    }
}

/// Drive the machine until `cancel` fires, then send a best-effort disconnect
/// if the node was registered.
pub async fn run(
    link: &dyn OrchestratorLink,
    has_orchestrator: bool,
    config: &LivenessConfig,
    cancel: CancellationToken,
) -> NodeCommState {
    let normal = config.poll_period();
    let quick = config.quick_poll_period();
    let mut machine = Liveness::new(has_orchestrator, config.quick_poll_threshold);

    let mut cadence = machine.startup(link).await;
    let mut ticker = new_ticker(period_for(cadence, normal, quick));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let next = machine.tick(link).await;
                if next == Cadence::Stop {
                    return machine.state();
                }
                if next != cadence {
                    ticker = new_ticker(period_for(next, normal, quick));
                    cadence = next;
                }
            }
        }
    }

    if machine.state() == NodeCommState::Registered {
        machine.begin_disconnect();
        machine.tick(link).await;
    } else {
        machine.change(NodeCommState::Disconnected);
    }
    machine.state()
}

fn period_for(cadence: Cadence, normal: Duration, quick: Duration) -> Duration {
    match cadence {
        Cadence::Quick => quick,
        _ => normal,
    }
}

fn new_ticker(period: Duration) -> tokio::time::Interval {
    let period = period.max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

// ---------------------------------------------------------------------------
// HTTP link
// ---------------------------------------------------------------------------

/// What a node sends to `/register`.
#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub name: String,
    pub addr: String,
    pub port: u16,
}

pub struct HttpLink {
    http: reqwest::Client,
    base: String,
    registration: Registration,
}

impl HttpLink {
    /// `orchestrator` is `host:port`.
    pub fn new(orchestrator: &str, registration: Registration) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: format!("http://{orchestrator}"),
            registration,
        }
    }

    async fn post(&self, path: &str, body: Option<&Registration>) -> anyhow::Result<()> {
        let url = format!("{}{path}", self.base);
        let mut req = self.http.post(&url);
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("{url} returned {}", resp.status());
        }
        Ok(())
    }
}

#[async_trait]
impl OrchestratorLink for HttpLink {
    async fn register(&self) -> anyhow::Result<()> {
        self.post("/register", Some(&self.registration)).await?;
        info!(
            node = %self.registration.name,
            orchestrator = %self.base,
            "registered with orchestrator"
        );
        Ok(())
    }

    async fn ping(&self) -> anyhow::Result<()> {
        self.post(&format!("/ping/{}", self.registration.name), None)
            .await
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        self.post(&format!("/disconnect/{}", self.registration.name), None)
            .await
    }
}
