use std::time::Duration;

/// Timings shared by both ends of a hook session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookConfig {
    /// Listener shuts down after this long without an update or keepalive.
    pub idle_timeout: Duration,
    /// Per-request timeout for client calls.
    pub request_timeout: Duration,
    /// Chunks the client buffers before `send` waits.
    pub buffer: usize,
    /// Upper bound on the listener's graceful shutdown.
    pub shutdown_grace: Duration,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(3),
            buffer: 100,
            shutdown_grace: Duration::from_millis(500),
        }
    }
}

impl HookConfig {
    /// Clients keep the session alive at half the listener's idle timeout.
    pub fn keepalive_period(&self) -> Duration {
        self.idle_timeout / 2
    }
}
