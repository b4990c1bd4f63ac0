use thiserror::Error;

#[derive(Debug, Error)]
pub enum HookError {
    #[error("hook client is not running")]
    NotRunning,

    #[error("hook client already started")]
    AlreadyStarted,

    #[error("hook session has ended")]
    SessionEnded,

    #[error("hook request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("hook request to {url} returned {status}")]
    Status { url: String, status: u16 },

    #[error("cannot build hook HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
