use thiserror::Error;

#[derive(Debug, Error)]
pub enum GorchError {
    #[error("insufficient resources: {0}")]
    InsufficientResources(String),

    #[error("{0} actions already running")]
    ActionsBusy(i64),

    #[error("unknown resource group: {0}")]
    UnknownResourceGroup(String),

    #[error("resource group '{0}' is reserved for the action limit")]
    ReservedResourceGroup(String),

    #[error("invalid resource count {count} for '{name}'")]
    InvalidResourceCount { name: String, count: i64 },

    #[error("action not found: {0}")]
    ActionNotFound(String),

    #[error("remote actions are disabled")]
    AdhocDisabled,

    #[error("node not registered: {0}")]
    NodeNotRegistered(String),

    #[error("invalid node name '{0}': must match ^[a-zA-Z][a-zA-Z0-9_.-]*$")]
    InvalidNodeName(String),

    #[error("template error in '{action}': {reason}")]
    TemplateParse { action: String, reason: String },

    #[error("missing parameter '{0}'")]
    MissingParameter(String),

    #[error("invalid body: {0}")]
    InvalidBody(String),

    #[error("failed to start '{command}': {reason}")]
    CommandSpawn { command: String, reason: String },

    #[error("command '{command}' failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("data file not found: {0}")]
    DataNotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl GorchError {
    /// Admission pressure: the caller may retry later.
    pub fn is_admission_rejected(&self) -> bool {
        matches!(
            self,
            GorchError::InsufficientResources(_) | GorchError::ActionsBusy(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, GorchError>;
