use crate::error::{GorchError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Node names
// ---------------------------------------------------------------------------

static NODE_NAME_RE: OnceLock<Regex> = OnceLock::new();

fn node_name_re() -> &'static Regex {
    NODE_NAME_RE.get_or_init(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_.-]*$").unwrap())
}

pub fn validate_node_name(name: &str) -> Result<()> {
    if node_name_re().is_match(name) {
        Ok(())
    } else {
        Err(GorchError::InvalidNodeName(name.to_string()))
    }
}

// ---------------------------------------------------------------------------
// LivenessConfig
// ---------------------------------------------------------------------------

/// Node-side heartbeat cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessConfig {
    #[serde(default = "default_poll_period_ms")]
    pub poll_period_ms: u64,
    #[serde(default = "default_quick_poll_threshold")]
    pub quick_poll_threshold: u32,
}

fn default_poll_period_ms() -> u64 {
    default_stale_after_ms() / 2
}

fn default_quick_poll_threshold() -> u32 {
    25
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            poll_period_ms: default_poll_period_ms(),
            quick_poll_threshold: default_quick_poll_threshold(),
        }
    }
}

impl LivenessConfig {
    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms)
    }

    /// Enough quick attempts to fit `quick_poll_threshold` of them in one
    /// normal period.
    pub fn quick_poll_period(&self) -> Duration {
        self.poll_period() / self.quick_poll_threshold.max(1)
    }
}

// ---------------------------------------------------------------------------
// HookSettings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookSettings {
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_buffer")]
    pub buffer: usize,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_idle_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    3_000
}

fn default_buffer() -> usize {
    100
}

fn default_shutdown_grace_ms() -> u64 {
    500
}

impl Default for HookSettings {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            buffer: default_buffer(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// NodeConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_name")]
    pub name: String,
    /// Address the orchestrator should use to reach this node.
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_node_port")]
    pub port: u16,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub actions_path: Option<PathBuf>,
    /// `host:port` of the orchestrator, if any.
    #[serde(default)]
    pub orchestrator: Option<String>,
    #[serde(default)]
    pub arbitrary_actions: bool,
    #[serde(default = "default_max_actions")]
    pub max_actions: i64,
    /// Extra capacity pools, `name → capacity`.
    #[serde(default)]
    pub resources: BTreeMap<String, i64>,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub hook: HookSettings,
}

fn default_node_name() -> String {
    "Anon".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_node_port() -> u16 {
    3000
}

fn default_max_actions() -> i64 {
    100
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            host: default_host(),
            port: default_node_port(),
            data_dir: None,
            actions_path: None,
            orchestrator: None,
            arbitrary_actions: false,
            max_actions: default_max_actions(),
            resources: BTreeMap::new(),
            liveness: LivenessConfig::default(),
            hook: HookSettings::default(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_yaml::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_node_name(&self.name)?;
        // The actions group is sized by max_actions alone.
        if self.resources.contains_key(crate::resources::ACTIONS_GROUP) {
            return Err(GorchError::ReservedResourceGroup(
                crate::resources::ACTIONS_GROUP.to_string(),
            ));
        }
        Ok(())
    }

    /// Every capacity pool the node's resource manager starts with: the
    /// configured pools plus the built-in `actions` pool.
    pub fn resource_groups(&self) -> BTreeMap<String, i64> {
        let mut groups = self.resources.clone();
        groups.insert(
            crate::resources::ACTIONS_GROUP.to_string(),
            self.max_actions,
        );
        groups
    }
}

// ---------------------------------------------------------------------------
// OrchestratorConfig
// ---------------------------------------------------------------------------

/// How `/:node/*` requests reach the node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Proxy the request and relay the node's response.
    #[default]
    Forward,
    /// Answer with a 307 pointing at the node.
    Redirect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_orchestrator_port")]
    pub port: u16,
    /// Nodes silent for longer than this are evicted.
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
    #[serde(default = "default_stale_after_ms")]
    pub sweep_period_ms: u64,
    #[serde(default)]
    pub dispatch: DispatchMode,
}

fn default_orchestrator_port() -> u16 {
    8322
}

fn default_stale_after_ms() -> u64 {
    10_000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            port: default_orchestrator_port(),
            stale_after_ms: default_stale_after_ms(),
            sweep_period_ms: default_stale_after_ms(),
            dispatch: DispatchMode::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&data)?)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn sweep_period(&self) -> Duration {
        Duration::from_millis(self.sweep_period_ms.max(1))
    }
}
