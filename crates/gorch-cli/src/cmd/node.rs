use anyhow::{Context, Result};
use clap::Args;
use gorch_core::config::NodeConfig;
use std::path::PathBuf;

#[derive(Args, Debug, Default)]
pub struct NodeArgs {
    /// YAML node config; flags below override its values
    #[arg(long, short = 'c', env = "GORCH_NODE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Node name, unique within the orchestrator
    #[arg(long)]
    pub name: Option<String>,

    /// Address the orchestrator should use to reach this node
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(long, short = 'p')]
    pub port: Option<u16>,

    /// Directory of *.json data files to serve
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// YAML action table
    #[arg(long)]
    pub actions: Option<PathBuf>,

    /// Orchestrator to register with, as host:port
    #[arg(long, env = "GORCH_ORCHESTRATOR")]
    pub orchestrator: Option<String>,

    /// Accept ad hoc actions on POST /action/
    #[arg(long)]
    pub arbitrary_actions: bool,

    /// Maximum number of actions running at once
    #[arg(long)]
    pub max_actions: Option<i64>,
}

impl NodeArgs {
    /// Load the config file (or defaults) and apply flag overrides.
    pub fn resolve(self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)
                .with_context(|| format!("cannot load node config {}", path.display()))?,
            None => NodeConfig::default(),
        };

        if let Some(name) = self.name {
            config.name = name;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.data_dir.is_some() {
            config.data_dir = self.data_dir;
        }
        if self.actions.is_some() {
            config.actions_path = self.actions;
        }
        if self.orchestrator.is_some() {
            config.orchestrator = self.orchestrator;
        }
        if self.arbitrary_actions {
            config.arbitrary_actions = true;
        }
        if let Some(max) = self.max_actions {
            anyhow::ensure!(max >= 0, "--max-actions must not be negative");
            config.max_actions = max;
        }

        config.validate()?;
        Ok(config)
    }
}

pub fn run(args: NodeArgs) -> Result<()> {
    let config = args.resolve()?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let cancel = super::shutdown_on_ctrl_c();
        gorch_server::node::serve(config, cancel).await
    })
}
