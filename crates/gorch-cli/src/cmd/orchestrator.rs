use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use gorch_core::config::{DispatchMode, OrchestratorConfig};
use std::path::PathBuf;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Proxy requests and relay the node's reply
    Forward,
    /// Answer with a redirect to the node
    Redirect,
}

impl From<Dispatch> for DispatchMode {
    fn from(d: Dispatch) -> Self {
        match d {
            Dispatch::Forward => DispatchMode::Forward,
            Dispatch::Redirect => DispatchMode::Redirect,
        }
    }
}

#[derive(Args, Debug, Default)]
pub struct OrchestratorArgs {
    /// YAML orchestrator config; flags below override its values
    #[arg(long, short = 'c', env = "GORCH_ORCHESTRATOR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(long, short = 'p')]
    pub port: Option<u16>,

    /// How requests for a node reach it
    #[arg(long, value_enum)]
    pub dispatch: Option<Dispatch>,

    /// Evict nodes silent for longer than this many milliseconds
    #[arg(long)]
    pub stale_after_ms: Option<u64>,
}

impl OrchestratorArgs {
    pub fn resolve(self) -> Result<OrchestratorConfig> {
        let mut config = match &self.config {
            Some(path) => OrchestratorConfig::load(path)
                .with_context(|| format!("cannot load orchestrator config {}", path.display()))?,
            None => OrchestratorConfig::default(),
        };
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(dispatch) = self.dispatch {
            config.dispatch = dispatch.into();
        }
        if let Some(ms) = self.stale_after_ms {
            config.stale_after_ms = ms;
            config.sweep_period_ms = ms;
        }
        Ok(config)
    }
}

pub fn run(args: OrchestratorArgs) -> Result<()> {
    let config = args.resolve()?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let cancel = super::shutdown_on_ctrl_c();
        gorch_server::orchestrator::serve(config, cancel).await
    })
}
