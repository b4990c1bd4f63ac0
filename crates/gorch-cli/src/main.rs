mod cmd;
mod output;

use clap::{Parser, Subcommand};
use cmd::{
    client::{ActionArgs, NodeTarget, Target},
    node::NodeArgs,
    orchestrator::OrchestratorArgs,
};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Parser)]
#[command(
    name = "gorch",
    about = "Dispatch named actions to a fleet of worker nodes through an orchestrator",
    version,
    propagate_version = true
)]
struct Cli {
    /// Append log output to this file instead of stderr
    #[arg(long, global = true, env = "GORCH_LOG")]
    log: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a worker node
    Node(NodeArgs),

    /// Run the orchestrator
    Orchestrator(OrchestratorArgs),

    /// Run an action on a node
    Action(ActionArgs),

    /// List the nodes registered with the orchestrator
    Nodes {
        #[command(flatten)]
        target: Target,
    },

    /// List the actions a node offers
    Actions {
        #[command(flatten)]
        target: NodeTarget,
    },

    /// Fetch a node's data (all files, or one)
    Data {
        #[command(flatten)]
        target: NodeTarget,
        /// Data file name, without the .json extension
        file: Option<String>,
    },

    /// List the keys of a node's data (all files, or one)
    List {
        #[command(flatten)]
        target: NodeTarget,
        /// Data file name, without the .json extension
        file: Option<String>,
    },
}

fn init_tracing(level: tracing::Level, log: Option<&Path>) -> anyhow::Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .with_target(false);

    match log {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Node(_) | Commands::Orchestrator(_) => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    if let Err(e) = init_tracing(default_level, cli.log.as_deref()) {
        eprintln!("error: cannot open log file: {e:#}");
        std::process::exit(1);
    }

    let result = match cli.command {
        Commands::Node(args) => cmd::node::run(args),
        Commands::Orchestrator(args) => cmd::orchestrator::run(args),
        Commands::Action(args) => cmd::client::run_action(args),
        Commands::Nodes { target } => cmd::client::run_nodes(&target, cli.json),
        Commands::Actions { target } => cmd::client::run_actions(&target, cli.json),
        Commands::Data { target, file } => cmd::client::run_data(&target, file.as_deref()),
        Commands::List { target, file } => cmd::client::run_list(&target, file.as_deref()),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
