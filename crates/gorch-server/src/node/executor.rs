//! Runs actions as subprocesses under a resource lease.
//!
//! Every invocation asks the node's [`ResourceManager`] for the action's
//! declared resources plus one unit of the built-in `actions` group. The lease
//! is a drop guard, so it is returned on every exit path, including a panic in
//! the streaming task.

use std::sync::Arc;

use gorch_core::action::{Action, StreamTarget};
use gorch_core::resources::{Lease, ResourceManager, ResourceRequest, ACTIONS_GROUP};
use gorch_core::value::Params;
use gorch_core::{GorchError, Result};
use gorch_hook::{HookClient, HookConfig};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// What an accepted invocation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Output of every command, joined with newlines.
    Completed(String),
    /// The commands run in the background and push output to this target.
    Streaming(StreamTarget),
}

impl ActionOutcome {
    /// Response body for the triggering request.
    pub fn into_body(self) -> String {
        match self {
            ActionOutcome::Completed(out) => out,
            ActionOutcome::Streaming(dest) => format!("Streaming action output to {dest}"),
        }
    }
}

#[derive(Clone)]
pub struct ActionExecutor {
    resources: Arc<ResourceManager>,
    hook: HookConfig,
    cancel: CancellationToken,
    streams: TaskTracker,
}

impl ActionExecutor {
    pub fn new(resources: Arc<ResourceManager>, hook: HookConfig, cancel: CancellationToken) -> Self {
        Self {
            resources,
            hook,
            cancel,
            streams: TaskTracker::new(),
        }
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    /// Streamed runs still in flight.
    pub fn streams_running(&self) -> usize {
        self.streams.len()
    }

    /// Wait until every streamed run has closed its hook session and
    /// returned its lease. Runs spawned afterwards are tracked again.
    pub async fn drain(&self) {
        self.streams.close();
        self.streams.wait().await;
        self.streams.reopen();
    }

    /// The full lease an invocation of `action` needs.
    pub fn admission_request(action: &Action) -> Result<ResourceRequest> {
        action
            .resources
            .merged(&ResourceRequest::new().with(ACTIONS_GROUP, 1))
    }

    /// Render, admit, and run `action`.
    ///
    /// Template errors are reported before any capacity is taken. Admission
    /// errors ([`GorchError::is_admission_rejected`]) are distinct from
    /// command failures.
    pub async fn run(
        &self,
        action: &Action,
        stream: Option<StreamTarget>,
        params: &Params,
    ) -> Result<ActionOutcome> {
        let commands = action.build_commands(params)?;
        let lease = self.resources.lease(&Self::admission_request(action)?)?;
        debug!(action = %action.name, handle = ?lease.id(), "action admitted");

        match stream {
            None => {
                let out = run_sequence(&action.name, &commands).await;
                lease.release();
                out.map(|outputs| ActionOutcome::Completed(outputs.join("\n")))
            }
            Some(dest) => {
                self.streams.spawn(stream_sequence(
                    action.name.clone(),
                    commands,
                    dest.clone(),
                    lease,
                    self.hook.clone(),
                    self.cancel.clone(),
                ));
                Ok(ActionOutcome::Streaming(dest))
            }
        }
    }
}

async fn run_sequence(action: &str, commands: &[String]) -> Result<Vec<String>> {
    let mut outputs = Vec::with_capacity(commands.len());
    for command in commands {
        match run_command(command).await {
            Ok(out) => outputs.push(out),
            Err(e) => {
                warn!(action, command = %command, error = %e, "action command failed");
                return Err(e);
            }
        }
    }
    info!(action, commands = commands.len(), "action finished");
    Ok(outputs)
}

async fn stream_sequence(
    action: String,
    commands: Vec<String>,
    dest: StreamTarget,
    lease: Lease,
    hook: HookConfig,
    cancel: CancellationToken,
) {
    let mut client = match HookClient::new(dest.to_string(), hook) {
        Ok(client) => client.with_cancellation(&cancel),
        Err(e) => {
            warn!(action = %action, dest = %dest, error = %e, "could not open hook session");
            return;
        }
    };
    if let Err(e) = client.start() {
        warn!(action = %action, dest = %dest, error = %e, "could not open hook session");
        return;
    }
    info!(action = %action, dest = %dest, "streaming action output");

    for command in &commands {
        let result = tokio::select! {
            r = run_command(command) => r,
            _ = cancel.cancelled() => {
                debug!(action = %action, "streamed action cancelled");
                break;
            }
        };
        let (chunk, failed) = match result {
            Ok(out) => (out, false),
            Err(e) => (e.to_string(), true),
        };
        if let Err(e) = client.send(chunk).await {
            warn!(action = %action, error = %e, "hook send failed");
            break;
        }
        if failed {
            warn!(action = %action, command = %command, "streamed action aborted");
            break;
        }
    }

    match client.stop().await {
        Ok(stats) => debug!(action = %action, ?stats, "hook session closed"),
        Err(e) => warn!(action = %action, error = %e, "hook session close failed"),
    }
    drop(lease);
}

/// Run one rendered command. The command is split on whitespace; no shell is
/// involved.
pub async fn run_command(command: &str) -> Result<String> {
    let mut argv = command.split_whitespace();
    let program = argv.next().ok_or_else(|| GorchError::CommandSpawn {
        command: command.to_string(),
        reason: "empty command".into(),
    })?;

    let output = Command::new(program)
        .args(argv)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| GorchError::CommandSpawn {
            command: command.to_string(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(GorchError::CommandFailed {
            command: command.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
