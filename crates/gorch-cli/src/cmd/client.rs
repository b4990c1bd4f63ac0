use crate::output::{print_json, print_table};
use anyhow::{bail, Context, Result};
use clap::Args;
use futures::StreamExt;
use gorch_core::action::{Action, LOOPBACK, STREAM_ADDR_KEY, STREAM_PORT_KEY};
use gorch_hook::{HookConfig, HookListener, SessionEnd};
use gorch_server::orchestrator::registry::NodeConnection;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

#[derive(Args, Debug)]
pub struct Target {
    /// Orchestrator address, as host:port
    #[arg(long, env = "GORCH_ORCHESTRATOR", default_value = "127.0.0.1:8322")]
    pub orchestrator: String,
}

#[derive(Args, Debug)]
pub struct NodeTarget {
    #[command(flatten)]
    pub target: Target,

    /// Node to address
    #[arg(long, short = 'n')]
    pub node: String,
}

#[derive(Args, Debug)]
pub struct ActionArgs {
    #[command(flatten)]
    pub target: NodeTarget,

    /// Action to run
    #[arg(long, short = 'a')]
    pub action: String,

    /// Action parameter as key=value (repeatable)
    #[arg(long = "data", short = 'd', value_parser = parse_data)]
    pub data: Vec<(String, String)>,

    /// JSON object of parameters; its keys win over --data
    #[arg(long)]
    pub data_file: Option<PathBuf>,

    /// Listen on this local port and print the action's output as it streams
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
    pub stream_port: Option<u16>,
}

fn parse_data(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("'{s}' is not in key=value format"))?;
    let mut chars = key.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(format!("'{key}' is not a valid parameter name"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Merge `--data` pairs with the object in `data_file`; file keys win.
fn build_body(data: Vec<(String, String)>, data_file: Option<&Path>) -> Result<Map<String, Value>> {
    let mut body: Map<String, Value> = data
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect();

    if let Some(path) = data_file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read data file {}", path.display()))?;
        let value: Value = serde_json::from_str(&text)
            .with_context(|| format!("data file {} is not valid JSON", path.display()))?;
        let Value::Object(file) = value else {
            bail!("data file {} must hold a JSON object", path.display());
        };
        body.extend(file);
    }
    Ok(body)
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

struct Client {
    base: String,
    http: reqwest::Client,
}

impl Client {
    fn new(target: &Target) -> Self {
        let addr = target.orchestrator.trim_end_matches('/');
        let base = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.to_string()
        } else {
            format!("http://{addr}")
        };
        Self {
            base,
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    async fn get(&self, path: &str) -> Result<String> {
        let url = self.url(path);
        tracing::debug!(%url, "GET");
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("cannot reach {url}"))?;
        read_reply(resp, &url).await
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<String> {
        let url = self.url(path);
        tracing::debug!(%url, "POST");
        let resp = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("cannot reach {url}"))?;
        read_reply(resp, &url).await
    }
}

async fn read_reply(resp: reqwest::Response, url: &str) -> Result<String> {
    let status = resp.status();
    let text = resp.text().await?;
    if status.is_success() {
        Ok(text)
    } else {
        bail!("{url}: {status}: {}", error_message(&text))
    }
}

/// The `error` field of a JSON error body, or the body itself.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

fn block_on<F: std::future::Future<Output = Result<()>>>(fut: F) -> Result<()> {
    tokio::runtime::Runtime::new()?.block_on(fut)
}

// ---------------------------------------------------------------------------
// action
// ---------------------------------------------------------------------------

pub fn run_action(args: ActionArgs) -> Result<()> {
    let body = build_body(args.data, args.data_file.as_deref())?;
    let client = Client::new(&args.target.target);
    let path = format!("{}/action/{}", args.target.node, args.action);

    block_on(async move {
        match args.stream_port {
            Some(port) => stream_action(&client, &path, body, port).await,
            None => {
                let reply = client.post_json(&path, &Value::Object(body)).await?;
                print!("{reply}");
                if !reply.ends_with('\n') {
                    println!();
                }
                Ok(())
            }
        }
    })
}

async fn stream_action(
    client: &Client,
    path: &str,
    mut body: Map<String, Value>,
    port: u16,
) -> Result<()> {
    let cancel = super::shutdown_on_ctrl_c();
    let mut listener = HookListener::bind(("0.0.0.0", port), HookConfig::default())
        .await
        .with_context(|| format!("cannot listen on port {port}"))?
        .with_cancellation(&cancel);
    let mut chunks = listener.chunks();
    let session = tokio::spawn(listener.run());

    body.insert(STREAM_ADDR_KEY.to_string(), Value::String(LOOPBACK.to_string()));
    body.insert(STREAM_PORT_KEY.to_string(), Value::String(port.to_string()));
    match client.post_json(path, &Value::Object(body)).await {
        Ok(reply) => tracing::info!(reply = %reply.trim_end(), "action accepted"),
        Err(e) => {
            cancel.cancel();
            let _ = session.await;
            return Err(e);
        }
    }

    let mut stdout = std::io::stdout();
    while let Some(chunk) = chunks.next().await {
        stdout.write_all(&chunk)?;
        stdout.flush()?;
    }

    let session = session.await??;
    match session.end {
        SessionEnd::Finished => Ok(()),
        SessionEnd::IdleTimeout => bail!("stream went idle before the action finished"),
        SessionEnd::Cancelled => bail!("interrupted"),
    }
}

// ---------------------------------------------------------------------------
// nodes / actions / data / list
// ---------------------------------------------------------------------------

pub fn run_nodes(target: &Target, json: bool) -> Result<()> {
    let client = Client::new(target);
    block_on(async move {
        let text = client.get("nodes").await?;
        let nodes: BTreeMap<String, NodeConnection> =
            serde_json::from_str(&text).context("unexpected /nodes reply")?;
        if json {
            return print_json(&nodes);
        }
        if nodes.is_empty() {
            println!("No nodes registered.");
            return Ok(());
        }
        let rows = nodes
            .values()
            .map(|n| {
                vec![
                    n.name.clone(),
                    n.address.clone(),
                    n.port.to_string(),
                    n.last_interaction.format("%Y-%m-%d %H:%M:%S").to_string(),
                ]
            })
            .collect();
        print_table(&["NAME", "ADDRESS", "PORT", "LAST SEEN"], rows);
        Ok(())
    })
}

pub fn run_actions(target: &NodeTarget, json: bool) -> Result<()> {
    let client = Client::new(&target.target);
    let path = format!("{}/action/", target.node);
    block_on(async move {
        let text = client.get(&path).await?;
        let actions: BTreeMap<String, Action> =
            serde_json::from_str(&text).context("unexpected action list reply")?;
        if json {
            return print_json(&actions);
        }
        let rows = actions
            .values()
            .map(|a| {
                let resources: Vec<String> = a
                    .resources
                    .iter()
                    .map(|(name, n)| format!("{name}={n}"))
                    .collect();
                vec![
                    a.name.clone(),
                    a.params.join(","),
                    resources.join(","),
                    a.description.clone(),
                ]
            })
            .collect();
        print_table(&["NAME", "PARAMS", "RESOURCES", "DESCRIPTION"], rows);
        Ok(())
    })
}

pub fn run_data(target: &NodeTarget, file: Option<&str>) -> Result<()> {
    fetch_json(target, "data", file)
}

pub fn run_list(target: &NodeTarget, file: Option<&str>) -> Result<()> {
    fetch_json(target, "list", file)
}

fn fetch_json(target: &NodeTarget, kind: &str, file: Option<&str>) -> Result<()> {
    let client = Client::new(&target.target);
    let path = format!("{}/{kind}/{}", target.node, file.unwrap_or_default());
    block_on(async move {
        let text = client.get(&path).await?;
        let value: Value = serde_json::from_str(&text).context("node replied with invalid JSON")?;
        print_json(&value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn data_pairs_split_on_first_equals() {
        assert_eq!(
            parse_data("expr=a=b").unwrap(),
            ("expr".to_string(), "a=b".to_string())
        );
        assert_eq!(parse_data("x=").unwrap(), ("x".to_string(), String::new()));
    }

    #[test]
    fn malformed_data_pairs_are_rejected() {
        assert!(parse_data("novalue").is_err());
        assert!(parse_data("=1").is_err());
        assert!(parse_data("1x=1").is_err());
        assert!(parse_data("a-b=1").is_err());
    }

    #[test]
    fn data_file_keys_win() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("params.json");
        std::fs::write(&path, r#"{"x": "file", "n": 3}"#).unwrap();

        let body = build_body(
            vec![("x".into(), "flag".into()), ("y".into(), "2".into())],
            Some(&path),
        )
        .unwrap();
        assert_eq!(body["x"], "file");
        assert_eq!(body["y"], "2");
        assert_eq!(body["n"], 3);
    }

    #[test]
    fn data_file_must_be_an_object() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("params.json");
        std::fs::write(&path, "[1, 2]").unwrap();
        let err = build_body(Vec::new(), Some(&path)).unwrap_err();
        assert!(err.to_string().contains("JSON object"));
    }

    #[test]
    fn error_bodies_are_unwrapped() {
        assert_eq!(
            error_message(r#"{"error":"3 actions already running"}"#),
            "3 actions already running"
        );
        assert_eq!(error_message("plain failure\n"), "plain failure");
    }

    #[test]
    fn orchestrator_address_gets_a_scheme() {
        let c = Client::new(&Target {
            orchestrator: "10.0.0.2:8322".into(),
        });
        assert_eq!(c.url("/nodes"), "http://10.0.0.2:8322/nodes");
        let c = Client::new(&Target {
            orchestrator: "http://orch.lan/".into(),
        });
        assert_eq!(c.url("n1/action/x"), "http://orch.lan/n1/action/x");
    }
}
