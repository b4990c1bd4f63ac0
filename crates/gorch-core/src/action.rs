use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::path::Path;

use crate::error::{GorchError, Result};
use crate::resources::ResourceRequest;
use crate::template::CommandTemplate;
use crate::value::{ParamValue, Params};

/// Body key carrying an embedded action definition for ad hoc runs.
pub const ADHOC_ACTION_KEY: &str = "action";
pub const STREAM_ADDR_KEY: &str = "stream_addr";
pub const STREAM_PORT_KEY: &str = "stream_port";
/// `stream_addr` value meaning "whoever sent this request".
pub const LOOPBACK: &str = "loopback";

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// A named, parameterized sequence of command templates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(alias = "command", deserialize_with = "one_or_many")]
    pub commands: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "ResourceRequest::is_empty")]
    pub resources: ResourceRequest,
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

impl Action {
    pub fn new(name: impl Into<String>, commands: Vec<String>) -> Self {
        Self {
            name: name.into(),
            commands,
            ..Default::default()
        }
    }

    pub fn templates(&self) -> Result<Vec<CommandTemplate>> {
        if self.commands.is_empty() {
            return Err(GorchError::TemplateParse {
                action: self.name.clone(),
                reason: "no commands defined".into(),
            });
        }
        self.commands
            .iter()
            .map(|c| CommandTemplate::parse(&self.name, c))
            .collect()
    }

    /// Render every command against `params`.
    ///
    /// All templates are rendered before the caller runs any of them, so a
    /// bad template or missing parameter aborts with nothing spawned.
    pub fn build_commands(&self, params: &Params) -> Result<Vec<String>> {
        self.templates()?
            .iter()
            .map(|t| {
                let rendered = t.render(params)?;
                if rendered.split_whitespace().next().is_none() {
                    return Err(GorchError::TemplateParse {
                        action: self.name.clone(),
                        reason: format!("command '{}' renders to nothing", t.source()),
                    });
                }
                Ok(rendered)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// ActionTable
// ---------------------------------------------------------------------------

/// The node's loaded actions, keyed by name. Replaced wholesale on reload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionTable(BTreeMap<String, Action>);

impl ActionTable {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&data)
    }

    /// Parse a YAML mapping of `name → action`. An action without an explicit
    /// `name` takes its key.
    pub fn from_yaml_str(data: &str) -> Result<Self> {
        let raw: BTreeMap<String, Action> = serde_yaml::from_str(data)?;
        let actions = raw
            .into_iter()
            .map(|(key, mut action)| {
                if action.name.is_empty() {
                    action.name = key.clone();
                }
                (key, action)
            })
            .collect();
        Ok(Self(actions))
    }

    pub fn get(&self, name: &str) -> Option<&Action> {
        self.0.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Action> for ActionTable {
    fn from_iter<I: IntoIterator<Item = Action>>(iter: I) -> Self {
        Self(iter.into_iter().map(|a| (a.name.clone(), a)).collect())
    }
}

// ---------------------------------------------------------------------------
// ActionRequest
// ---------------------------------------------------------------------------

/// Where to push streamed output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTarget {
    pub addr: String,
    pub port: u16,
}

impl StreamTarget {
    pub fn is_loopback(&self) -> bool {
        self.addr == LOOPBACK
    }

    /// Replace `loopback` with the address the request came from.
    pub fn resolve(mut self, peer: Option<IpAddr>) -> Self {
        if self.is_loopback() {
            self.addr = peer
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "127.0.0.1".to_string());
        }
        self
    }
}

impl fmt::Display for StreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.addr.contains(':') {
            write!(f, "[{}]:{}", self.addr, self.port)
        } else {
            write!(f, "{}:{}", self.addr, self.port)
        }
    }
}

/// A parsed `POST /action/...` body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionRequest {
    pub params: Params,
    pub stream: Option<StreamTarget>,
    pub adhoc: Option<Action>,
}

impl ActionRequest {
    /// Parse a JSON object body. An empty body means no parameters.
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        let mut map: BTreeMap<String, serde_json::Value> = serde_json::from_slice(body)
            .map_err(|e| GorchError::InvalidBody(format!("expected a JSON object: {e}")))?;

        let adhoc = match map.remove(ADHOC_ACTION_KEY) {
            Some(v) => Some(
                serde_json::from_value::<Action>(v)
                    .map_err(|e| GorchError::InvalidBody(format!("invalid action: {e}")))?,
            ),
            None => None,
        };

        let addr = map.remove(STREAM_ADDR_KEY).filter(|v| !v.is_null());
        let port = map.remove(STREAM_PORT_KEY).filter(|v| !v.is_null());
        let stream = match (addr, port) {
            (None, None) => None,
            (Some(addr), Some(port)) => Some(StreamTarget {
                addr: addr
                    .as_str()
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| GorchError::InvalidBody("stream_addr must be a string".into()))?
                    .to_string(),
                port: parse_port(&port)?,
            }),
            _ => {
                return Err(GorchError::InvalidBody(
                    "stream_addr and stream_port must be given together".into(),
                ))
            }
        };

        let params = map
            .into_iter()
            .map(|(k, v)| (k, ParamValue::from(v)))
            .collect();

        Ok(Self {
            params,
            stream,
            adhoc,
        })
    }
}

fn parse_port(v: &serde_json::Value) -> Result<u16> {
    let invalid = || GorchError::InvalidBody(format!("invalid stream port: {v}"));
    match v {
        serde_json::Value::String(s) => s.trim().parse::<u16>().map_err(|_| invalid()),
        serde_json::Value::Number(n) => n
            .as_u64()
            .and_then(|n| u16::try_from(n).ok())
            .ok_or_else(invalid),
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACTIONS_YAML: &str = r#"
build:
  params: [x]
  command: "echo building {{.x}}"
  description: Build something
  resources:
    gpu: 1
deploy:
  name: deploy-prod
  commands:
    - "echo one"
    - "echo two {{.target}}"
"#;

    #[test]
    fn loads_table_and_fills_names() {
        let table = ActionTable::from_yaml_str(ACTIONS_YAML).unwrap();
        assert_eq!(table.len(), 2);
        let build = table.get("build").unwrap();
        assert_eq!(build.name, "build");
        assert_eq!(build.commands, vec!["echo building {{.x}}"]);
        assert_eq!(build.resources.get("gpu"), Some(1));
        let deploy = table.get("deploy").unwrap();
        assert_eq!(deploy.name, "deploy-prod");
        assert_eq!(deploy.commands.len(), 2);
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("actions.yaml");
        std::fs::write(&path, ACTIONS_YAML).unwrap();
        let table = ActionTable::load(&path).unwrap();
        assert_eq!(table.names().collect::<Vec<_>>(), vec!["build", "deploy"]);
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let err = ActionTable::load(Path::new("/nonexistent/actions.yaml")).unwrap_err();
        assert!(matches!(err, GorchError::Io(_)));
    }

    #[test]
    fn build_commands_renders_all() {
        let table = ActionTable::from_yaml_str(ACTIONS_YAML).unwrap();
        let mut params = Params::new();
        params.insert("target".into(), "prod".into());
        let cmds = table.get("deploy").unwrap().build_commands(&params).unwrap();
        assert_eq!(cmds, vec!["echo one", "echo two prod"]);
    }

    #[test]
    fn build_commands_fails_before_running_anything() {
        let action = Action::new(
            "broken",
            vec!["echo fine".into(), "echo {{.missing}}".into()],
        );
        assert!(matches!(
            action.build_commands(&Params::new()),
            Err(GorchError::MissingParameter(_))
        ));
        let empty = Action::new("empty", vec![]);
        assert!(empty.build_commands(&Params::new()).is_err());
    }

    #[test]
    fn parse_body_extracts_params_and_stream() {
        let req = ActionRequest::parse(
            br#"{"x":"1","n":2,"stream_addr":"loopback","stream_port":"9100"}"#,
        )
        .unwrap();
        assert_eq!(req.params.len(), 2);
        assert_eq!(req.params["x"], ParamValue::from("1"));
        let stream = req.stream.unwrap();
        assert!(stream.is_loopback());
        assert_eq!(stream.port, 9100);
        let resolved = stream.resolve(Some("10.1.2.3".parse().unwrap()));
        assert_eq!(resolved.to_string(), "10.1.2.3:9100");
    }

    #[test]
    fn parse_body_accepts_numeric_port() {
        let req = ActionRequest::parse(br#"{"stream_addr":"h","stream_port":80}"#).unwrap();
        assert_eq!(req.stream.unwrap().port, 80);
    }

    #[test]
    fn parse_body_rejects_bad_stream_fields() {
        assert!(ActionRequest::parse(br#"{"stream_addr":"h","stream_port":"x"}"#).is_err());
        assert!(ActionRequest::parse(br#"{"stream_addr":"h","stream_port":70000}"#).is_err());
        assert!(ActionRequest::parse(br#"{"stream_addr":"h"}"#).is_err());
    }

    #[test]
    fn parse_body_rejects_non_objects() {
        assert!(matches!(
            ActionRequest::parse(b"[1,2]"),
            Err(GorchError::InvalidBody(_))
        ));
        assert!(ActionRequest::parse(b"not json").is_err());
    }

    #[test]
    fn parse_empty_body() {
        let req = ActionRequest::parse(b"").unwrap();
        assert!(req.params.is_empty());
        assert!(req.stream.is_none());
    }

    #[test]
    fn parse_body_extracts_adhoc_action() {
        let req = ActionRequest::parse(
            br#"{"action":{"name":"hi","command":"echo {{.who}}"},"who":"there"}"#,
        )
        .unwrap();
        let action = req.adhoc.unwrap();
        assert_eq!(action.name, "hi");
        assert_eq!(
            action.build_commands(&req.params).unwrap(),
            vec!["echo there"]
        );
    }

    #[test]
    fn ipv6_target_is_bracketed() {
        let t = StreamTarget {
            addr: LOOPBACK.into(),
            port: 1,
        }
        .resolve(Some("::1".parse().unwrap()));
        assert_eq!(t.to_string(), "[::1]:1");
    }
}
