//! Command templates.
//!
//! A template is literal text with `{{.name}}` placeholders (whitespace inside
//! the braces is allowed: `{{ .name }}`). Templates are parsed up front so a
//! malformed one is reported before any process is spawned.

use crate::error::{GorchError, Result};
use crate::value::Params;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl CommandTemplate {
    /// Parse `source`. `owner` names the action in error messages.
    pub fn parse(owner: &str, source: &str) -> Result<Self> {
        let err = |reason: String| GorchError::TemplateParse {
            action: owner.to_string(),
            reason,
        };

        let mut segments = Vec::new();
        let mut rest = source;
        while let Some(open) = rest.find("{{") {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 2..];
            let close = after
                .find("}}")
                .ok_or_else(|| err(format!("unclosed '{{{{' in {source:?}")))?;
            let inner = after[..close].trim();
            let name = inner
                .strip_prefix('.')
                .ok_or_else(|| err(format!("placeholder '{inner}' must start with '.'")))?;
            if !is_identifier(name) {
                return Err(err(format!("invalid parameter name '{name}'")));
            }
            segments.push(Segment::Param(name.to_string()));
            rest = &after[close + 2..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Names referenced by the template, in order of first appearance.
    pub fn parameters(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for seg in &self.segments {
            if let Segment::Param(name) = seg {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// Substitute every placeholder from `params`.
    pub fn render(&self, params: &Params) -> Result<String> {
        let mut out = String::with_capacity(self.source.len());
        for seg in &self.segments {
            match seg {
                Segment::Literal(text) => out.push_str(text),
                Segment::Param(name) => {
                    let value = params
                        .get(name)
                        .ok_or_else(|| GorchError::MissingParameter(name.clone()))?;
                    out.push_str(&value.render());
                }
            }
        }
        Ok(out)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ParamValue;

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), ParamValue::from(*v)))
            .collect()
    }

    #[test]
    fn renders_placeholders() {
        let t = CommandTemplate::parse("build", "make -j{{.jobs}} {{ .target }}").unwrap();
        let out = t.render(&params(&[("jobs", "4"), ("target", "all")])).unwrap();
        assert_eq!(out, "make -j4 all");
        assert_eq!(t.parameters(), vec!["jobs", "target"]);
    }

    #[test]
    fn literal_only_template() {
        let t = CommandTemplate::parse("ls", "ls -la").unwrap();
        assert_eq!(t.render(&Params::new()).unwrap(), "ls -la");
        assert!(t.parameters().is_empty());
    }

    #[test]
    fn repeated_placeholder_listed_once() {
        let t = CommandTemplate::parse("x", "{{.a}}-{{.a}}").unwrap();
        assert_eq!(t.parameters(), vec!["a"]);
        assert_eq!(t.render(&params(&[("a", "1")])).unwrap(), "1-1");
    }

    #[test]
    fn missing_parameter_is_an_error() {
        let t = CommandTemplate::parse("echo", "echo {{.msg}}").unwrap();
        let err = t.render(&Params::new()).unwrap_err();
        assert!(matches!(err, GorchError::MissingParameter(ref p) if p == "msg"));
    }

    #[test]
    fn unclosed_placeholder_is_a_parse_error() {
        let err = CommandTemplate::parse("echo", "echo {{.msg").unwrap_err();
        assert!(matches!(err, GorchError::TemplateParse { .. }));
    }

    #[test]
    fn placeholder_without_dot_is_a_parse_error() {
        assert!(CommandTemplate::parse("echo", "echo {{msg}}").is_err());
        assert!(CommandTemplate::parse("echo", "echo {{.}}").is_err());
        assert!(CommandTemplate::parse("echo", "echo {{.1x}}").is_err());
    }

    #[test]
    fn stray_closing_braces_are_literal_text() {
        let t = CommandTemplate::parse("echo", "echo msg}}").unwrap();
        assert_eq!(t.render(&Params::new()).unwrap(), "echo msg}}");

        let t = CommandTemplate::parse("echo", "echo a}} {{.x}} b}}").unwrap();
        assert_eq!(t.render(&params(&[("x", "1")])).unwrap(), "echo a}} 1 b}}");
    }
}
