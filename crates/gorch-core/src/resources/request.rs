use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{GorchError, Result};

/// The capacity one action invocation needs, as `{group → count}`.
///
/// Backed by a `BTreeMap`, so iteration (and therefore acquisition) always
/// follows the same name order for every request handled by a manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceRequest(BTreeMap<String, i64>);

impl ResourceRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert. A repeated name replaces the earlier count.
    pub fn with(mut self, name: impl Into<String>, count: i64) -> Self {
        self.0.insert(name.into(), count);
        self
    }

    /// Accumulate `count` onto `name`. Fails instead of overflowing.
    pub fn add(&mut self, name: impl Into<String>, count: i64) -> Result<()> {
        let name = name.into();
        let current = self.0.get(&name).copied().unwrap_or(0);
        let total = current
            .checked_add(count)
            .ok_or_else(|| GorchError::InvalidResourceCount {
                name: name.clone(),
                count,
            })?;
        self.0.insert(name, total);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<i64> {
        self.0.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// This request plus everything in `other`.
    pub fn merged(&self, other: &ResourceRequest) -> Result<ResourceRequest> {
        let mut out = self.clone();
        for (name, count) in other.iter() {
            out.add(name, count)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iterates_in_name_order() {
        let req = ResourceRequest::new().with("slots", 1).with("gpu", 2).with("cpu", 4);
        let names: Vec<&str> = req.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["cpu", "gpu", "slots"]);
    }

    #[test]
    fn merged_accumulates_counts() {
        let a = ResourceRequest::new().with("gpu", 1);
        let b = ResourceRequest::new().with("gpu", 2).with("actions", 1);
        let m = a.merged(&b).unwrap();
        assert_eq!(m.get("gpu"), Some(3));
        assert_eq!(m.get("actions"), Some(1));
    }

    #[test]
    fn overflowing_merge_is_rejected() {
        let declared = ResourceRequest::new().with("actions", i64::MAX);
        let err = declared
            .merged(&ResourceRequest::new().with("actions", 1))
            .unwrap_err();
        assert!(matches!(
            err,
            GorchError::InvalidResourceCount { ref name, count: 1 } if name == "actions"
        ));
    }

    #[test]
    fn with_replaces_a_repeated_name() {
        let req = ResourceRequest::new().with("gpu", 1).with("gpu", 4);
        assert_eq!(req.get("gpu"), Some(4));
    }

    #[test]
    fn deserializes_from_plain_mapping() {
        let req: ResourceRequest = serde_yaml::from_str("gpu: 1\nslots: 2\n").unwrap();
        assert_eq!(req.len(), 2);
        assert_eq!(req.get("slots"), Some(2));
    }
}
