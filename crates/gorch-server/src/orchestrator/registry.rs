use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use gorch_core::{GorchError, Result};

/// The orchestrator's record of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConnection {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub last_interaction: DateTime<Utc>,
}

impl NodeConnection {
    /// `http://address:port`, with IPv6 literals bracketed.
    pub fn base_url(&self) -> String {
        if self.address.contains(':') {
            format!("http://[{}]:{}", self.address, self.port)
        } else {
            format!("http://{}:{}", self.address, self.port)
        }
    }
}

/// Whether a `register` call created an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registered {
    New,
    AlreadyKnown,
}

/// Node name → connection record. Every operation takes the lock for one map
/// lookup or update and never across network I/O.
#[derive(Debug, Default)]
pub struct Registry {
    nodes: Mutex<BTreeMap<String, NodeConnection>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn nodes(&self) -> MutexGuard<'_, BTreeMap<String, NodeConnection>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// First registration wins: a known name keeps its address and port.
    pub fn register(&self, name: &str, address: &str, port: u16) -> Registered {
        self.register_at(name, address, port, Utc::now())
    }

    pub fn register_at(
        &self,
        name: &str,
        address: &str,
        port: u16,
        now: DateTime<Utc>,
    ) -> Registered {
        let mut nodes = self.nodes();
        if let Some(existing) = nodes.get_mut(name) {
            existing.last_interaction = now;
            info!(node = name, num_nodes = nodes.len(), "node already registered");
            return Registered::AlreadyKnown;
        }
        nodes.insert(
            name.to_string(),
            NodeConnection {
                name: name.to_string(),
                address: address.to_string(),
                port,
                last_interaction: now,
            },
        );
        info!(node = name, address, port, num_nodes = nodes.len(), "registered node");
        Registered::New
    }

    pub fn ping(&self, name: &str) -> Result<()> {
        self.ping_at(name, Utc::now())
    }

    pub fn ping_at(&self, name: &str, now: DateTime<Utc>) -> Result<()> {
        match self.nodes().get_mut(name) {
            Some(node) => {
                node.last_interaction = now;
                Ok(())
            }
            None => Err(GorchError::NodeNotRegistered(name.to_string())),
        }
    }

    /// Drop `name`. Returns whether it was registered.
    pub fn disconnect(&self, name: &str) -> bool {
        let mut nodes = self.nodes();
        let removed = nodes.remove(name).is_some();
        if removed {
            info!(node = name, num_nodes = nodes.len(), "node disconnected");
        }
        removed
    }

    pub fn lookup(&self, name: &str) -> Result<NodeConnection> {
        self.nodes()
            .get(name)
            .cloned()
            .ok_or_else(|| GorchError::NodeNotRegistered(name.to_string()))
    }

    pub fn list(&self) -> BTreeMap<String, NodeConnection> {
        self.nodes().clone()
    }

    pub fn len(&self) -> usize {
        self.nodes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes().is_empty()
    }

    /// Evict every node whose last interaction is older than `stale_after`
    /// relative to `now`. Returns the evicted names.
    pub fn sweep_at(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> Vec<String> {
        let cutoff = now - stale_after;
        let mut nodes = self.nodes();
        let stale: Vec<String> = nodes
            .values()
            .filter(|n| n.last_interaction < cutoff)
            .map(|n| n.name.clone())
            .collect();
        for name in &stale {
            nodes.remove(name);
            info!(node = %name, num_nodes = nodes.len(), "stale node evicted");
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn first_registration_wins() {
        let r = Registry::new();
        assert_eq!(r.register("n1", "10.0.0.5", 9000), Registered::New);
        assert_eq!(r.register("n1", "10.0.0.6", 9001), Registered::AlreadyKnown);
        let n = r.lookup("n1").unwrap();
        assert_eq!(n.address, "10.0.0.5");
        assert_eq!(n.port, 9000);
        assert_eq!(n.base_url(), "http://10.0.0.5:9000");
    }

    #[test]
    fn ping_unknown_is_not_registered() {
        let r = Registry::new();
        assert!(matches!(
            r.ping("ghost"),
            Err(GorchError::NodeNotRegistered(_))
        ));
    }

    #[test]
    fn ping_refreshes_last_interaction() {
        let r = Registry::new();
        let t0 = Utc::now();
        r.register_at("n1", "h", 1, t0);
        let t1 = t0 + Duration::seconds(7);
        r.ping_at("n1", t1).unwrap();
        assert_eq!(r.lookup("n1").unwrap().last_interaction, t1);
    }

    #[test]
    fn sweep_evicts_only_stale_nodes() {
        let r = Registry::new();
        let t0 = Utc::now();
        r.register_at("old", "h", 1, t0);
        r.register_at("fresh", "h", 2, t0 + Duration::seconds(8));

        let evicted = r.sweep_at(t0 + Duration::seconds(11), Duration::seconds(10));
        assert_eq!(evicted, vec!["old".to_string()]);
        assert!(r.lookup("old").is_err());
        assert!(r.lookup("fresh").is_ok());
    }

    #[test]
    fn one_missed_ping_survives_two_do_not() {
        let r = Registry::new();
        let t0 = Utc::now();
        let period = Duration::seconds(5);
        let stale = period * 2;
        r.register_at("n", "h", 1, t0);
        assert!(r.sweep_at(t0 + period + Duration::seconds(1), stale).is_empty());
        assert_eq!(r.sweep_at(t0 + stale + Duration::seconds(1), stale), vec!["n"]);
    }

    #[test]
    fn evicted_node_can_register_fresh() {
        let r = Registry::new();
        let t0 = Utc::now();
        r.register_at("n1", "a", 1, t0);
        r.sweep_at(t0 + Duration::seconds(60), Duration::seconds(10));
        assert_eq!(r.register("n1", "b", 2), Registered::New);
        assert_eq!(r.lookup("n1").unwrap().address, "b");
    }

    #[test]
    fn disconnect_removes() {
        let r = Registry::new();
        r.register("n1", "h", 1);
        assert!(r.disconnect("n1"));
        assert!(!r.disconnect("n1"));
        assert!(r.is_empty());
    }

    #[test]
    fn ipv6_base_url_is_bracketed() {
        let r = Registry::new();
        r.register("n6", "::1", 3000);
        assert_eq!(r.lookup("n6").unwrap().base_url(), "http://[::1]:3000");
    }
}
