//! HTTP services for gorch.
//!
//! [`node`] runs actions under resource admission and keeps itself registered
//! with an orchestrator. [`orchestrator`] keeps the node registry, evicts
//! nodes that stop heartbeating, and routes `/:node/*` requests to them.

pub mod error;
pub mod node;
pub mod orchestrator;

pub use node::{build_router as build_node_router, NodeState};
pub use orchestrator::{build_router as build_orchestrator_router, OrchestratorState};
