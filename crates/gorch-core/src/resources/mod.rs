//! Per-node admission control.
//!
//! A node owns a fixed set of named [`ResourceGroup`] capacity pools. Every
//! action invocation presents a [`ResourceRequest`] and is admitted only if
//! *all* of it can be granted at once; the grant is tracked as a
//! [`ResourceHandle`] until released.

mod group;
mod manager;
mod request;

pub use group::{GroupStatus, ResourceGroup};
pub use manager::{HandleId, Lease, ResourceHandle, ResourceManager};
pub use request::ResourceRequest;

/// Built-in group bounding the number of concurrently running actions.
pub const ACTIONS_GROUP: &str = "actions";
