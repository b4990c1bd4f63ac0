//! `gorch-hook`: push channel for long-running action output.
//!
//! A caller that does not want to hold an HTTP request open while an action
//! runs starts a [`HookListener`] and hands its address to the node. The node
//! opens a [`HookClient`] against that address and pushes output as it is
//! produced.
//!
//! ```text
//!   node                                   caller
//!   ────                                   ──────
//!   HookClient::send(chunk)
//!       │  mpsc (bounded, FIFO)
//!       ▼
//!   delivery task ── POST /update ──────▶  HookListener  ─▶ ChunkStream
//!                 ── POST /keepalive ───▶    │ watchdog (idle timeout)
//!   HookClient::stop()
//!                 ── POST /finish ──────▶    └─ graceful shutdown
//! ```
//!
//! Delivery is at-most-once per chunk: failures are logged, never retried.

pub mod client;
pub mod config;
pub mod error;
pub mod listener;

#[cfg(test)]
mod tests;

pub use client::{DeliveryStats, HookClient};
pub use config::HookConfig;
pub use error::HookError;
pub use listener::{ChunkStream, HookListener, HookSession, SessionEnd};

/// Convenience `Result` alias for this crate.
pub type Result<T> = std::result::Result<T, HookError>;

/// Body returned by every listener endpoint.
pub const ACK: &str = "ack";
