pub mod action;
pub mod config;
pub mod data;
pub mod error;
pub mod resources;
pub mod template;
pub mod value;

pub use error::{GorchError, Result};
