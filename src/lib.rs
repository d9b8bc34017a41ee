pub mod api;
pub mod config;
pub mod extract;
pub mod incremental;
pub mod model;
pub mod observability;
pub mod orchestrator;
pub mod relationships;
pub mod restore;
pub mod sink;

pub use anyhow::{Context, Result};
