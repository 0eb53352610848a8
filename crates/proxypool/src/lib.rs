pub mod client;
pub mod config;
pub mod fetch;
pub mod metrics;
pub mod orchestrator;
pub mod pool;
pub mod score;
pub mod serdes;
pub mod store;
pub mod types;
pub mod validate;

pub use proxypool_core::prelude::*;
pub use proxypool_core::{telemetry, version};

pub use crate::config::Config;
pub use crate::types::*;
