// QuectoFlow — Declarative JSON workflow executor in Rust
// License: Apache-2.0

pub mod api;
pub mod config;
pub mod logger;
pub mod provider;
pub mod tool;
pub mod workflow;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
