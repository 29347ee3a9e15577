//! Core data models for lodectl.
//!
//! - `checkpoint`: ledger records (task, table, engine, chunk)
//! - `store`: storage-fleet nodes and their modes
//! - `config`: TOML configuration
//! - `error`: error taxonomy

mod checkpoint;
mod config;
mod error;
mod store;

pub use checkpoint::*;
pub use config::*;
pub use error::*;
pub use store::*;
