//! lodectl - Recovery and control plane for interrupted bulk loads.
//!
//! ## Architecture
//!
//! - **Checkpoints**: durable per-task, per-table, per-engine progress ledger
//! - **Backends**: import engines held by a remote importer or as local files
//! - **Fleet**: fan-out of admin calls to every storage node
//! - **Recovery**: the operator verbs built on the above
//!
//! ## Recovery verbs
//!
//! - Fleet: compact, switch-mode, fetch-mode
//! - Engines: import-engine, cleanup-engine
//! - Ledger: checkpoint-remove, checkpoint-error-ignore,
//!   checkpoint-error-destroy, checkpoint-dump, check-local-storage
//!
//! Every verb is safe to re-run after a crash: nothing to act on is a success.

pub mod backend;
pub mod checkpoint;
pub mod client;
pub mod fleet;
pub mod models;
pub mod recovery;

// Re-exports for convenience
pub use backend::{EngineManager, EngineState, ImportBackend};
pub use checkpoint::{open_checkpoints_db, CheckpointsDb};
pub use fleet::{for_all_stores, FleetReport};
pub use models::{Config, LodeError, Result, TableName, TableScope};
pub use recovery::{execute, Action, CommandContext};
