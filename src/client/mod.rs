//! Clients for the cluster's control endpoints.
//!
//! - `PdClient`: node discovery through the placement driver
//! - `HttpStoreAdmin`: per-node mode switching and compaction
//! - `MySqlTarget`: table drops and meta cleanup on the target database

mod http;
mod pd;
mod sql;
mod store_admin;

pub use http::{base_url, build_http_client};
pub(crate) use http::{check_status, classify};
pub use pd::*;
pub use sql::*;
pub use store_admin::*;
