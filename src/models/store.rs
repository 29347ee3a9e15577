//! Storage-fleet nodes as reported by the coordinator.

use crate::models::{LodeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Liveness of a storage node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreState {
    Up,
    Disconnected,
    Tombstone,
    Offline,
}

impl StoreState {
    /// Parse the coordinator's `state_name`. Unknown names are treated as
    /// disconnected so they are skipped by default.
    pub fn from_state_name(name: &str) -> Self {
        match name {
            "Up" => Self::Up,
            "Tombstone" => Self::Tombstone,
            "Offline" => Self::Offline,
            _ => Self::Disconnected,
        }
    }
}

impl fmt::Display for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => write!(f, "Up"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Tombstone => write!(f, "Tombstone"),
            Self::Offline => write!(f, "Offline"),
        }
    }
}

/// One storage node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Store {
    pub id: u64,
    /// host:port of the node's administrative endpoint
    pub address: String,
    pub state: StoreState,
    #[serde(default)]
    pub version: String,
}

/// Write-path tuning of a storage node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchMode {
    /// Relaxed compaction and flush behaviour for bulk ingestion
    Import,
    /// Steady-state behaviour
    Normal,
}

impl FromStr for SwitchMode {
    type Err = LodeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "import" => Ok(Self::Import),
            "normal" => Ok(Self::Normal),
            other => Err(LodeError::InvalidArgument(format!(
                "invalid mode {other}, must use import or normal"
            ))),
        }
    }
}

impl fmt::Display for SwitchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Import => write!(f, "import"),
            Self::Normal => write!(f, "normal"),
        }
    }
}

/// Compaction level meaning "all levels".
pub const FULL_LEVEL_COMPACT: i32 = -1;
