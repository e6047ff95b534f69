//! Limiter configuration

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::store::{Datastore, Limits};

/// Priority assigned to jobs submitted without an explicit one
pub const DEFAULT_PRIORITY: i32 = 5;

/// Weight assigned to jobs submitted without an explicit one
pub const DEFAULT_WEIGHT: u32 = 1;

/// Limiter configuration, immutable after construction
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Identity of this limiter under the datastore. Required when a shared
    /// datastore is configured; defaults to `"default"` for local-only use.
    pub id: String,

    /// Max total weight executing at once. `0` disables the concurrency gate.
    pub max_concurrent: u32,

    /// Minimum time between job starts in milliseconds. `0` disables the
    /// spacing gate.
    pub min_time_ms: u64,

    /// Shared datastore for cross-process coordination. `None` selects a
    /// per-process in-memory store.
    #[serde(skip)]
    pub datastore: Option<Arc<dyn Datastore>>,
}

impl Options {
    /// Get the inter-start spacing as a Duration
    pub fn min_time(&self) -> Duration {
        Duration::from_millis(self.min_time_ms)
    }

    /// Get the scalar admission inputs handed to the datastore
    pub fn limits(&self) -> Limits {
        Limits {
            max_concurrent: self.max_concurrent,
            min_time: self.min_time(),
        }
    }
}
