//! In-memory datastore for single-process limiters

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::ThrottleError;

use super::{Admission, Datastore, Limits};

/// Per-ID admission state
#[derive(Debug, Default)]
struct LimiterState {
    /// Total weight currently executing
    running: u64,

    /// Start timestamp of the most recent grant
    last_start: Option<Instant>,
}

#[derive(Debug, Default)]
struct LocalInner {
    state: HashMap<String, LimiterState>,
    closed: bool,
}

/// Datastore keeping all state in process memory
///
/// A single mutex protects the per-ID records; both operations are short
/// and never block. Spacing is measured on the monotonic clock.
#[derive(Debug, Default)]
pub struct LocalStore {
    inner: Mutex<LocalInner>,
}

impl LocalStore {
    /// Create an empty local store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Datastore for LocalStore {
    async fn request(
        &self,
        limiter_id: &str,
        weight: u32,
        limits: &Limits,
    ) -> Result<Admission, ThrottleError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(ThrottleError::StoreClosed);
        }

        let state = inner.state.entry(limiter_id.to_string()).or_default();
        let now = Instant::now();

        // Concurrency gate: no state change, no useful wait to suggest.
        if limits.max_concurrent > 0 && state.running + u64::from(weight) > u64::from(limits.max_concurrent) {
            debug!(
                limiter_id,
                weight,
                running = state.running,
                "LocalStore::request: concurrency denial"
            );
            return Ok(Admission::Denied { retry_after: None });
        }

        // Spacing gate: suggest the remaining wait.
        if !limits.min_time.is_zero() {
            if let Some(last_start) = state.last_start {
                let elapsed = now.duration_since(last_start);
                if elapsed < limits.min_time {
                    let retry_after = limits.min_time - elapsed;
                    debug!(limiter_id, ?retry_after, "LocalStore::request: spacing denial");
                    return Ok(Admission::Denied {
                        retry_after: Some(retry_after),
                    });
                }
            }
        }

        state.running += u64::from(weight);
        state.last_start = Some(now);
        debug!(
            limiter_id,
            weight,
            running = state.running,
            "LocalStore::request: granted"
        );
        Ok(Admission::Granted)
    }

    async fn register_done(&self, limiter_id: &str, weight: u32) -> Result<(), ThrottleError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(ThrottleError::StoreClosed);
        }

        // Absent state is a no-op; the count clamps at zero to tolerate
        // accounting skew.
        if let Some(state) = inner.state.get_mut(limiter_id) {
            state.running = state.running.saturating_sub(u64::from(weight));
            debug!(
                limiter_id,
                weight,
                running = state.running,
                "LocalStore::register_done: released"
            );
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ThrottleError> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.state.clear();
        debug!("LocalStore::disconnect: closed");
        Ok(())
    }
}
