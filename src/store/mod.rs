//! Pluggable admission state backends
//!
//! A [`Datastore`] decides whether a job may start and accounts for
//! completions. Two implementations ship with the crate: [`LocalStore`]
//! keeps state in process memory, [`RedisStore`] (behind the `redis`
//! feature) shares state between processes through a server-side script.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ThrottleError;

mod local;
#[cfg(feature = "redis")]
mod redis_store;

pub use local::LocalStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

/// Scalar admission inputs, handed to the datastore on every request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Max total weight executing at once; `0` disables the gate
    pub max_concurrent: u32,

    /// Minimum time between job starts; zero disables the gate
    pub min_time: Duration,
}

/// Outcome of an admission request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The job may start now; its weight has been counted.
    Granted,

    /// The job may not start. `retry_after` carries the spacing gate's
    /// suggested wait; a concurrency denial has no useful wait and
    /// reports `None`.
    Denied { retry_after: Option<Duration> },
}

impl Admission {
    /// Check whether admission was granted
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted)
    }
}

/// Admission state shared by all limiters using the same store
///
/// Implementations must make `request` atomic per limiter ID: concurrent
/// requests may never jointly exceed `max_concurrent` nor violate the
/// `min_time` spacing.
#[async_trait]
pub trait Datastore: Send + Sync + fmt::Debug {
    /// Evaluate both gates for `weight` under `limits`. On grant, the
    /// weight is counted and the start timestamp recorded in one atomic
    /// step.
    async fn request(
        &self,
        limiter_id: &str,
        weight: u32,
        limits: &Limits,
    ) -> Result<Admission, ThrottleError>;

    /// Release `weight` after a job finishes. Idempotent against missing
    /// state; implementations clamp the running count at zero.
    async fn register_done(&self, limiter_id: &str, weight: u32) -> Result<(), ThrottleError>;

    /// Release resources. Subsequent calls to `request` or
    /// `register_done` fail with [`ThrottleError::StoreClosed`].
    async fn disconnect(&self) -> Result<(), ThrottleError>;
}
