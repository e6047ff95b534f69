//! throttled - Rate-limited job scheduling
//!
//! A [`Limiter`] enforces two simultaneous constraints over submitted
//! jobs: a ceiling on concurrently executing weight (`max_concurrent`)
//! and a minimum spacing between successive job starts (`min_time`).
//! Jobs carry a priority (higher dispatches sooner) and a weight (cost
//! against the concurrency ceiling).
//!
//! # Core Concepts
//!
//! - **Two-constraint gate**: admission requires capacity under the
//!   concurrency ceiling and enough elapsed time since the last start
//! - **Priority dispatch**: a single dispatcher drains a max-heap of
//!   pending jobs through the gate
//! - **Pluggable state**: a [`Datastore`] decides admissions; in-memory
//!   for one process, Redis-backed for a shared limit across processes
//! - **Rendezvous delivery**: every submitted job gets exactly one
//!   outcome, a result or an error
//!
//! # Modules
//!
//! - [`limiter`] - the scheduler: submission API, priority queue, dispatcher
//! - [`store`] - admission state backends and their contract
//! - [`config`] - limiter options
//! - [`error`] - the error type
//!
//! # Example
//!
//! ```no_run
//! use throttled::{Limiter, Options};
//!
//! # async fn run() -> Result<(), throttled::ThrottleError> {
//! let limiter = Limiter::new(Options {
//!     max_concurrent: 2,
//!     min_time_ms: 100,
//!     ..Default::default()
//! })?;
//!
//! let body = limiter.submit(|| async {
//!     let response = fetch_page().await?;
//!     Ok(response)
//! }).await?;
//!
//! limiter.stop().await?;
//! # Ok(())
//! # }
//! # async fn fetch_page() -> eyre::Result<String> { Ok(String::new()) }
//! ```

pub mod config;
pub mod error;
pub mod limiter;
pub mod store;

pub use config::{Options, DEFAULT_PRIORITY, DEFAULT_WEIGHT};
pub use error::ThrottleError;
pub use limiter::{Limiter, LimiterStats};
#[cfg(feature = "redis")]
pub use store::RedisStore;
pub use store::{Admission, Datastore, Limits, LocalStore};
