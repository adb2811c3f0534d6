//! # wb-viewcount
//!
//! Write-behind view counting: absorb a high rate of "film viewed" events in a volatile cache and move them into a
//! relational database in batches.
//!
//! # The Basics
//!
//! The crate is built for the following situation:
//!
//! - Every view of a film must eventually be reflected in the film's total and in its per-day count.
//! - Writing each view straight into the database is too expensive.
//! - A short delay before views show up in the database is acceptable.
//!
//! The pipeline works on these principles:
//!
//! - A view increments a live counter in the cache, one counter per film and day.
//! - Periodically, all live counters are swept into one immutable *pending batch* which is stored in the cache too.
//! - Pending batches are flushed into the database, one transaction per batch. A batch is deleted only after its
//!   transaction is committed, so a failed flush is simply retried later.
//! - The cache is optional. When it's not configured, not reachable or failing, views are written to the database
//!   directly and nothing is lost.
//!
//! Delivery is at-least-once. A crash between a flush commit and deletion of its batch applies the batch twice.
//!
//! # Components
//!
//! - [`CacheGateway`](gateway::CacheGateway) owns the cache connection. It never returns errors; failures degrade to
//!   neutral values and the gateway reconnects in the background. Redis is supported with the `redis` feature, and an
//!   in-process [moka](https://crates.io/crates/moka)-based backend is always available.
//! - [`ViewCounter`](view_counter::ViewCounter) is the aggregation engine.
//! - [`Scheduler`](scheduler::Scheduler) runs the collect, process and recover triggers.
//! - [`DbViewStore`](store::DbViewStore) is the [SeaORM](https://crates.io/crates/sea-orm) based durable store.
//!
//! # Crate Features
//!
//! - `sqlite`, `pg`, `mysql`: database backends.
//! - `redis`: the Redis cache backend.
//! - `app`: the `wb-viewcount` binary with its command line configuration. Implies `redis`.
//! - `tracing`: maximum tracing verbosity.
//! - `test`: test fixtures.
#[cfg(feature = "app")]
pub mod app;
#[cfg(feature = "app")]
pub mod config;
pub mod error;
pub mod gateway;
pub mod scheduler;
pub mod store;
pub mod view_counter;

#[doc(inline)]
pub use gateway::CacheGateway;
#[doc(inline)]
pub use view_counter::ViewCounter;

pub mod prelude {
    pub use crate::error::Result;
    pub use crate::error::ViewCountError;
    pub use crate::gateway::resolve_cache_target;
    pub use crate::gateway::CacheGateway;
    pub use crate::gateway::GatewaySettings;
    pub use crate::scheduler::Scheduler;
    pub use crate::scheduler::SchedulerSettings;
    pub use crate::store::DbViewStore;
    pub use crate::store::ViewStore;
    pub use crate::view_counter::CounterSettings;
    pub use crate::view_counter::IncrementOutcome;
    pub use crate::view_counter::ViewCounter;
}
