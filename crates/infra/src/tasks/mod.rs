//! Search-index projection tasks: storage, ports and per-task execution.
//!
//! ## Components
//!
//! - `ProjectionTaskStore`: durable task table with a skip-locked batch claim
//!   (in-memory or Postgres)
//! - `SearchIndex` / `AggregateSource`: the index written to and the primary
//!   store read from
//! - `ProjectionExecutor`: projects one claimed task and records DONE,
//!   RETRYING or DEAD
//!
//! The periodic claim loop lives in `workers::projection_worker`.

pub mod executor;
pub mod ports;
pub mod postgres;
pub mod store;

pub use executor::{ProjectionError, ProjectionExecutor, TaskOutcome, DEFAULT_INDEX_TIMEOUT};
pub use ports::{
    AggregateSource, AggregateState, IndexError, InMemoryAggregateSource, InMemorySearchIndex,
    SearchIndex, SourceError,
};
pub use postgres::PostgresTaskStore;
pub use store::{
    ClaimedTask, InMemoryTaskStore, ProjectionTaskStore, TaskStats, TaskStoreError,
    DEFAULT_CLAIM_LEASE,
};
