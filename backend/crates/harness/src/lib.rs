//! Challenge Harness Orchestrator
//!
//! Clean Architecture structure:
//! - `domain/` - Entities, proof-of-work rules, connection state machine, store traits
//! - `application/` - Challenge issuing, port allocation, sessions, worker pool, reaper
//! - `infra/` - PostgreSQL and in-memory stores, docker-compose runtime
//! - `presentation/` - WebSocket transport and HTTP routes
//!
//! ## Concurrency Model
//! - Job rows are the only shared mutable state; claims use skip-locked row locks
//! - Running/queued counts are recomputed inside every claim transaction, never cached
//! - Each connection's protocol state is owned by its session task alone
//! - Per-job failures become job state transitions; worker and reaper loops never exit

pub mod application;
pub mod domain;
pub mod error;
pub mod infra;
pub mod presentation;

pub use application::config::HarnessConfig;
pub use application::reaper::Reaper;
pub use application::registry::ConnectionRegistry;
pub use application::worker::WorkerPool;
pub use error::{HarnessError, HarnessResult};
pub use infra::compose::ComposeRuntime;
pub use infra::memory::MemoryJobStore;
pub use infra::postgres::PgJobStore;
pub use presentation::handlers::HarnessAppState;
pub use presentation::router::harness_router;

pub use kernel::error::{
    app_error::{AppError, AppResult},
    kind::ErrorKind,
};
