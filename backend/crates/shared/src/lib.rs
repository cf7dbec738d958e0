//! Shared Kernel - Vocabulary shared by every harness crate
//!
//! - Unified error type ([`error::app_error::AppError`]) and its classification
//! - Typed identifiers for jobs, challenges and live connections
//!
//! Nothing in here knows about queues, containers or proof-of-work.

pub mod error {
    pub mod app_error;
    pub mod conversions;
    pub mod kind;
}
pub mod id;
