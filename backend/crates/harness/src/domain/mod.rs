//! Domain Layer - Business rules with no I/O
//!
//! - Entities (Job, Challenge) and value objects (Difficulty, Port)
//! - Proof-of-work verification
//! - Connection protocol state machine
//! - Store and container-runtime traits (implemented in `infra/`)

pub mod connection;
pub mod entities;
pub mod repository;
pub mod runtime;
pub mod services;
pub mod value_objects;
