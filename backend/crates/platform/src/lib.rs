//! Platform Crate - Technical Infrastructure
//!
//! Shared technical foundations with no harness vocabulary:
//! - Cryptographic utilities (random material, SHA-256)
//! - Subprocess execution with stderr forwarding and timeouts

pub mod crypto;
pub mod process;
