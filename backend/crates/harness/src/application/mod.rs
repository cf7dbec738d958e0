//! Application Layer - Use cases and long-running loops

pub mod challenge;
pub mod config;
pub mod jobs;
pub mod ports;
pub mod protocol;
pub mod reaper;
pub mod registry;
pub mod session;
pub mod worker;
