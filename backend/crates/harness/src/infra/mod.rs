//! Infrastructure Layer - Store backends and the container runtime

pub mod compose;
pub mod memory;
pub mod postgres;
