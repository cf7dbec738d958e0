//! Presentation Layer
//!
//! WebSocket transport, HTTP handlers and DTOs.

pub mod dto;
pub mod handlers;
pub mod router;
pub mod socket;
