//! API DTOs (Data Transfer Objects)

use serde::Serialize;

/// Response for GET /status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub queued: u64,
    pub running: u64,
    pub max_instances: u64,
    pub connections: usize,
}
