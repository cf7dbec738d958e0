//! Port Allocator
//!
//! Draws even candidate ports and reserves the first one that no live job
//! holds, inside the caller's transaction. The attempt budget is bounded;
//! running out is reported as `PortExhaustion`.

use crate::domain::repository::JobTransaction;
use crate::domain::value_objects::Port;
use crate::error::{HarnessError, HarnessResult};
use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct PortAllocator {
    max_attempts: u32,
}

impl PortAllocator {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    pub async fn allocate<T>(&self, tx: &mut T) -> HarnessResult<Port>
    where
        T: JobTransaction,
    {
        self.allocate_with(tx, || rand::rng().random_range(0..Port::DRAW_SPAN))
            .await
    }

    /// Allocate using `draw` as the candidate source
    pub async fn allocate_with<T, F>(&self, tx: &mut T, mut draw: F) -> HarnessResult<Port>
    where
        T: JobTransaction,
        F: FnMut() -> u32,
    {
        for attempt in 1..=self.max_attempts {
            let candidate = Port::from_draw(draw());
            if tx.try_reserve_port(candidate).await? {
                return Ok(candidate);
            }
            tracing::debug!(port = candidate.get(), attempt, "Port candidate taken");
        }

        Err(HarnessError::PortExhaustion {
            attempts: self.max_attempts,
        })
    }
}
