//! Container Runtime Trait

use crate::domain::value_objects::Port;
use crate::error::HarnessResult;
use kernel::id::JobId;

/// Brings per-job containers up and down
#[trait_variant::make(ContainerRuntime: Send)]
pub trait LocalContainerRuntime {
    /// Start the job's container with `port` published. Must not build images.
    async fn up(&self, job_id: JobId, port: Port) -> HarnessResult<()>;

    /// Tear the job's container down with no grace period
    async fn down(&self, job_id: JobId) -> HarnessResult<()>;
}
