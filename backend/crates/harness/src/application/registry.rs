//! Connection Registry
//!
//! Maps connection ids stored on job rows to live sessions. Workers and the
//! reaper never touch a session's state directly; they post
//! [`ConnectionEvent`]s and the session applies them itself.
//!
//! The registry also holds one release signal per launched job, so a
//! disconnect hook stops waiting once its job has been reaped.

use crate::domain::entities::JobResponse;
use chrono::{DateTime, Utc};
use kernel::id::{ConnectionId, JobId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};

/// Job progress posted to a session on the job's behalf
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Accepted {
        job_id: JobId,
        response: JobResponse,
        launch_at: DateTime<Utc>,
    },
    Processing {
        job_id: JobId,
        lease_until: DateTime<Utc>,
    },
    Done {
        job_id: JobId,
    },
}

/// Sending side of one session's event channel
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns `false` when the session is already gone
    pub fn notify(&self, event: ConnectionEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn is_live(&self) -> bool {
        !self.events.is_closed()
    }

    /// Resolves once the session has dropped its receiver
    pub async fn closed(&self) {
        self.events.closed().await
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<ConnectionId, ConnectionHandle>>>,
    job_releases: Arc<Mutex<HashMap<JobId, oneshot::Sender<()>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection and hand back its event receiver
    pub fn register(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, ConnectionHandle { id, events: tx });
        (id, rx)
    }

    pub fn unregister(&self, id: ConnectionId) {
        self.connections
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id);
    }

    /// Look up a connection; the handle may still report `is_live() == false`
    pub fn get(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.connections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signal that resolves once [`release_job`](Self::release_job) is called for `job_id`
    pub fn watch_job(&self, job_id: JobId) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.job_releases
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(job_id, tx);
        rx
    }

    /// Fire and forget the job's release signal; `false` if nobody was watching
    pub fn release_job(&self, job_id: JobId) -> bool {
        let release = self
            .job_releases
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&job_id);
        match release {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    pub fn watched_jobs(&self) -> usize {
        self.job_releases
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_notify() {
        let registry = ConnectionRegistry::new();
        let (id, mut rx) = registry.register();
        assert_eq!(registry.len(), 1);

        let handle = registry.get(id).unwrap();
        assert!(handle.is_live());
        let job_id = JobId::new();
        assert!(handle.notify(ConnectionEvent::Done { job_id }));
        assert_eq!(rx.recv().await, Some(ConnectionEvent::Done { job_id }));
    }

    #[tokio::test]
    async fn test_dropped_receiver_closes_handle() {
        let registry = ConnectionRegistry::new();
        let (id, rx) = registry.register();
        let handle = registry.get(id).unwrap();

        drop(rx);
        handle.closed().await;
        assert!(!handle.is_live());
        assert!(!handle.notify(ConnectionEvent::Done { job_id: JobId::new() }));

        registry.unregister(id);
        assert!(registry.get(id).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_release_job_resolves_watcher() {
        let registry = ConnectionRegistry::new();
        let job_id = JobId::new();
        let released = registry.watch_job(job_id);
        assert_eq!(registry.watched_jobs(), 1);

        assert!(registry.release_job(job_id));
        assert!(released.await.is_ok());
        assert_eq!(registry.watched_jobs(), 0);
        assert!(!registry.release_job(job_id));
    }
}
