//! Connection Session
//!
//! Drives one client connection. The session task is the only owner of the
//! connection's [`ConnectionState`]; client frames, worker/reaper events and
//! the position ticker are multiplexed onto it. Any error ends the session
//! with an `error` message followed by a forced close.

use crate::application::challenge::{ChallengeService, ValidationOutcome};
use crate::application::config::HarnessConfig;
use crate::application::jobs::{expire_job, queue_position};
use crate::application::protocol::{ClientMessage, ServerMessage};
use crate::application::registry::{ConnectionEvent, ConnectionRegistry};
use crate::domain::connection::{ConnectionState, StateKind, Trigger};
use crate::domain::repository::JobStore;
use crate::error::{HarnessError, HarnessResult};
use kernel::id::ConnectionId;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};

/// Duplex message channel to one client
#[trait_variant::make(Transport: Send)]
pub trait LocalTransport {
    /// Next client message; `None` once the peer is gone
    async fn recv(&mut self) -> Option<HarnessResult<ClientMessage>>;

    async fn send(&mut self, message: ServerMessage) -> HarnessResult<()>;

    async fn close(&mut self);
}

pub struct Session<S, T>
where
    S: JobStore + 'static,
    T: Transport,
{
    id: ConnectionId,
    transport: T,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    state: ConnectionState,
    position_ticker: Interval,
    store: Arc<S>,
    challenges: Arc<ChallengeService<S>>,
    registry: ConnectionRegistry,
}

impl<S, T> Session<S, T>
where
    S: JobStore + 'static,
    T: Transport,
{
    pub fn new(
        transport: T,
        store: Arc<S>,
        challenges: Arc<ChallengeService<S>>,
        registry: ConnectionRegistry,
        config: &HarnessConfig,
    ) -> Self {
        let (id, events) = registry.register();
        let mut position_ticker = tokio::time::interval(config.position_interval);
        position_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            id,
            transport,
            events,
            state: ConnectionState::Waiting,
            position_ticker,
            store,
            challenges,
            registry,
        }
    }

    pub async fn run(mut self) {
        tracing::debug!(connection_id = %self.id, "Connection opened");

        loop {
            let step = tokio::select! {
                frame = self.transport.recv() => match frame {
                    None => break,
                    Some(Ok(message)) => self.on_message(message).await,
                    Some(Err(e)) => Err(e),
                },
                Some(event) = self.events.recv() => self.on_event(event).await,
                _ = self.position_ticker.tick(), if self.state.kind() == StateKind::Queued => {
                    self.send_position().await
                }
            };

            if let Err(e) = step {
                e.log();
                let _ = self
                    .transport
                    .send(ServerMessage::Error {
                        message: e.client_message(),
                    })
                    .await;
                break;
            }
        }

        self.finish().await;
    }

    async fn on_message(&mut self, message: ClientMessage) -> HarnessResult<()> {
        tracing::debug!(
            connection_id = %self.id,
            message = message.name(),
            state = %self.state.kind(),
            "Client message"
        );

        match message {
            ClientMessage::SubmitJob { request } => {
                self.state.expect("submitJob", StateKind::Waiting)?;
                let challenge = self.challenges.generate_challenge().await?;
                let reply = ServerMessage::Challenge {
                    id: challenge.id,
                    prefix: challenge.prefix.clone(),
                    difficulty: challenge.difficulty,
                };
                self.transition(Trigger::SubmitRequest { request, challenge })?;
                self.transport.send(reply).await
            }
            ClientMessage::SubmitChallenge { response } => {
                let ConnectionState::Challenge { request, challenge } = &self.state else {
                    return Err(HarnessError::ProtocolViolation(format!(
                        "submitChallenge not allowed in {} state",
                        self.state.kind()
                    )));
                };

                let outcome = self
                    .challenges
                    .validate_challenge(challenge.id, &response, request.clone(), self.id)
                    .await?;

                match outcome {
                    ValidationOutcome::Mismatch => Err(HarnessError::ProofOfWorkMismatch),
                    ValidationOutcome::Accepted { job_id, port } => {
                        self.transition(Trigger::ProofAccepted { job_id })?;
                        self.transport.send(ServerMessage::Queued { port }).await?;
                        self.position_ticker.reset();
                        self.send_position().await
                    }
                }
            }
        }
    }

    async fn on_event(&mut self, event: ConnectionEvent) -> HarnessResult<()> {
        match event {
            ConnectionEvent::Accepted {
                job_id,
                response,
                launch_at,
            } => {
                self.transition(Trigger::WorkerClaimed {
                    job_id,
                    response: response.clone(),
                    launch_at,
                })?;
                self.transport
                    .send(ServerMessage::Accepted {
                        response,
                        launch_at_ms: launch_at.timestamp_millis(),
                    })
                    .await
            }
            ConnectionEvent::Processing {
                job_id,
                lease_until,
            } => {
                self.transition(Trigger::LaunchElapsed {
                    job_id,
                    lease_until,
                })?;
                let ConnectionState::Processing { response, .. } = &self.state else {
                    return Err(HarnessError::Internal(
                        "processing transition left another state".to_string(),
                    ));
                };
                let message = ServerMessage::Processing {
                    response: response.clone(),
                    lease_until_ms: lease_until.timestamp_millis(),
                };
                self.transport.send(message).await
            }
            ConnectionEvent::Done { job_id } => {
                self.transition(Trigger::Reaped { job_id })?;
                self.transport.send(ServerMessage::Done).await
            }
        }
    }

    /// Position updates are advisory; store errors are logged and skipped
    async fn send_position(&mut self) -> HarnessResult<()> {
        let ConnectionState::Queued { job_id, .. } = self.state else {
            return Ok(());
        };

        match queue_position(self.store.as_ref(), job_id).await {
            Ok(ahead) => self.transport.send(ServerMessage::Position { ahead }).await,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to read queue position");
                Ok(())
            }
        }
    }

    fn transition(&mut self, trigger: Trigger) -> HarnessResult<()> {
        let state = std::mem::take(&mut self.state);
        self.state = state.apply(trigger)?;
        Ok(())
    }

    async fn finish(mut self) {
        self.registry.unregister(self.id);
        // closes the channel so disconnect hooks fire
        self.events.close();

        let cleanup = match &self.state {
            ConnectionState::Challenge { challenge, .. } => {
                self.challenges.discard_challenge(challenge.id).await
            }
            state => match state.job_id() {
                Some(job_id) => expire_job(self.store.as_ref(), job_id).await.map(|_| ()),
                None => Ok(()),
            },
        };
        if let Err(e) = cleanup {
            e.log();
        }

        self.transport.close().await;
        tracing::debug!(connection_id = %self.id, "Connection closed");
    }
}
