//! Per-platform supervised connection loop
//!
//! Each platform gets exactly one of these loops. It is the only writer of
//! the platform's [`ConnectionState`]; everyone else observes it through a
//! `watch` channel.
//!
//! ```text
//!  Disconnected ───▶ Connecting ───connect ok───▶ Connected
//!       ▲               │   ▲                         │
//!       └───────────────┘   │                         │ 3 consecutive
//!        connect failed     │ backoff                 │ failures
//!        (< threshold)      │ (1s, 2s, 4s .. 30s)     ▼
//!                           └──────────────────── Degraded
//! ```
//!
//! While not Connected the loop stops pulling jobs from its queue, so
//! requests accepted before an outage are dispatched after reconnection,
//! provided their deadline has not passed. Heartbeats run beside dispatch
//! rather than in front of it.

use std::sync::Arc;

use chrono::Utc;
use futures::future::{BoxFuture, OptionFuture};
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::transport::{PlatformReply, PlatformRequest, PlatformTransport, TransportError};
use super::{ConnectionConfig, ConnectionState, ConnectionStatus, SendError};
use crate::types::PlatformId;

/// A request waiting for dispatch
pub(crate) struct Job {
    pub(crate) request: PlatformRequest,
    pub(crate) reply: oneshot::Sender<Result<PlatformReply, SendError>>,
    pub(crate) cancel: CancellationToken,
    pub(crate) permit: OwnedSemaphorePermit,
    /// Request deadline, fixed when the job was accepted
    pub(crate) deadline: Instant,
}

/// Result of a dispatched send, reported back to the loop
enum Outcome {
    Success { epoch: u64 },
    Failure { epoch: u64, error: String },
}

pub(crate) struct Supervisor {
    platform: PlatformId,
    transport: Arc<dyn PlatformTransport>,
    config: ConnectionConfig,
    state_tx: watch::Sender<ConnectionState>,
    jobs: mpsc::Receiver<Job>,
    outcomes_tx: mpsc::UnboundedSender<Outcome>,
    outcomes_rx: mpsc::UnboundedReceiver<Outcome>,
    shutdown: CancellationToken,
    /// Reconnection attempt counter driving the backoff
    attempt: u32,
    /// Incremented on every successful connect; stale outcomes are ignored
    epoch: u64,
}

impl Supervisor {
    pub(crate) fn new(
        platform: PlatformId,
        transport: Arc<dyn PlatformTransport>,
        config: ConnectionConfig,
        state_tx: watch::Sender<ConnectionState>,
        jobs: mpsc::Receiver<Job>,
        shutdown: CancellationToken,
    ) -> Self {
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        Self {
            platform,
            transport,
            config,
            state_tx,
            jobs,
            outcomes_tx,
            outcomes_rx,
            shutdown,
            attempt: 0,
            epoch: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(platform = %self.platform, transport = self.transport.kind(), "Connection loop started");

        loop {
            let status = self.state_tx.borrow().status;
            let keep_going = match status {
                ConnectionStatus::Connected => self.serve().await,
                ConnectionStatus::Disconnected
                | ConnectionStatus::Connecting
                | ConnectionStatus::Degraded => self.reconnect().await,
            };
            if !keep_going {
                break;
            }
        }

        self.set_status(ConnectionStatus::Disconnected);
        self.jobs.close();
        while let Ok(job) = self.jobs.try_recv() {
            let _ = job.reply.send(Err(SendError::Closed {
                platform: self.platform.clone(),
            }));
        }
        info!(platform = %self.platform, "Connection loop stopped");
    }

    // ========================================================================
    // Reconnection
    // ========================================================================

    async fn reconnect(&mut self) -> bool {
        if self.attempt > 0 {
            let delay = self.config.backoff.delay_for_attempt(self.attempt - 1);
            debug!(
                platform = %self.platform,
                attempt = self.attempt,
                delay_ms = delay.as_millis() as u64,
                "Waiting before reconnect"
            );
            tokio::select! {
                () = self.shutdown.cancelled() => return false,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.set_status(ConnectionStatus::Connecting);

        let result = tokio::select! {
            () = self.shutdown.cancelled() => return false,
            r = tokio::time::timeout(self.config.connect_timeout(), self.transport.connect()) => {
                r.unwrap_or(Err(TransportError::Timeout))
            }
        };

        match result {
            Ok(()) => {
                self.attempt = 0;
                self.epoch += 1;
                self.state_tx.send_modify(|state| {
                    state.consecutive_failures = 0;
                    state.reconnect_attempts = 0;
                    state.last_heartbeat_at = Some(Utc::now());
                });
                self.set_status(ConnectionStatus::Connected);
            }
            Err(e) => {
                self.attempt = self.attempt.saturating_add(1);
                let threshold = self.config.failure_threshold;
                let attempts = self.attempt;
                let mut failures = 0;
                self.state_tx.send_modify(|state| {
                    state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                    state.reconnect_attempts = attempts;
                    failures = state.consecutive_failures;
                });
                warn!(
                    platform = %self.platform,
                    error = %e,
                    consecutive_failures = failures,
                    "Connect attempt failed"
                );
                let next = if failures >= threshold {
                    ConnectionStatus::Degraded
                } else {
                    ConnectionStatus::Disconnected
                };
                self.set_status(next);
            }
        }
        true
    }

    // ========================================================================
    // Connected operation
    // ========================================================================

    async fn serve(&mut self) -> bool {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        // At most one heartbeat in flight; dispatch continues while it runs
        let mut probe: Option<BoxFuture<'static, Result<(), TransportError>>> = None;

        loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => return false,

                Some(outcome) = self.outcomes_rx.recv() => {
                    if self.record_outcome(outcome) {
                        return true;
                    }
                }

                Some(result) = OptionFuture::from(probe.as_mut()), if probe.is_some() => {
                    probe = None;
                    if self.heartbeat_finished(result) {
                        return true;
                    }
                }

                _ = ticker.tick(), if probe.is_none() => probe = Some(self.heartbeat()),

                Some(job) = self.jobs.recv() => self.dispatch(job),
            }
        }
    }

    fn heartbeat(&self) -> BoxFuture<'static, Result<(), TransportError>> {
        let transport = Arc::clone(&self.transport);
        let timeout = self.config.heartbeat_timeout();
        Box::pin(async move {
            tokio::time::timeout(timeout, transport.heartbeat())
                .await
                .unwrap_or(Err(TransportError::Timeout))
        })
    }

    /// Record a heartbeat result; returns true when the connection degraded
    fn heartbeat_finished(&mut self, result: Result<(), TransportError>) -> bool {
        match result {
            Ok(()) => {
                self.state_tx.send_modify(|state| {
                    state.consecutive_failures = 0;
                    state.last_heartbeat_at = Some(Utc::now());
                });
                false
            }
            Err(e) => self.record_failure(&format!("heartbeat: {e}")),
        }
    }

    fn record_outcome(&mut self, outcome: Outcome) -> bool {
        match outcome {
            Outcome::Success { epoch } if epoch == self.epoch => {
                if self.state_tx.borrow().consecutive_failures > 0 {
                    self.state_tx
                        .send_modify(|state| state.consecutive_failures = 0);
                }
                false
            }
            Outcome::Failure { epoch, error } if epoch == self.epoch => {
                self.record_failure(&format!("send: {error}"))
            }
            _ => false,
        }
    }

    /// Count a failure; returns true when the threshold was reached
    fn record_failure(&mut self, error: &str) -> bool {
        let mut failures = 0;
        self.state_tx.send_modify(|state| {
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            failures = state.consecutive_failures;
        });
        warn!(
            platform = %self.platform,
            error = %error,
            consecutive_failures = failures,
            "Platform failure"
        );

        if failures >= self.config.failure_threshold {
            self.attempt = 1;
            self.set_status(ConnectionStatus::Degraded);
            true
        } else {
            false
        }
    }

    fn dispatch(&self, job: Job) {
        // The caller already gave up; dropping the job returns its permit
        if job.cancel.is_cancelled() || job.reply.is_closed() {
            debug!(platform = %self.platform, "Dropping abandoned request");
            return;
        }

        let transport = Arc::clone(&self.transport);
        let outcomes = self.outcomes_tx.clone();
        let platform = self.platform.clone();
        let timeout_ms = self.config.request_timeout_ms;
        let epoch = self.epoch;

        tokio::spawn(async move {
            let Job {
                request,
                reply,
                cancel,
                permit,
                deadline,
            } = job;

            let result = tokio::select! {
                () = cancel.cancelled() => Err(SendError::Cancelled { platform: platform.clone() }),
                r = tokio::time::timeout_at(deadline, transport.send(&request)) => match r {
                    Ok(Ok(reply)) => Ok(reply),
                    Ok(Err(source)) => Err(SendError::Transport { platform: platform.clone(), source }),
                    Err(_) => Err(SendError::Timeout {
                        platform: platform.clone(),
                        timeout_ms,
                    }),
                },
            };

            let outcome = match &result {
                Ok(_) => Some(Outcome::Success { epoch }),
                Err(SendError::Cancelled { .. }) => None,
                Err(e) => Some(Outcome::Failure {
                    epoch,
                    error: e.to_string(),
                }),
            };
            if let Some(outcome) = outcome {
                let _ = outcomes.send(outcome);
            }

            drop(permit);
            let _ = reply.send(result);
        });
    }

    fn set_status(&self, status: ConnectionStatus) {
        let previous = self.state_tx.borrow().status;
        if previous == status {
            return;
        }
        self.state_tx.send_modify(|state| state.status = status);

        match status {
            ConnectionStatus::Connected => {
                info!(platform = %self.platform, from = %previous, "Platform connected");
            }
            ConnectionStatus::Degraded => {
                warn!(platform = %self.platform, from = %previous, "Platform degraded, reconnecting with backoff");
            }
            _ => {
                debug!(platform = %self.platform, from = %previous, to = %status, "Connection status changed");
            }
        }
    }
}
