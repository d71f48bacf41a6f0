//! Per-session actor
//!
//! Every live session is owned by exactly one task. Commands arrive over an
//! mpsc channel and are handled one at a time, so no two updates to the same
//! session ever interleave. Sessions do not share tasks or locks, so
//! different sessions proceed in parallel.
//!
//! ```text
//!   SessionSynchronizer ──mpsc<Command>──▶ SessionActor ──▶ ContextPropagator
//!                                            │ (owns Session)     (best effort)
//!                                            └── idle TTL ──▶ evict from registry
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ContextPropagator, Session, SessionConfig};
use crate::types::{HistoryEntry, PlatformId, SessionId};

/// Messages handled by a session actor
pub(super) enum Command {
    /// Append messages produced by (or sent to) a platform
    Update {
        platform: PlatformId,
        messages: Vec<HistoryEntry>,
        reply: oneshot::Sender<Session>,
    },
    /// Seed an empty session with caller history
    Seed {
        history: Vec<HistoryEntry>,
        reply: oneshot::Sender<bool>,
    },
    /// Snapshot the session
    Get { reply: oneshot::Sender<Session> },
    /// Drop a platform from the participating set
    Retire { platform: PlatformId },
}

/// Registry entry for a live actor
#[derive(Clone, Debug)]
pub(super) struct SessionHandle {
    pub(super) commands: mpsc::Sender<Command>,
    pub(super) generation: u64,
}

pub(super) type Registry = DashMap<SessionId, SessionHandle>;

pub(super) struct SessionActor {
    session: Session,
    failures: BTreeMap<PlatformId, u32>,
    config: SessionConfig,
    propagator: Arc<dyn ContextPropagator>,
    commands: mpsc::Receiver<Command>,
    registry: Arc<Registry>,
    generation: u64,
    shutdown: CancellationToken,
}

impl SessionActor {
    pub(super) fn new(
        id: SessionId,
        config: SessionConfig,
        propagator: Arc<dyn ContextPropagator>,
        commands: mpsc::Receiver<Command>,
        registry: Arc<Registry>,
        generation: u64,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            session: Session::new(id, Utc::now()),
            failures: BTreeMap::new(),
            config,
            propagator,
            commands,
            registry,
            generation,
            shutdown,
        }
    }

    pub(super) async fn run(mut self) {
        let idle_ttl = self.config.idle_ttl();
        debug!(session = %self.session.id, "Session created");

        loop {
            let command = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                received = tokio::time::timeout(idle_ttl, self.commands.recv()) => match received {
                    Ok(Some(command)) => command,
                    Ok(None) => break,
                    Err(_) => {
                        info!(
                            session = %self.session.id,
                            updates = self.session.update_count,
                            idle_secs = idle_ttl.as_secs(),
                            "Session evicted after idle TTL"
                        );
                        break;
                    }
                },
            };
            self.handle(command).await;
        }

        // A newer actor may already own the id
        let generation = self.generation;
        self.registry
            .remove_if(&self.session.id, |_, handle| handle.generation == generation);
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Update {
                platform,
                messages,
                reply,
            } => {
                self.apply_update(&platform, messages);
                let _ = reply.send(self.session.clone());
                self.propagate(&platform).await;
            }
            Command::Seed { history, reply } => {
                let seeded = self.session.context.is_empty() && !history.is_empty();
                if seeded {
                    let now = Utc::now();
                    let limits = self.config.limits();
                    for entry in history {
                        self.session
                            .context
                            .append(entry.role, entry.content, None, now, limits);
                    }
                    self.session.last_activity_at = now;
                }
                let _ = reply.send(seeded);
            }
            Command::Get { reply } => {
                let _ = reply.send(self.session.clone());
            }
            Command::Retire { platform } => {
                if self.session.participating_platforms.remove(&platform) {
                    info!(session = %self.session.id, platform = %platform, "Platform retired from session");
                }
                self.session.pending_propagation.remove(&platform);
                self.failures.remove(&platform);
            }
        }
    }

    fn apply_update(&mut self, platform: &PlatformId, messages: Vec<HistoryEntry>) {
        let now = Utc::now();
        let limits = self.config.limits();
        for entry in messages {
            self.session
                .context
                .append(entry.role, entry.content, Some(platform.clone()), now, limits);
        }
        self.session.participating_platforms.insert(platform.clone());
        self.session.last_activity_at = now;
        self.session.update_count += 1;

        // The originator has just seen the merged transcript
        self.session.pending_propagation.remove(platform);
        self.failures.remove(platform);
    }

    /// Push the merged context to every other participant
    async fn propagate(&mut self, origin: &PlatformId) {
        let targets: Vec<PlatformId> = self
            .session
            .participating_platforms
            .iter()
            .filter(|p| *p != origin)
            .cloned()
            .collect();
        if targets.is_empty() {
            return;
        }

        let session = &self.session;
        let propagator = &self.propagator;
        let results = join_all(
            targets
                .iter()
                .map(|platform| async move { propagator.propagate(platform, session).await }),
        )
        .await;

        for (platform, result) in targets.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    if self.session.pending_propagation.remove(&platform) {
                        debug!(session = %self.session.id, platform = %platform, "Pending propagation delivered");
                    }
                    self.failures.remove(&platform);
                }
                Err(error) => {
                    let failures = self.failures.entry(platform.clone()).or_insert(0);
                    *failures += 1;
                    let failures = *failures;

                    if failures >= self.config.max_propagation_failures.max(1) {
                        self.session.participating_platforms.remove(&platform);
                        self.session.pending_propagation.remove(&platform);
                        self.failures.remove(&platform);
                        warn!(
                            session = %self.session.id,
                            platform = %platform,
                            failures,
                            error = %error,
                            "Removed platform from session after repeated propagation failures"
                        );
                    } else {
                        self.session.pending_propagation.insert(platform.clone());
                        warn!(
                            session = %self.session.id,
                            platform = %platform,
                            failures,
                            error = %error,
                            "Context propagation failed, will retry on next update"
                        );
                    }
                }
            }
        }
    }
}
