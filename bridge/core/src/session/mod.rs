//! Session Synchronizer
//!
//! Keeps one merged, bounded conversation per session and mirrors it to every
//! platform that has taken part in the session.
//!
//! ```text
//!  update(session, platform, messages)
//!        │
//!        ▼
//!  registry: DashMap<SessionId, handle> ──(create on first use)──▶ SessionActor
//!                                                                   │
//!   1. append in arrival order, fold overflow into summary          │
//!   2. reply with the merged snapshot                               │
//!   3. propagate to participants other than the originator ◀────────┘
//!      (failures → pending_propagation, retried on next update)
//! ```
//!
//! # Design
//!
//! - Single writer per session: the actor is the only owner of `Session`
//! - Sessions idle longer than `idle_ttl_secs` are evicted; the next command
//!   for the id creates a fresh session
//! - A participant that fails propagation `max_propagation_failures` times in
//!   a row leaves the participating set

mod actor;
mod window;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use window::{ContextMessage, ContextSummary, SessionContext, WindowLimits};

use crate::connection::{ConnectionManager, SendError};
use crate::types::{HistoryEntry, PlatformId, SessionId};
use actor::{Command, Registry, SessionActor, SessionHandle};

/// Attempts to reach a session actor before giving up
const DELIVERY_ATTEMPTS: usize = 2;

// ============================================================================
// Configuration
// ============================================================================

/// Session synchronizer settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Retained messages per session (N)
    pub window_size: usize,

    /// Idle time after which a session is evicted
    pub idle_ttl_secs: u64,

    /// Consecutive propagation failures before a platform leaves a session
    pub max_propagation_failures: u32,

    /// Commands buffered per session actor
    pub command_buffer: usize,

    /// Excerpts kept in a summary entry
    pub summary_excerpts: usize,

    /// Characters per summary excerpt
    pub excerpt_chars: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            window_size: 50,
            idle_ttl_secs: 1_800, // 30 min
            max_propagation_failures: 3,
            command_buffer: 32,
            summary_excerpts: 3,
            excerpt_chars: 80,
        }
    }
}

impl SessionConfig {
    /// Idle TTL as a Duration
    #[must_use]
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    /// Window limits for [`SessionContext::append`]
    #[must_use]
    pub fn limits(&self) -> WindowLimits {
        WindowLimits {
            window_size: self.window_size,
            excerpt_count: self.summary_excerpts,
            excerpt_chars: self.excerpt_chars,
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// Merged state of one session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Session id
    pub id: SessionId,
    /// Platforms that have taken part in the session
    pub participating_platforms: BTreeSet<PlatformId>,
    /// Bounded merged context
    pub context: SessionContext,
    /// When the session was created
    pub created_at: DateTime<Utc>,
    /// Last update or seed
    pub last_activity_at: DateTime<Utc>,
    /// Updates applied so far
    pub update_count: u64,
    /// Platforms whose last propagation failed
    pub pending_propagation: BTreeSet<PlatformId>,
}

impl Session {
    /// Empty session
    #[must_use]
    pub fn new(id: SessionId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            participating_platforms: BTreeSet::new(),
            context: SessionContext::default(),
            created_at: now,
            last_activity_at: now,
            update_count: 0,
            pending_propagation: BTreeSet::new(),
        }
    }

    /// Plain-text transcript of the merged context
    #[must_use]
    pub fn transcript(&self) -> String {
        self.context.render()
    }
}

// ============================================================================
// Propagation seam
// ============================================================================

/// Delivers a merged session context to one platform
#[async_trait]
pub trait ContextPropagator: Send + Sync {
    /// Push `session` to `platform`
    async fn propagate(&self, platform: &PlatformId, session: &Session) -> Result<(), SendError>;
}

#[async_trait]
impl ContextPropagator for ConnectionManager {
    async fn propagate(&self, platform: &PlatformId, session: &Session) -> Result<(), SendError> {
        self.sync_context(platform, session).await
    }
}

/// Synchronizer failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The synchronizer has been shut down
    #[error("session synchronizer is shut down")]
    Closed,

    /// The session actor could not be reached
    #[error("session {0} is unavailable")]
    Unavailable(SessionId),
}

// ============================================================================
// Synchronizer
// ============================================================================

/// Owner of every live session
pub struct SessionSynchronizer {
    config: SessionConfig,
    propagator: Arc<dyn ContextPropagator>,
    registry: Arc<Registry>,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
}

impl SessionSynchronizer {
    /// Create a synchronizer that propagates through `propagator`
    #[must_use]
    pub fn new(config: SessionConfig, propagator: Arc<dyn ContextPropagator>) -> Self {
        Self {
            config,
            propagator,
            registry: Arc::new(Registry::new()),
            next_generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// Synchronizer configuration
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Merge `messages` from `platform` into the session and propagate
    ///
    /// Returns the merged snapshot. Propagation runs after the snapshot is
    /// returned and never fails the update.
    pub async fn update(
        &self,
        session: &SessionId,
        platform: &PlatformId,
        messages: Vec<HistoryEntry>,
    ) -> Result<Session, SessionError> {
        self.call(session, |reply| Command::Update {
            platform: platform.clone(),
            messages: messages.clone(),
            reply,
        })
        .await
    }

    /// Seed a session with caller history if it has no context yet
    ///
    /// Returns whether the history was applied.
    pub async fn seed(
        &self,
        session: &SessionId,
        history: Vec<HistoryEntry>,
    ) -> Result<bool, SessionError> {
        self.call(session, |reply| Command::Seed {
            history: history.clone(),
            reply,
        })
        .await
    }

    /// Snapshot of a live session
    pub async fn get_context(&self, session: &SessionId) -> Option<Session> {
        let handle = self.registry.get(session).map(|h| h.clone())?;
        let (tx, rx) = oneshot::channel();
        handle.commands.send(Command::Get { reply: tx }).await.ok()?;
        rx.await.ok()
    }

    /// Remove `platform` from every live session
    ///
    /// Returns the number of sessions notified.
    pub async fn retire_platform(&self, platform: &PlatformId) -> usize {
        let handles: Vec<SessionHandle> = self.registry.iter().map(|e| e.value().clone()).collect();
        let mut notified = 0;
        for handle in handles {
            let command = Command::Retire {
                platform: platform.clone(),
            };
            if handle.commands.send(command).await.is_ok() {
                notified += 1;
            }
        }
        debug!(platform = %platform, sessions = notified, "Retired platform from sessions");
        notified
    }

    /// Number of live sessions
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.registry.len()
    }

    /// Stop every session actor
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn call<T>(
        &self,
        session: &SessionId,
        make: impl Fn(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        for _ in 0..DELIVERY_ATTEMPTS {
            if self.shutdown.is_cancelled() {
                return Err(SessionError::Closed);
            }
            let handle = self.handle(session);
            let (tx, rx) = oneshot::channel();

            // The actor may have been evicted between lookup and send
            if handle.commands.send(make(tx)).await.is_err() {
                self.forget(session, handle.generation);
                continue;
            }
            match rx.await {
                Ok(value) => return Ok(value),
                Err(_) => self.forget(session, handle.generation),
            }
        }
        if self.shutdown.is_cancelled() {
            Err(SessionError::Closed)
        } else {
            Err(SessionError::Unavailable(session.clone()))
        }
    }

    fn handle(&self, session: &SessionId) -> SessionHandle {
        self.registry
            .entry(session.clone())
            .or_insert_with(|| self.spawn(session.clone()))
            .clone()
    }

    fn spawn(&self, session: SessionId) -> SessionHandle {
        let (tx, rx) = mpsc::channel(self.config.command_buffer.max(1));
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let actor = SessionActor::new(
            session,
            self.config.clone(),
            Arc::clone(&self.propagator),
            rx,
            Arc::clone(&self.registry),
            generation,
            self.shutdown.child_token(),
        );
        tokio::spawn(actor.run());
        SessionHandle {
            commands: tx,
            generation,
        }
    }

    fn forget(&self, session: &SessionId, generation: u64) {
        self.registry
            .remove_if(session, |_, handle| handle.generation == generation);
    }
}

impl Drop for SessionSynchronizer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionStatus;
    use crate::types::MessageRole;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct RecordingPropagator {
        failing: Mutex<BTreeSet<PlatformId>>,
        delivered: Mutex<Vec<(PlatformId, SessionId, usize)>>,
    }

    impl RecordingPropagator {
        fn fail(&self, platform: &str) {
            self.failing.lock().insert(PlatformId::from(platform));
        }

        fn heal(&self, platform: &str) {
            self.failing.lock().remove(&PlatformId::from(platform));
        }

        fn delivered_to(&self, platform: &str) -> usize {
            let platform = PlatformId::from(platform);
            self.delivered
                .lock()
                .iter()
                .filter(|(p, _, _)| *p == platform)
                .count()
        }
    }

    #[async_trait]
    impl ContextPropagator for RecordingPropagator {
        async fn propagate(&self, platform: &PlatformId, session: &Session) -> Result<(), SendError> {
            if self.failing.lock().contains(platform) {
                return Err(SendError::NotConnected {
                    platform: platform.clone(),
                    status: ConnectionStatus::Degraded,
                });
            }
            self.delivered
                .lock()
                .push((platform.clone(), session.id.clone(), session.context.len()));
            Ok(())
        }
    }

    fn user(text: &str) -> Vec<HistoryEntry> {
        vec![HistoryEntry {
            role: MessageRole::User,
            content: text.to_string(),
        }]
    }

    fn synchronizer(config: SessionConfig) -> (SessionSynchronizer, Arc<RecordingPropagator>) {
        let propagator = Arc::new(RecordingPropagator::default());
        let sync = SessionSynchronizer::new(config, Arc::clone(&propagator) as Arc<dyn ContextPropagator>);
        (sync, propagator)
    }

    #[tokio::test]
    async fn test_update_creates_session() {
        let (sync, _) = synchronizer(SessionConfig::default());
        let id = SessionId::new("s1");
        let alpha = PlatformId::from("alpha");

        assert!(sync.get_context(&id).await.is_none());
        let session = sync.update(&id, &alpha, user("hello")).await.unwrap();

        assert_eq!(session.update_count, 1);
        assert!(session.participating_platforms.contains(&alpha));
        assert_eq!(session.context.len(), 1);
        assert_eq!(sync.active_sessions(), 1);

        let fetched = sync.get_context(&id).await.unwrap();
        assert_eq!(fetched, session);
    }

    #[tokio::test]
    async fn test_propagates_to_other_participants() {
        let (sync, propagator) = synchronizer(SessionConfig::default());
        let id = SessionId::new("s1");

        sync.update(&id, &PlatformId::from("alpha"), user("a")).await.unwrap();
        assert_eq!(propagator.delivered_to("alpha"), 0);

        sync.update(&id, &PlatformId::from("beta"), user("b")).await.unwrap();
        // Snapshot is returned before propagation; Get queues behind it
        sync.get_context(&id).await.unwrap();
        assert_eq!(propagator.delivered_to("alpha"), 1);
        assert_eq!(propagator.delivered_to("beta"), 0);
    }

    #[tokio::test]
    async fn test_failed_propagation_is_retried() {
        let (sync, propagator) = synchronizer(SessionConfig::default());
        let id = SessionId::new("s1");
        let alpha = PlatformId::from("alpha");
        let beta = PlatformId::from("beta");

        sync.update(&id, &alpha, user("a")).await.unwrap();
        propagator.fail("alpha");
        sync.update(&id, &beta, user("b")).await.unwrap();

        let session = sync.get_context(&id).await.unwrap();
        assert!(session.pending_propagation.contains(&alpha));
        assert!(session.participating_platforms.contains(&alpha));

        propagator.heal("alpha");
        sync.update(&id, &beta, user("c")).await.unwrap();
        let session = sync.get_context(&id).await.unwrap();
        assert!(session.pending_propagation.is_empty());
        assert_eq!(propagator.delivered_to("alpha"), 1);
    }

    #[tokio::test]
    async fn test_repeated_failures_remove_participant() {
        let config = SessionConfig {
            max_propagation_failures: 2,
            ..SessionConfig::default()
        };
        let (sync, propagator) = synchronizer(config);
        let id = SessionId::new("s1");
        let alpha = PlatformId::from("alpha");
        let beta = PlatformId::from("beta");

        sync.update(&id, &alpha, user("a")).await.unwrap();
        propagator.fail("alpha");
        sync.update(&id, &beta, user("b")).await.unwrap();
        sync.update(&id, &beta, user("c")).await.unwrap();

        let session = sync.get_context(&id).await.unwrap();
        assert!(!session.participating_platforms.contains(&alpha));
        assert!(session.pending_propagation.is_empty());
        // Its messages stay in the merged context
        assert_eq!(session.context.len(), 3);
    }

    #[tokio::test]
    async fn test_retire_platform() {
        let (sync, _) = synchronizer(SessionConfig::default());
        let alpha = PlatformId::from("alpha");
        for id in ["s1", "s2"] {
            sync.update(&SessionId::new(id), &alpha, user("x")).await.unwrap();
        }

        assert_eq!(sync.retire_platform(&alpha).await, 2);
        for id in ["s1", "s2"] {
            let session = sync.get_context(&SessionId::new(id)).await.unwrap();
            assert!(session.participating_platforms.is_empty());
        }
    }

    #[tokio::test]
    async fn test_seed_only_applies_to_empty_session() {
        let (sync, _) = synchronizer(SessionConfig::default());
        let id = SessionId::new("s1");

        assert!(sync.seed(&id, user("earlier")).await.unwrap());
        assert!(!sync.seed(&id, user("again")).await.unwrap());

        let session = sync.get_context(&id).await.unwrap();
        assert_eq!(session.context.len(), 1);
        assert!(session.context.messages[0].platform.is_none());
        assert_eq!(session.update_count, 0);
    }

    #[tokio::test]
    async fn test_interleaved_updates_keep_submission_order() {
        let config = SessionConfig {
            window_size: 200,
            ..SessionConfig::default()
        };
        let (sync, _) = synchronizer(config);
        let sync = Arc::new(sync);
        let id = SessionId::new("shared");

        let mut tasks = Vec::new();
        for p in ["alpha", "beta", "gamma"] {
            let sync = Arc::clone(&sync);
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                let platform = PlatformId::from(p);
                for i in 0..20 {
                    sync.update(&id, &platform, user(&format!("{p}-{i}"))).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let session = sync.get_context(&id).await.unwrap();
        assert_eq!(session.context.messages.len(), 60);
        let seqs: Vec<u64> = session.context.messages.iter().map(|m| m.seq).collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));

        for p in ["alpha", "beta", "gamma"] {
            let own: Vec<String> = session
                .context
                .messages
                .iter()
                .filter(|m| m.platform.as_ref().map(PlatformId::as_str) == Some(p))
                .map(|m| m.content.clone())
                .collect();
            let expected: Vec<String> = (0..20).map(|i| format!("{p}-{i}")).collect();
            assert_eq!(own, expected);
        }
    }

    #[tokio::test]
    async fn test_window_bound_with_summary() {
        let config = SessionConfig {
            window_size: 10,
            ..SessionConfig::default()
        };
        let (sync, _) = synchronizer(config);
        let id = SessionId::new("s1");
        for i in 0..35 {
            let platform = if i % 2 == 0 { "alpha" } else { "beta" };
            sync.update(&id, &PlatformId::from(platform), user(&format!("m{i}")))
                .await
                .unwrap();
        }

        let session = sync.get_context(&id).await.unwrap();
        assert!(session.context.len() <= 11);
        let summary = session.context.summary.as_ref().unwrap();
        assert_eq!(summary.folded, 25);
        assert_eq!(session.context.messages.back().unwrap().content, "m34");
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_is_evicted() {
        let config = SessionConfig {
            idle_ttl_secs: 60,
            ..SessionConfig::default()
        };
        let (sync, _) = synchronizer(config);
        let id = SessionId::new("s1");
        let alpha = PlatformId::from("alpha");

        sync.update(&id, &alpha, user("a")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;

        assert!(sync.get_context(&id).await.is_none());
        assert_eq!(sync.active_sessions(), 0);

        // Next update transparently recreates it
        let session = sync.update(&id, &alpha, user("b")).await.unwrap();
        assert_eq!(session.update_count, 1);
        assert_eq!(session.context.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_updates() {
        let (sync, _) = synchronizer(SessionConfig::default());
        sync.shutdown();
        let result = sync
            .update(&SessionId::new("s1"), &PlatformId::from("alpha"), user("x"))
            .await;
        assert_eq!(result, Err(SessionError::Closed));
    }
}
