//! In-process loopback platform
//!
//! A transport that answers every request locally. The daemon uses it in
//! `--loopback` mode and the test suites use it to inject outages, send
//! failures and latency without a network.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::transport::{PlatformReply, PlatformRequest, PlatformTransport, TransportError};
use crate::session::Session;
use crate::types::{PlatformId, SessionId};

/// Echo platform with switchable failure modes
pub struct LoopbackTransport {
    /// Platform name used in replies
    platform: PlatformId,
    /// Whether connect/heartbeat succeed
    reachable: AtomicBool,
    /// Number of upcoming sends that fail
    failing_sends: AtomicU32,
    /// Whether context propagation succeeds
    accepts_context: AtomicBool,
    /// Artificial latency per send
    latency_ms: AtomicU64,
    /// Artificial latency per heartbeat
    heartbeat_latency_ms: AtomicU64,
    /// Tokens reported per reply (0 = unreported)
    reported_tokens: AtomicU64,
    /// Successful sends
    sends: AtomicU64,
    /// Successful heartbeats
    heartbeats: AtomicU64,
    /// Contexts received through `sync_context`
    synced: Mutex<Vec<(SessionId, usize)>>,
}

impl LoopbackTransport {
    /// Create a reachable loopback platform
    pub fn new(platform: impl Into<PlatformId>) -> Self {
        Self {
            platform: platform.into(),
            reachable: AtomicBool::new(true),
            failing_sends: AtomicU32::new(0),
            accepts_context: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            heartbeat_latency_ms: AtomicU64::new(0),
            reported_tokens: AtomicU64::new(0),
            sends: AtomicU64::new(0),
            heartbeats: AtomicU64::new(0),
            synced: Mutex::new(Vec::new()),
        }
    }

    /// Add fixed latency to every send
    #[must_use]
    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    /// Report a fixed token count on every reply
    #[must_use]
    pub fn with_reported_tokens(self, tokens: u64) -> Self {
        self.reported_tokens.store(tokens, Ordering::Relaxed);
        self
    }

    /// Simulate the platform going away or coming back
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Make the next `count` sends fail
    pub fn fail_next_sends(&self, count: u32) {
        self.failing_sends.store(count, Ordering::SeqCst);
    }

    /// Accept or reject context propagation
    pub fn set_accepts_context(&self, accepts: bool) {
        self.accepts_context.store(accepts, Ordering::SeqCst);
    }

    /// Change send latency
    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(ms, Ordering::Relaxed);
    }

    /// Change heartbeat latency
    pub fn set_heartbeat_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.heartbeat_latency_ms.store(ms, Ordering::Relaxed);
    }

    /// Number of sends answered
    #[must_use]
    pub fn send_count(&self) -> u64 {
        self.sends.load(Ordering::Relaxed)
    }

    /// Number of heartbeats answered
    #[must_use]
    pub fn heartbeat_count(&self) -> u64 {
        self.heartbeats.load(Ordering::Relaxed)
    }

    /// Sessions pushed to this platform, with their entry counts
    #[must_use]
    pub fn synced_contexts(&self) -> Vec<(SessionId, usize)> {
        self.synced.lock().clone()
    }

    fn check_reachable(&self) -> Result<(), TransportError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Unreachable(format!(
                "{} is offline",
                self.platform
            )))
        }
    }

    fn take_send_failure(&self) -> bool {
        self.failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl PlatformTransport for LoopbackTransport {
    fn kind(&self) -> &str {
        "loopback"
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.check_reachable()
    }

    async fn heartbeat(&self) -> Result<(), TransportError> {
        let latency = self.heartbeat_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        self.check_reachable()?;
        self.heartbeats.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn send(&self, request: &PlatformRequest) -> Result<PlatformReply, TransportError> {
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        self.check_reachable()?;
        if self.take_send_failure() {
            return Err(TransportError::Unreachable(format!(
                "{} dropped the request",
                self.platform
            )));
        }

        self.sends.fetch_add(1, Ordering::Relaxed);
        let reported = self.reported_tokens.load(Ordering::Relaxed);
        Ok(PlatformReply {
            content: format!("[{}] {}", self.platform, request.content),
            tokens_used: (reported > 0).then_some(reported),
            duration_ms: Some(latency),
        })
    }

    async fn sync_context(&self, session: &Session) -> Result<(), TransportError> {
        self.check_reachable()?;
        if !self.accepts_context.load(Ordering::SeqCst) {
            return Err(TransportError::Status {
                code: 503,
                body: "context sync unavailable".to_string(),
            });
        }
        self.synced
            .lock()
            .push((session.id.clone(), session.context.len()));
        Ok(())
    }
}
