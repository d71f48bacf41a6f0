//! Connection Manager
//!
//! Owns one persistent, supervised channel per backend platform.
//!
//! ```text
//!                       ConnectionManager
//!     send(platform) ──▶ status check ──▶ in-flight permit ──▶ queue
//!                            │ (fail fast)      │ (Backpressure)   │
//!                            ▼                  ▼                  ▼
//!                    ┌─────────────────────────────────────────────────┐
//!                    │ Supervisor (one tokio task per platform)        │
//!                    │  connect ─ heartbeat ticker ─ dispatch ─ backoff│
//!                    └──────────────────────┬──────────────────────────┘
//!                                           │ watch<ConnectionState>
//!                                           ▼
//!                                  health() / statuses()
//! ```
//!
//! # Design
//!
//! - `ConnectionState` is written only by the platform's supervisor loop
//! - `send` fails fast with [`SendError::NotConnected`] unless the platform
//!   is Connected; callers are expected to route elsewhere
//! - At most `max_in_flight` requests per platform are queued or running;
//!   beyond that `send` fails with [`SendError::Backpressure`]
//! - Dropping a `send` future cancels the transport call it started
//! - The request timeout covers queueing as well as the transport call; a
//!   request that expires while its platform is down reports NotConnected

mod backoff;
mod http;
mod loopback;
mod supervisor;
mod transport;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use backoff::BackoffConfig;
pub use http::HttpTransport;
pub use loopback::LoopbackTransport;
pub use transport::{PlatformReply, PlatformRequest, PlatformTransport, TransportError};

use crate::session::Session;
use crate::types::PlatformId;
use supervisor::{Job, Supervisor};

// ============================================================================
// Configuration
// ============================================================================

/// Connection lifecycle parameters shared by all platforms
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Interval between heartbeats while Connected
    pub heartbeat_interval_ms: u64,

    /// How long a heartbeat may take before it counts as failed
    pub heartbeat_timeout_ms: u64,

    /// How long a connect attempt may take
    pub connect_timeout_ms: u64,

    /// Consecutive failures before a platform is marked Degraded
    pub failure_threshold: u32,

    /// Maximum queued plus running requests per platform
    pub max_in_flight: usize,

    /// Per-request deadline for a single platform send
    pub request_timeout_ms: u64,

    /// Reconnection backoff
    pub backoff: BackoffConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000, // 5s
            heartbeat_timeout_ms: 2_000,  // 2s
            connect_timeout_ms: 5_000,    // 5s
            failure_threshold: 3,
            max_in_flight: 100,
            request_timeout_ms: 60_000, // 60s
            backoff: BackoffConfig::default(),
        }
    }
}

impl ConnectionConfig {
    /// Get heartbeat interval as Duration
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    /// Get heartbeat timeout as Duration
    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Get connect timeout as Duration
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Get request timeout as Duration
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// ============================================================================
// State
// ============================================================================

/// Lifecycle status of a platform connection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Not connected, no attempt in progress
    #[default]
    Disconnected,
    /// Connect attempt in progress
    Connecting,
    /// Connected and accepting requests
    Connected,
    /// Repeated failures; reconnecting with backoff
    Degraded,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Degraded => write!(f, "degraded"),
        }
    }
}

/// Observable state of one platform connection
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    /// Platform this state belongs to
    pub platform: PlatformId,
    /// Current lifecycle status
    pub status: ConnectionStatus,
    /// Heartbeat, send or connect failures since the last success
    pub consecutive_failures: u32,
    /// Last successful heartbeat (or connect)
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Reconnection attempts since the last successful connect
    pub reconnect_attempts: u32,
}

impl ConnectionState {
    fn new(platform: PlatformId) -> Self {
        Self {
            platform,
            status: ConnectionStatus::Disconnected,
            consecutive_failures: 0,
            last_heartbeat_at: None,
            reconnect_attempts: 0,
        }
    }

    /// Whether requests may be sent right now
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Why a send did not produce a reply
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    /// Platform was not Connected when the request arrived
    #[error("{platform} is {status}")]
    NotConnected {
        /// Target platform
        platform: PlatformId,
        /// Status at the time of the request
        status: ConnectionStatus,
    },

    /// Transport failed while handling the request
    #[error("{platform} transport failure: {source}")]
    Transport {
        /// Target platform
        platform: PlatformId,
        /// Underlying failure
        source: TransportError,
    },

    /// In-flight bound reached
    #[error("{platform} has too many requests in flight")]
    Backpressure {
        /// Target platform
        platform: PlatformId,
    },

    /// No reply within the request deadline
    #[error("{platform} did not answer within {timeout_ms}ms")]
    Timeout {
        /// Target platform
        platform: PlatformId,
        /// Deadline that was exceeded
        timeout_ms: u64,
    },

    /// Caller cancelled the request
    #[error("request to {platform} cancelled")]
    Cancelled {
        /// Target platform
        platform: PlatformId,
    },

    /// Connection loop has stopped
    #[error("connection to {platform} closed")]
    Closed {
        /// Target platform
        platform: PlatformId,
    },

    /// Platform was never opened
    #[error("unknown platform {0}")]
    UnknownPlatform(PlatformId),
}

impl SendError {
    /// Whether this is a transport-level connection failure
    ///
    /// Connection failures are the ones the facade fails over on and the
    /// circuit breaker counts.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::NotConnected { .. }
                | Self::Transport { .. }
                | Self::Closed { .. }
                | Self::UnknownPlatform(_)
        )
    }

    /// Platform the error refers to
    #[must_use]
    pub fn platform(&self) -> &PlatformId {
        match self {
            Self::NotConnected { platform, .. }
            | Self::Transport { platform, .. }
            | Self::Backpressure { platform }
            | Self::Timeout { platform, .. }
            | Self::Cancelled { platform }
            | Self::Closed { platform } => platform,
            Self::UnknownPlatform(platform) => platform,
        }
    }
}

// ============================================================================
// Manager
// ============================================================================

struct PlatformLink {
    jobs: mpsc::Sender<Job>,
    permits: Arc<Semaphore>,
    state: watch::Receiver<ConnectionState>,
    transport: Arc<dyn PlatformTransport>,
    task: JoinHandle<()>,
}

/// Owns the supervised connection of every platform
pub struct ConnectionManager {
    config: ConnectionConfig,
    links: RwLock<BTreeMap<PlatformId, PlatformLink>>,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    /// Create an empty manager
    #[must_use]
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            links: RwLock::new(BTreeMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Connection configuration
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Start supervising `platform`
    ///
    /// Spawns the platform's connection loop, which immediately attempts to
    /// connect. Opening an already-open platform returns the existing state
    /// channel. Must be called from within a tokio runtime.
    pub fn open(
        &self,
        platform: PlatformId,
        transport: Arc<dyn PlatformTransport>,
    ) -> watch::Receiver<ConnectionState> {
        let mut links = self.links.write();
        if let Some(link) = links.get(&platform) {
            if !link.task.is_finished() {
                debug!(platform = %platform, "Platform already open");
                return link.state.clone();
            }
        }

        let capacity = self.config.max_in_flight.max(1);
        let (jobs_tx, jobs_rx) = mpsc::channel(capacity);
        let (state_tx, state_rx) = watch::channel(ConnectionState::new(platform.clone()));

        let supervisor = Supervisor::new(
            platform.clone(),
            Arc::clone(&transport),
            self.config.clone(),
            state_tx,
            jobs_rx,
            self.shutdown.child_token(),
        );
        let task = tokio::spawn(supervisor.run());

        info!(platform = %platform, max_in_flight = capacity, "Opened platform");
        links.insert(
            platform,
            PlatformLink {
                jobs: jobs_tx,
                permits: Arc::new(Semaphore::new(capacity)),
                state: state_rx.clone(),
                transport,
                task,
            },
        );
        state_rx
    }

    /// Send a request to `platform` and wait for its reply
    ///
    /// # Errors
    ///
    /// Fails fast when the platform is not Connected or its in-flight bound
    /// is reached; otherwise returns the transport outcome.
    pub async fn send(
        &self,
        platform: &PlatformId,
        request: PlatformRequest,
    ) -> Result<PlatformReply, SendError> {
        self.send_cancellable(platform, request, &CancellationToken::new())
            .await
    }

    /// Like [`send`](Self::send), aborting when `cancel` fires
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send); additionally returns
    /// [`SendError::Cancelled`] when `cancel` fires first.
    pub async fn send_cancellable(
        &self,
        platform: &PlatformId,
        request: PlatformRequest,
        cancel: &CancellationToken,
    ) -> Result<PlatformReply, SendError> {
        let (jobs, permits, status) = {
            let links = self.links.read();
            let link = links
                .get(platform)
                .ok_or_else(|| SendError::UnknownPlatform(platform.clone()))?;
            let status = link.state.borrow().status;
            (link.jobs.clone(), Arc::clone(&link.permits), status)
        };

        if status != ConnectionStatus::Connected {
            return Err(SendError::NotConnected {
                platform: platform.clone(),
                status,
            });
        }

        let permit = permits
            .try_acquire_owned()
            .map_err(|_| SendError::Backpressure {
                platform: platform.clone(),
            })?;

        let job_cancel = cancel.child_token();
        // Cancels the dispatched send if this future is dropped early
        let _guard = job_cancel.clone().drop_guard();
        let (reply_tx, reply_rx) = oneshot::channel();
        // The request timeout runs from acceptance, queued time included
        let deadline = Instant::now() + self.config.request_timeout();

        jobs.try_send(Job {
            request,
            reply: reply_tx,
            cancel: job_cancel,
            permit,
            deadline,
        })
        .map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Backpressure {
                platform: platform.clone(),
            },
            mpsc::error::TrySendError::Closed(_) => SendError::Closed {
                platform: platform.clone(),
            },
        })?;

        tokio::select! {
            () = cancel.cancelled() => Err(SendError::Cancelled { platform: platform.clone() }),
            reply = tokio::time::timeout_at(deadline, reply_rx) => match reply {
                Ok(reply) => reply.unwrap_or_else(|_| Err(SendError::Closed { platform: platform.clone() })),
                Err(_) => Err(self.expired(platform)),
            },
        }
    }

    /// Error for a request whose deadline passed before a reply arrived
    ///
    /// A platform that left Connected while the request waited reports
    /// [`SendError::NotConnected`] so callers can fail over; otherwise the
    /// request simply ran out of time.
    fn expired(&self, platform: &PlatformId) -> SendError {
        let status = self
            .links
            .read()
            .get(platform)
            .map_or(ConnectionStatus::Disconnected, |link| link.state.borrow().status);
        if status == ConnectionStatus::Connected {
            SendError::Timeout {
                platform: platform.clone(),
                timeout_ms: self.config.request_timeout_ms,
            }
        } else {
            warn!(platform = %platform, status = %status, "Queued request expired while platform was down");
            SendError::NotConnected {
                platform: platform.clone(),
                status,
            }
        }
    }

    /// Push merged session context to `platform`, bypassing the request queue
    ///
    /// # Errors
    ///
    /// Returns an error when the platform is not Connected or the transport
    /// rejects the context.
    pub async fn sync_context(&self, platform: &PlatformId, session: &Session) -> Result<(), SendError> {
        let transport = {
            let links = self.links.read();
            let link = links
                .get(platform)
                .ok_or_else(|| SendError::UnknownPlatform(platform.clone()))?;
            let status = link.state.borrow().status;
            if status != ConnectionStatus::Connected {
                return Err(SendError::NotConnected {
                    platform: platform.clone(),
                    status,
                });
            }
            Arc::clone(&link.transport)
        };

        match tokio::time::timeout(self.config.request_timeout(), transport.sync_context(session)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(SendError::Transport {
                platform: platform.clone(),
                source,
            }),
            Err(_) => Err(SendError::Timeout {
                platform: platform.clone(),
                timeout_ms: self.config.request_timeout_ms,
            }),
        }
    }

    /// Current state of `platform`
    #[must_use]
    pub fn health(&self, platform: &PlatformId) -> Option<ConnectionState> {
        self.links
            .read()
            .get(platform)
            .map(|link| link.state.borrow().clone())
    }

    /// Status of every open platform
    #[must_use]
    pub fn statuses(&self) -> BTreeMap<PlatformId, ConnectionStatus> {
        self.links
            .read()
            .iter()
            .map(|(id, link)| (id.clone(), link.state.borrow().status))
            .collect()
    }

    /// Subscribe to state changes of `platform`
    #[must_use]
    pub fn subscribe(&self, platform: &PlatformId) -> Option<watch::Receiver<ConnectionState>> {
        self.links.read().get(platform).map(|link| link.state.clone())
    }

    /// Requests currently queued or running on `platform`
    #[must_use]
    pub fn in_flight(&self, platform: &PlatformId) -> usize {
        let capacity = self.config.max_in_flight.max(1);
        self.links
            .read()
            .get(platform)
            .map_or(0, |link| capacity - link.permits.available_permits())
    }

    /// Open platform identifiers
    #[must_use]
    pub fn platforms(&self) -> Vec<PlatformId> {
        self.links.read().keys().cloned().collect()
    }

    /// Wait until `platform` reaches `status`
    ///
    /// Returns false on timeout or if the platform is unknown.
    pub async fn wait_for_status(
        &self,
        platform: &PlatformId,
        status: ConnectionStatus,
        timeout: Duration,
    ) -> bool {
        let Some(mut rx) = self.subscribe(platform) else {
            return false;
        };
        let reached = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|state| state.status == status)).await,
            Ok(Ok(_))
        );
        reached
    }

    /// Stop every connection loop and wait for them to exit
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = {
            let mut links = self.links.write();
            std::mem::take(&mut *links)
                .into_values()
                .map(|link| link.task)
                .collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        info!("Connection manager stopped");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ============================================================================
// Tests
// ============================================================================
