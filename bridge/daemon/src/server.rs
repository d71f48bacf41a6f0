//! Daemon Server Implementation
//!
//! Serves the bridge over a Unix socket:
//! - Accepts connections from local clients (same UID only)
//! - Reads newline-delimited JSON `AgentRequest`s
//! - Routes each request concurrently and writes one `AgentResponse` line
//!   per request, in completion order, correlated by `id`
//! - Logs a metrics summary periodically and at shutdown
//!
//! ```text
//!   client ──line──▶ reader ──spawn──▶ Bridge::route ──┐
//!   client ◀──line── writer ◀──mpsc<AgentResponse>─────┘
//! ```

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn, Instrument};

use bridge_core::{AgentRequest, AgentResponse, Bridge, RequestId};

/// Connection state tracking
struct ConnectionState {
    /// When the connection was established
    connected_at: Instant,
    /// Remote peer UID (from `SO_PEERCRED`)
    peer_uid: Option<u32>,
    /// Handle to abort the connection task
    abort_handle: tokio::task::AbortHandle,
}

/// Configuration for the daemon server
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Responses buffered per connection
    pub response_capacity: usize,
    /// Interval between metrics summary log lines
    pub metrics_interval: Duration,
    /// Longest request line accepted from a client
    pub max_line_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            response_capacity: 256,
            metrics_interval: Duration::from_secs(60),
            max_line_bytes: 1024 * 1024, // 1 MiB
        }
    }
}

/// The main daemon server
pub struct DaemonServer {
    /// Path to the Unix socket
    socket_path: PathBuf,
    /// The bridge requests are routed through
    bridge: Arc<Bridge>,
    /// Server configuration
    server_config: ServerConfig,
    /// Active connection state
    connection_states: Arc<DashMap<u64, ConnectionState>>,
    /// Source of connection ids
    next_connection: AtomicU64,
}

impl DaemonServer {
    /// Create a new daemon server
    pub fn new(socket_path: PathBuf, bridge: Arc<Bridge>, server_config: ServerConfig) -> Self {
        Self {
            socket_path,
            bridge,
            server_config,
            connection_states: Arc::new(DashMap::new()),
            next_connection: AtomicU64::new(1),
        }
    }

    /// Get peer credentials from Unix socket
    #[cfg(target_os = "linux")]
    fn get_peer_uid(stream: &UnixStream) -> Option<u32> {
        use std::os::unix::io::AsRawFd;

        let fd = stream.as_raw_fd();
        let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
        #[allow(clippy::cast_possible_truncation)]
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        let result = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                std::ptr::addr_of_mut!(cred).cast::<libc::c_void>(),
                &mut len,
            )
        };

        (result == 0).then_some(cred.uid)
    }

    /// Peer credentials are unavailable; rely on socket file permissions
    #[cfg(not(target_os = "linux"))]
    fn get_peer_uid(_stream: &UnixStream) -> Option<u32> {
        None
    }

    /// Prepare the socket path (create directory, remove stale socket)
    fn prepare_socket(&self) -> Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create socket directory: {parent:?}"))?;
                info!(path = ?parent, "Created socket directory");
            }
        }

        if self.socket_path.exists() {
            warn!(path = ?self.socket_path, "Removing stale socket file");
            fs::remove_file(&self.socket_path).with_context(|| {
                format!("Failed to remove stale socket: {:?}", self.socket_path)
            })?;
        }

        Ok(())
    }

    /// Bind the socket with owner-only permissions
    pub fn bind(&self) -> Result<UnixListener> {
        self.prepare_socket()?;

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind to {:?}", self.socket_path))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&self.socket_path, perms)
                .with_context(|| format!("Failed to restrict {:?}", self.socket_path))?;
        }

        info!(path = ?self.socket_path, "Listening for connections");
        Ok(listener)
    }

    /// Accept connections until `shutdown` flips to true
    pub async fn run(&self, listener: UnixListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let metrics_task = tokio::spawn(log_metrics_periodically(
            Arc::clone(&self.bridge),
            self.server_config.metrics_interval,
            shutdown.clone(),
        ));

        loop {
            let accepted = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested, stopping accept loop");
                        break;
                    }
                    continue;
                }
                accepted = listener.accept() => accepted,
            };

            let stream = match accepted {
                Ok((stream, _addr)) => stream,
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    continue;
                }
            };

            if self.connection_states.len() >= self.server_config.max_connections {
                warn!("Connection limit reached, rejecting new connection");
                drop(stream);
                continue;
            }

            let peer_uid = Self::get_peer_uid(&stream);
            let our_uid = unsafe { libc::getuid() };
            if let Some(uid) = peer_uid {
                if uid != our_uid {
                    warn!(
                        peer_uid = uid,
                        our_uid = our_uid,
                        "Rejecting connection from different user"
                    );
                    drop(stream);
                    continue;
                }
            }

            let conn_id = self.next_connection.fetch_add(1, Ordering::Relaxed);
            info!(
                conn_id,
                peer_uid = ?peer_uid,
                active_connections = self.connection_states.len() + 1,
                "New connection accepted"
            );

            // Handler starts once registered; its removal must follow the insert
            let (registered_tx, registered_rx) = oneshot::channel();
            let task = tokio::spawn(
                handle_connection(
                    conn_id,
                    stream,
                    Arc::clone(&self.bridge),
                    self.server_config.response_capacity,
                    self.server_config.max_line_bytes,
                    Arc::clone(&self.connection_states),
                    registered_rx,
                )
                .instrument(tracing::info_span!("connection", conn_id)),
            );

            self.connection_states.insert(
                conn_id,
                ConnectionState {
                    connected_at: Instant::now(),
                    peer_uid,
                    abort_handle: task.abort_handle(),
                },
            );
            let _ = registered_tx.send(());
        }

        metrics_task.abort();
        self.shutdown();
        Ok(())
    }

    /// Abort every connection and remove the socket file
    fn shutdown(&self) {
        info!("Initiating graceful shutdown");

        let conn_ids: Vec<u64> = self.connection_states.iter().map(|r| *r.key()).collect();
        for conn_id in conn_ids {
            if let Some((_, state)) = self.connection_states.remove(&conn_id) {
                info!(
                    conn_id,
                    peer_uid = ?state.peer_uid,
                    uptime_secs = state.connected_at.elapsed().as_secs(),
                    "Aborting connection"
                );
                state.abort_handle.abort();
            }
        }

        if self.socket_path.exists() {
            if let Err(e) = fs::remove_file(&self.socket_path) {
                warn!(error = %e, path = ?self.socket_path, "Failed to remove socket file");
            } else {
                info!(path = ?self.socket_path, "Socket file removed");
            }
        }
    }

    /// Get number of active connections
    pub fn connection_count(&self) -> usize {
        self.connection_states.len()
    }
}

/// Route one NDJSON line and produce the reply
pub async fn handle_line(bridge: &Bridge, line: &str) -> AgentResponse {
    let request: AgentRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "Malformed request line");
            return AgentResponse::error(RequestId::new(""), format!("malformed request: {e}"));
        }
    };

    let id = request.id.clone();
    match bridge.route(request).await {
        Ok(response) => response,
        Err(error) => error.into_response(id),
    }
}

/// Handle a single client connection
async fn handle_connection(
    conn_id: u64,
    stream: UnixStream,
    bridge: Arc<Bridge>,
    response_capacity: usize,
    max_line_bytes: usize,
    connection_states: Arc<DashMap<u64, ConnectionState>>,
    registered: oneshot::Receiver<()>,
) {
    let _ = registered.await;
    debug!("Connection handler started");

    let (read_half, mut write_half) = stream.into_split();
    let (response_tx, mut response_rx) = mpsc::channel::<AgentResponse>(response_capacity.max(1));

    let writer = tokio::spawn(
        async move {
            while let Some(response) = response_rx.recv().await {
                let mut line = match serde_json::to_vec(&response) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode response");
                        continue;
                    }
                };
                line.push(b'\n');
                if let Err(e) = write_half.write_all(&line).await {
                    error!(error = %e, "Write error");
                    break;
                }
            }
        }
        .in_current_span(),
    );

    let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(max_line_bytes));
    // After a decode error the stream yields a single None before resuming
    let mut skipped_line = false;
    loop {
        match lines.next().await {
            Some(Ok(line)) => {
                skipped_line = false;
                if line.trim().is_empty() {
                    continue;
                }
                let bridge = Arc::clone(&bridge);
                let response_tx = response_tx.clone();
                tokio::spawn(
                    async move {
                        let response = handle_line(&bridge, &line).await;
                        if response_tx.send(response).await.is_err() {
                            debug!("Client went away before the response was ready");
                        }
                    }
                    .in_current_span(),
                );
            }
            // The codec skips the rest of the oversized line and carries on
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                skipped_line = true;
                warn!(max_line_bytes, "Request line too long");
                let response = AgentResponse::error(
                    RequestId::new(""),
                    format!("request line exceeds {max_line_bytes} bytes"),
                );
                if response_tx.send(response).await.is_err() {
                    break;
                }
            }
            Some(Err(LinesCodecError::Io(e))) => {
                error!(error = %e, "Read error");
                break;
            }
            None if skipped_line => skipped_line = false,
            None => {
                info!("Client disconnected (EOF)");
                break;
            }
        }
    }

    // The writer finishes once every in-flight request has answered
    drop(response_tx);
    let _ = writer.await;

    connection_states.remove(&conn_id);
    info!(
        active_connections = connection_states.len(),
        "Connection handler finished"
    );
}

async fn log_metrics_periodically(
    bridge: Arc<Bridge>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    // The first tick completes immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => log_metrics(&bridge),
        }
    }
}

/// Log the bridge metrics summary
pub fn log_metrics(bridge: &Bridge) {
    let summary = bridge.metrics().summary();
    info!(
        requests = summary.requests,
        routed_single = summary.routed_single,
        routed_hybrid = summary.routed_hybrid,
        fallbacks = summary.fallbacks,
        failovers = summary.failovers,
        errors = summary.errors,
        route_p50_ms = summary.route_p50_ms,
        route_p99_ms = summary.route_p99_ms,
        "Bridge metrics"
    );
    match serde_json::to_string(&summary.platforms) {
        Ok(platforms) => debug!(platforms = %platforms, "Platform metrics"),
        Err(e) => warn!(error = %e, "Failed to encode platform metrics"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use bridge_core::{
        BridgeConfig, LoopbackTransport, PlatformConfig, PlatformId, PlatformTransport,
        ResponseStatus,
    };
    use tokio::io::{AsyncBufReadExt, BufReader};

    async fn loopback_bridge() -> Arc<Bridge> {
        let config = BridgeConfig::with_platforms(vec![PlatformConfig::new("alpha", "")]);
        let transports = BTreeMap::from([(
            PlatformId::from("alpha"),
            Arc::new(LoopbackTransport::new("alpha")) as Arc<dyn PlatformTransport>,
        )]);
        let bridge = Arc::new(Bridge::start(config, transports).unwrap());
        assert!(bridge.wait_until_connected(Duration::from_secs(1)).await);
        bridge
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.response_capacity, 256);
        assert_eq!(config.metrics_interval, Duration::from_secs(60));
        assert_eq!(config.max_line_bytes, 1024 * 1024);
    }

    #[tokio::test]
    async fn test_malformed_line_gets_error_with_empty_id() {
        let bridge = loopback_bridge().await;
        let response = handle_line(&bridge, "{not json").await;
        assert_eq!(response.status, ResponseStatus::Error);
        assert_eq!(response.id.as_str(), "");
        assert!(response.result.starts_with("malformed request"));
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_validation_error_keeps_request_id() {
        let bridge = loopback_bridge().await;
        let line = r#"{"id":"req-7","agent":"developer","content":"","context":{"sessionId":"s-1"}}"#;
        let response = handle_line(&bridge, line).await;
        assert_eq!(response.status, ResponseStatus::Error);
        assert_eq!(response.id.as_str(), "req-7");
        assert!(response.result.contains("content is empty"));
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_socket_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("bridge.sock");
        let bridge = loopback_bridge().await;

        let server = Arc::new(DaemonServer::new(
            socket_path.clone(),
            Arc::clone(&bridge),
            ServerConfig::default(),
        ));
        let listener = server.bind().unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&socket_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.run(listener, shutdown_rx).await })
        };

        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half
            .write_all(
                b"{\"id\":\"req-1\",\"agent\":\"developer\",\"content\":\"hello\",\"context\":{\"sessionId\":\"s-1\"}}\n",
            )
            .await
            .unwrap();

        let mut lines = BufReader::new(read_half).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let response: AgentResponse = serde_json::from_str(&line).unwrap();
        assert_eq!(response.id.as_str(), "req-1");
        assert_eq!(response.status, ResponseStatus::Success);
        assert_eq!(response.result, "[alpha] hello");
        assert_eq!(response.platform, "alpha");

        shutdown_tx.send(true).unwrap();
        running.await.unwrap().unwrap();
        assert!(!socket_path.exists());
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_oversized_line_rejected_and_connection_kept() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("bridge.sock");
        let bridge = loopback_bridge().await;

        let server = Arc::new(DaemonServer::new(
            socket_path.clone(),
            Arc::clone(&bridge),
            ServerConfig {
                max_line_bytes: 256,
                ..ServerConfig::default()
            },
        ));
        let listener = server.bind().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.run(listener, shutdown_rx).await })
        };

        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let mut oversized = vec![b'x'; 4096];
        oversized.push(b'\n');
        write_half.write_all(&oversized).await.unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        let response: AgentResponse = serde_json::from_str(&line).unwrap();
        assert_eq!(response.status, ResponseStatus::Error);
        assert!(response.result.contains("exceeds 256 bytes"));

        write_half
            .write_all(
                b"{\"id\":\"req-2\",\"agent\":\"developer\",\"content\":\"still here\",\"context\":{\"sessionId\":\"s-1\"}}\n",
            )
            .await
            .unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        let response: AgentResponse = serde_json::from_str(&line).unwrap();
        assert_eq!(response.id.as_str(), "req-2");
        assert_eq!(response.result, "[alpha] still here");

        shutdown_tx.send(true).unwrap();
        running.await.unwrap().unwrap();
        bridge.shutdown().await;
    }
}
