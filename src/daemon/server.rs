//! Transport listener and per-session dispatcher.
//!
//! One task per accepted connection; the accept loop races the lifetime
//! deadline so expiry preempts it immediately. Everything that can go wrong
//! inside a session is contained there: the listener and sibling sessions
//! never see it.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::daemon::channel::SecureChannel;
use crate::daemon::envelope::Envelope;
use crate::daemon::executor;
use crate::daemon::lifecycle::{Deadline, Lifecycle, LifecycleState, EXIT_EXPIRED};
use crate::daemon::protocol::{self, ParsedRequest, Request, Response};
use crate::daemon::transfer;
use crate::error::{RelayError, Result};

/// Keepalive cadence while a command runs.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
/// How often the session polls the command worker for completion.
const COMPLETION_POLL: Duration = Duration::from_millis(100);

/// Listener configuration, fixed at startup.
pub struct DaemonConfig {
    /// TCP port to bind.
    pub port: u16,
    /// Bind the wildcard IPv6 address instead of IPv4.
    pub ipv6: bool,
    /// Per-connection idle window before the connection is closed.
    pub idle_timeout: Duration,
    /// Total process lifetime before hard self-termination.
    pub lifetime: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: 5099,
            ipv6: false,
            idle_timeout: Duration::from_secs(300),
            lifetime: Duration::from_secs(30 * 60),
        }
    }
}

pub struct DaemonServer {
    config: DaemonConfig,
    envelope: Arc<Envelope>,
    heartbeat_interval: Duration,
}

impl DaemonServer {
    pub fn new(config: DaemonConfig, envelope: Envelope) -> Self {
        Self {
            config,
            envelope: Arc::new(envelope),
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }

    /// Shrink the heartbeat cadence (tests).
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Bind the listening socket. Failure here is fatal: the daemon refuses
    /// to start rather than retry.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr: SocketAddr = if self.config.ipv6 {
            (Ipv6Addr::UNSPECIFIED, self.config.port).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, self.config.port).into()
        };

        TcpListener::bind(addr)
            .await
            .map_err(|e| RelayError::Fatal(format!("cannot bind {addr}: {e}")))
    }

    /// Accept loop. Runs until the lifetime deadline terminates the
    /// process; acceptance never blocks the handling of other connections.
    pub async fn serve(
        self,
        listener: TcpListener,
        deadline: Deadline,
        mut lifecycle: Lifecycle,
    ) -> Result<()> {
        lifecycle.transition(LifecycleState::Running);
        info!(
            addr = %listener.local_addr()?,
            lifetime_secs = self.config.lifetime.as_secs(),
            "listening"
        );

        let server = Arc::new(self);
        loop {
            tokio::select! {
                conn = listener.accept() => {
                    match conn {
                        Ok((stream, peer)) => {
                            debug!(%peer, "connection accepted");
                            let server = Arc::clone(&server);
                            tokio::spawn(async move {
                                server.handle_connection(stream, peer).await;
                            });
                        }
                        Err(e) => error!(error = %e, "accept error"),
                    }
                }
                _ = deadline.expired() => {
                    lifecycle.transition(LifecycleState::Expiring);
                    // Hard stop: in-flight sessions are not drained.
                    error!("lifetime deadline reached, terminating");
                    lifecycle.transition(LifecycleState::Terminated);
                    std::process::exit(EXIT_EXPIRED);
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let channel = SecureChannel::new(
            stream,
            Arc::clone(&self.envelope),
            self.config.idle_timeout,
        );
        self.run_session(channel, &peer.to_string()).await;
    }

    /// Per-session state machine: await frame, decode, dispatch, respond.
    ///
    /// Faults are contained here. A protocol-level fault (unreadable or
    /// undecodable frame) gets a best-effort failure envelope and closes
    /// this session only; validation faults are answered and the session
    /// continues.
    pub async fn run_session<S>(&self, mut channel: SecureChannel<S>, peer: &str)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let payload = match channel.recv().await {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    debug!(peer, "session closed by peer");
                    return;
                }
                Err(RelayError::IdleTimeout(secs)) => {
                    info!(peer, secs, "idle timeout, closing session");
                    return;
                }
                Err(e) => {
                    warn!(peer, error = %e, "unreadable frame, closing session");
                    let _ = channel
                        .send(&Response::failure("undecryptable or malformed frame"))
                        .await;
                    return;
                }
            };

            let outcome = match protocol::parse_request(&payload) {
                Ok(ParsedRequest::Known(request)) => self.dispatch(&mut channel, request).await,
                Ok(ParsedRequest::Unknown(mode)) => {
                    warn!(peer, mode, "unrecognized request mode");
                    Ok(Response::failure(format!("unrecognized mode '{mode}'")))
                }
                Err(e) => {
                    warn!(peer, error = %e, "undecodable request, closing session");
                    let _ = channel.send(&Response::failure("undecodable request")).await;
                    return;
                }
            };

            let response = match outcome {
                Ok(response) => response,
                Err(e) => {
                    // Session-boundary catch: log by kind, best-effort
                    // failure envelope, close this session only.
                    match &e {
                        RelayError::IdleTimeout(secs) => {
                            info!(peer, secs, "idle timeout mid-request, closing session");
                        }
                        RelayError::Crypto | RelayError::Protocol(_) => {
                            warn!(peer, error = %e, "protocol fault, closing session");
                        }
                        RelayError::Io(_)
                        | RelayError::Serialization(_)
                        | RelayError::Internal(_)
                        | RelayError::Fatal(_) => {
                            error!(peer, error = %e, "session fault");
                        }
                    }
                    let _ = channel
                        .send(&Response::failure(format!("request failed: {e}")))
                        .await;
                    return;
                }
            };

            if let Err(e) = channel.send(&response).await {
                warn!(peer, error = %e, "failed to send response, closing session");
                return;
            }
        }
    }

    async fn dispatch<S>(
        &self,
        channel: &mut SecureChannel<S>,
        request: Request,
    ) -> Result<Response>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match request {
            Request::Command {
                cmd,
                tmp_path,
                executable,
            } => self.run_command(channel, cmd, tmp_path, executable).await,
            Request::Put {
                data,
                out_path,
                last,
                user,
            } => transfer::put(channel, data, out_path, last, user).await,
            Request::Fetch { in_path } => transfer::fetch(channel, in_path).await,
        }
    }

    /// Run a command on a worker task while this session task keeps the
    /// connection alive, emitting a heartbeat frame for every interval of
    /// elapsed wall time until the worker finishes.
    async fn run_command<S>(
        &self,
        channel: &mut SecureChannel<S>,
        cmd: Option<String>,
        tmp_path: Option<String>,
        executable: Option<String>,
    ) -> Result<Response>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let worker = tokio::spawn(executor::execute(cmd, tmp_path, executable));

        let mut last_beat = Instant::now();
        while !worker.is_finished() {
            if last_beat.elapsed() >= self.heartbeat_interval {
                channel.send(&Response::pong()).await?;
                last_beat = Instant::now();
            }
            tokio::time::sleep(COMPLETION_POLL).await;
        }

        worker
            .await
            .map_err(|e| RelayError::Internal(format!("command worker failed: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde_json::json;
    use tokio::io::{duplex, DuplexStream};

    const IDLE: Duration = Duration::from_secs(5);

    fn test_key() -> String {
        BASE64.encode([11u8; crate::daemon::envelope::KEY_LEN])
    }

    fn test_server(idle_timeout: Duration) -> Arc<DaemonServer> {
        let config = DaemonConfig {
            idle_timeout,
            ..DaemonConfig::default()
        };
        let envelope = Envelope::from_base64(&test_key()).unwrap();
        Arc::new(
            DaemonServer::new(config, envelope)
                .with_heartbeat_interval(Duration::from_millis(100)),
        )
    }

    /// Spawn a session task over one end of a duplex pipe; return the
    /// controller's channel over the other end.
    fn start_session(
        server: &Arc<DaemonServer>,
        idle_timeout: Duration,
    ) -> (
        SecureChannel<DuplexStream>,
        tokio::task::JoinHandle<()>,
    ) {
        let (daemon_end, controller_end) = duplex(256 * 1024);
        let session_channel =
            SecureChannel::new(daemon_end, Arc::clone(&server.envelope), idle_timeout);
        let server = Arc::clone(server);
        let session = tokio::spawn(async move {
            server.run_session(session_channel, "test-peer").await;
        });

        let envelope = Arc::new(Envelope::from_base64(&test_key()).unwrap());
        (
            SecureChannel::new(controller_end, envelope, IDLE),
            session,
        )
    }

    async fn send_request(
        channel: &mut SecureChannel<DuplexStream>,
        request: serde_json::Value,
    ) {
        channel
            .send_bytes(&serde_json::to_vec(&request).unwrap())
            .await
            .unwrap();
    }

    async fn recv_response(channel: &mut SecureChannel<DuplexStream>) -> Response {
        let payload = channel.recv().await.unwrap().unwrap();
        serde_json::from_slice(&payload).unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_request_roundtrip() {
        let server = test_server(IDLE);
        let (mut controller, session) = start_session(&server, IDLE);

        send_request(
            &mut controller,
            json!({
                "mode": "command",
                "cmd": "printf session-test",
                "tmp_path": "/tmp",
                "executable": "/bin/sh",
            }),
        )
        .await;

        let response = recv_response(&mut controller).await;
        match response {
            Response::Exec { rc, stdout, .. } => {
                assert_eq!(rc, 0);
                assert_eq!(stdout, "session-test");
            }
            other => panic!("expected exec result, got {other:?}"),
        }

        drop(controller);
        session.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn long_command_emits_heartbeats_before_result() {
        let server = test_server(IDLE);
        let (mut controller, _session) = start_session(&server, IDLE);

        send_request(
            &mut controller,
            json!({
                "mode": "command",
                "cmd": "sleep 1; echo done",
                "tmp_path": "/tmp",
                "executable": "/bin/sh",
            }),
        )
        .await;

        let mut pongs = 0;
        loop {
            match recv_response(&mut controller).await {
                Response::Pong { pong } => {
                    assert!(pong);
                    pongs += 1;
                }
                Response::Exec { rc, stdout, .. } => {
                    assert_eq!(rc, 0);
                    assert_eq!(stdout, "done\n");
                    break;
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert!(pongs >= 1, "expected at least one heartbeat");
    }

    #[tokio::test]
    async fn unknown_mode_fails_by_name_and_session_continues() {
        let server = test_server(IDLE);
        let (mut controller, _session) = start_session(&server, IDLE);

        send_request(&mut controller, json!({ "mode": "reboot" })).await;
        let response = recv_response(&mut controller).await;
        assert!(matches!(
            response,
            Response::Failure { msg, .. } if msg.contains("reboot")
        ));

        // Same session still answers follow-up requests.
        send_request(&mut controller, json!({ "mode": "fetch" })).await;
        let response = recv_response(&mut controller).await;
        assert!(matches!(
            response,
            Response::Failure { msg, .. } if msg.contains("'in_path'")
        ));
    }

    #[tokio::test]
    async fn modeless_request_gets_failure_and_close() {
        let server = test_server(IDLE);
        let (mut controller, session) = start_session(&server, IDLE);

        send_request(&mut controller, json!({ "cmd": "ls" })).await;
        let response = recv_response(&mut controller).await;
        assert!(matches!(response, Response::Failure { failed: true, .. }));

        session.await.unwrap();
        assert!(controller.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn undecryptable_frame_ends_only_that_session() {
        let server = test_server(IDLE);

        // Session one is poisoned with a frame that never saw the key.
        let (broken_end, mut raw) = duplex(4096);
        let broken_channel =
            SecureChannel::new(broken_end, Arc::clone(&server.envelope), IDLE);
        let server_clone = Arc::clone(&server);
        let broken_session = tokio::spawn(async move {
            server_clone.run_session(broken_channel, "broken-peer").await;
        });
        crate::daemon::channel::send_frame(&mut raw, b"garbage ciphertext")
            .await
            .unwrap();
        broken_session.await.unwrap();

        // Session two still works end to end.
        let (mut controller, _session) = start_session(&server, IDLE);
        send_request(&mut controller, json!({ "mode": "fetch" })).await;
        assert!(matches!(
            recv_response(&mut controller).await,
            Response::Failure { .. }
        ));
    }

    #[tokio::test]
    async fn idle_session_is_closed() {
        let server = test_server(Duration::from_millis(50));
        let (mut controller, session) = start_session(&server, Duration::from_millis(50));

        // Send nothing; the daemon side must give up on its own.
        session.await.unwrap();
        assert!(controller.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn peer_close_is_a_graceful_end() {
        let server = test_server(IDLE);
        let (controller, session) = start_session(&server, IDLE);
        drop(controller);
        session.await.unwrap();
    }

    #[tokio::test]
    async fn bind_conflict_is_fatal() {
        let config = DaemonConfig {
            port: 0,
            ..DaemonConfig::default()
        };
        let envelope = Envelope::from_base64(&test_key()).unwrap();
        let server = DaemonServer::new(config, envelope);
        let listener = server.bind().await.unwrap();
        let taken = listener.local_addr().unwrap().port();

        let config = DaemonConfig {
            port: taken,
            ..DaemonConfig::default()
        };
        let envelope = Envelope::from_base64(&test_key()).unwrap();
        let second = DaemonServer::new(config, envelope);
        assert!(matches!(second.bind().await, Err(RelayError::Fatal(_))));
    }
}
