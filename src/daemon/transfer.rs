//! Chunked file transfer between controller and daemon.
//!
//! Both directions move base64 chunks with one-chunk-in-flight flow
//! control: the sender never emits a new chunk before the previous one has
//! been acknowledged. Transfer faults abort the current request with a
//! structured failure and release any held file handle; the session itself
//! survives everything except a dead or unreadable connection.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::daemon::channel::SecureChannel;
use crate::daemon::protocol::{self, ParsedRequest, Request, Response, CHUNK_SIZE};
use crate::error::{RelayError, Result};

/// Stream a local file to the controller in acknowledged chunks.
///
/// The returned response is the final frame for the request: an empty ack
/// on success, a failure record otherwise.
pub async fn fetch<S>(channel: &mut SecureChannel<S>, in_path: Option<String>) -> Result<Response>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(in_path) = in_path.filter(|p| !p.is_empty()) else {
        return Ok(Response::failure("missing required field 'in_path'"));
    };

    let mut file = match File::open(&in_path).await {
        Ok(file) => file,
        Err(e) => return Ok(Response::failure(format!("failed to open '{in_path}': {e}"))),
    };
    let total = match file.metadata().await {
        Ok(meta) => meta.len(),
        Err(e) => return Ok(Response::failure(format!("failed to stat '{in_path}': {e}"))),
    };

    debug!(path = %in_path, bytes = total, "fetch started");

    let mut sent: u64 = 0;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = match file.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                return Ok(Response::failure(format!("read error on '{in_path}': {e}")));
            }
        };
        sent += n as u64;
        // EOF counts as last even if the file shrank under us.
        let last = sent >= total || n == 0;

        let chunk = Response::Chunk {
            data: BASE64.encode(&buf[..n]),
            last,
        };
        channel.send(&chunk).await?;

        // One chunk in flight: wait for the controller's ack before the
        // next read.
        let Some(ack) = channel.recv().await? else {
            warn!(path = %in_path, "connection closed awaiting fetch ack");
            return Err(RelayError::Protocol("connection closed mid-fetch".into()));
        };
        if ack_failed(&ack) {
            // The controller reported failure; answer with a failure
            // envelope so both sides agree the transfer is dead.
            warn!(path = %in_path, "controller aborted fetch");
            return Ok(Response::failure(format!(
                "controller aborted fetch of '{in_path}'"
            )));
        }

        if last {
            break;
        }
    }

    info!(path = %in_path, bytes = total, "fetch complete");
    Ok(Response::ack())
}

/// Whether a fetch acknowledgment reports failure. An unreadable ack
/// counts as a failed one.
fn ack_failed(payload: &[u8]) -> bool {
    match serde_json::from_slice::<Value>(payload) {
        Ok(value) => value
            .get("failed")
            .is_some_and(|f| f.as_bool().unwrap_or(true)),
        Err(_) => true,
    }
}

/// Receive a file from the controller, one acknowledged chunk at a time.
///
/// When the request names a `user` other than the daemon's own, the bytes
/// land in a private staging file and are relocated across the privilege
/// boundary after the last chunk.
pub async fn put<S>(
    channel: &mut SecureChannel<S>,
    data: Option<String>,
    out_path: Option<String>,
    last: bool,
    user: Option<String>,
) -> Result<Response>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(mut chunk) = data else {
        return Ok(Response::failure("missing required field 'data'"));
    };
    let Some(out_path) = out_path.filter(|p| !p.is_empty()) else {
        return Ok(Response::failure("missing required field 'out_path'"));
    };

    let target_user = user.filter(|u| *u != effective_user());
    let write_path = match &target_user {
        Some(_) => stage_path(),
        None => PathBuf::from(&out_path),
    };

    let mut file = match OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&write_path)
        .await
    {
        Ok(file) => file,
        Err(e) => {
            return Ok(Response::failure(format!(
                "failed to open '{}': {e}",
                write_path.display()
            )));
        }
    };

    debug!(path = %out_path, staged = target_user.is_some(), "put started");

    let mut chunk_last = last;
    let mut written: u64 = 0;
    loop {
        let bytes = match BASE64.decode(chunk.as_bytes()) {
            Ok(bytes) => bytes,
            Err(e) => {
                abort_put(file, &write_path, target_user.is_some()).await;
                return Ok(Response::failure(format!("chunk is not valid base64: {e}")));
            }
        };
        if let Err(e) = file.write_all(&bytes).await {
            abort_put(file, &write_path, target_user.is_some()).await;
            return Ok(Response::failure(format!(
                "write error on '{}': {e}",
                write_path.display()
            )));
        }
        written += bytes.len() as u64;

        if chunk_last {
            break;
        }

        // Ack the chunk, then block for the next one.
        channel.send(&Response::ack()).await?;
        let payload = match channel.recv().await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                abort_put(file, &write_path, target_user.is_some()).await;
                return Err(RelayError::Protocol("connection closed mid-put".into()));
            }
            Err(e) => {
                abort_put(file, &write_path, target_user.is_some()).await;
                return Err(e);
            }
        };

        match protocol::parse_request(&payload) {
            Ok(ParsedRequest::Known(Request::Put {
                data: Some(data),
                last,
                ..
            })) => {
                chunk = data;
                chunk_last = last;
            }
            Ok(_) => {
                abort_put(file, &write_path, target_user.is_some()).await;
                return Ok(Response::failure("expected a put chunk with 'data'"));
            }
            Err(e) => {
                abort_put(file, &write_path, target_user.is_some()).await;
                return Ok(Response::failure(format!("malformed put chunk: {e}")));
            }
        }
    }

    if let Err(e) = file.flush().await {
        abort_put(file, &write_path, target_user.is_some()).await;
        return Ok(Response::failure(format!(
            "flush error on '{}': {e}",
            write_path.display()
        )));
    }
    drop(file);

    if let Some(user) = &target_user {
        if let Err(e) = relocate(&write_path, &out_path, user).await {
            return Ok(Response::failure(format!(
                "failed to deliver '{out_path}' to user '{user}': {e}"
            )));
        }
    }

    info!(path = %out_path, bytes = written, "put complete");
    Ok(Response::ack())
}

/// Drop the destination handle and clean up a private staging file.
async fn abort_put(file: File, write_path: &Path, staged: bool) {
    drop(file);
    if staged {
        let _ = tokio::fs::remove_file(write_path).await;
    }
}

fn effective_user() -> String {
    whoami::username()
}

/// Private staging file for a cross-user put, unique per process and call.
fn stage_path() -> PathBuf {
    static STAGE_SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
    let seq = STAGE_SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    std::env::temp_dir().join(format!("relayd-put-{}-{seq}", std::process::id()))
}

/// Relocate a staged file to its destination under the target user's
/// ownership. This is the privileged atomic-move capability; it can fail,
/// and failure propagates instead of silently succeeding.
#[cfg(unix)]
async fn relocate(staged: &Path, dest: &str, user: &str) -> Result<()> {
    let staged = staged.display().to_string();
    run_sudo(&["mv", &staged, dest]).await?;
    run_sudo(&["chown", user, dest]).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn relocate(staged: &Path, dest: &str, _user: &str) -> Result<()> {
    // No privilege boundary to cross without unix ownership semantics.
    tokio::fs::rename(staged, dest).await?;
    Ok(())
}

#[cfg(unix)]
async fn run_sudo(args: &[&str]) -> Result<()> {
    let status = tokio::process::Command::new("sudo")
        .args(args)
        .status()
        .await?;

    if !status.success() {
        return Err(RelayError::Io(std::io::Error::other(format!(
            "sudo {} failed ({status})",
            args.join(" ")
        ))));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
