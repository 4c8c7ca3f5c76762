//! Length-prefixed framing and the encrypted session channel.
//!
//! A frame is an 8-byte unsigned big-endian length followed by exactly that
//! many ciphertext bytes. A frame is never interpreted until the full
//! declared length has arrived; end-of-stream before that point is the
//! normal end of a session, not an error.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::daemon::envelope::Envelope;
use crate::daemon::protocol::Response;
use crate::error::{RelayError, Result};

/// Upper bound on a declared frame length. Anything larger is a protocol
/// fault rather than an allocation request.
pub const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

const LEN_HEADER: usize = 8;

/// Write one length-prefixed frame and flush it fully before returning.
pub async fn send_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&(payload.len() as u64).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame, looping over partial reads.
///
/// Returns `Ok(None)` when the peer closes before a complete header or
/// payload has arrived.
pub async fn recv_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; LEN_HEADER];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u64::from_be_bytes(header);
    if len > MAX_FRAME_LEN {
        return Err(RelayError::Protocol(format!(
            "declared frame length {len} exceeds the {MAX_FRAME_LEN} byte limit"
        )));
    }

    let mut payload = vec![0u8; len as usize];
    match reader.read_exact(&mut payload).await {
        Ok(_) => Ok(Some(payload)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Framing plus encryption plus the per-connection idle timeout.
///
/// Every outgoing payload is encrypted before framing and every incoming
/// frame is decrypted before interpretation, so nothing plaintext ever
/// touches the socket.
pub struct SecureChannel<S> {
    stream: S,
    envelope: Arc<Envelope>,
    idle_timeout: Duration,
}

impl<S> SecureChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, envelope: Arc<Envelope>, idle_timeout: Duration) -> Self {
        Self {
            stream,
            envelope,
            idle_timeout,
        }
    }

    /// Encrypt and send one response record.
    pub async fn send(&mut self, response: &Response) -> Result<()> {
        let plaintext = serde_json::to_vec(response)?;
        self.send_bytes(&plaintext).await
    }

    /// Encrypt and send an arbitrary plaintext payload.
    pub async fn send_bytes(&mut self, plaintext: &[u8]) -> Result<()> {
        let ciphertext = self.envelope.encrypt(plaintext);
        send_frame(&mut self.stream, &ciphertext).await
    }

    /// Receive and decrypt one frame.
    ///
    /// `Ok(None)` means the peer closed the connection; an idle timeout or
    /// undecryptable frame is reported as the corresponding fault.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        let frame = tokio::time::timeout(self.idle_timeout, recv_frame(&mut self.stream))
            .await
            .map_err(|_| RelayError::IdleTimeout(self.idle_timeout.as_secs()))??;

        match frame {
            Some(ciphertext) => Ok(Some(self.envelope.decrypt(&ciphertext)?)),
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
