use thiserror::Error;

/// Fault taxonomy for the daemon.
///
/// Protocol and crypto faults end the offending session; validation faults
/// become structured failure responses and the session continues; I/O faults
/// abort the current request; fatal conditions prevent the daemon from
/// starting at all. Handlers match on the variant at each call site instead
/// of funneling everything through one recovery path.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Malformed frame or request the peer cannot be reasoned with about.
    #[error("protocol fault: {0}")]
    Protocol(String),

    /// Ciphertext that does not authenticate under the pre-shared key.
    #[error("decryption failed")]
    Crypto,

    /// No complete frame arrived within the per-connection idle window.
    #[error("idle timeout after {0}s")]
    IdleTimeout(u64),

    #[error("i/o fault: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization fault: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Worker task failure surfaced at the session boundary.
    #[error("internal fault: {0}")]
    Internal(String),

    /// Startup condition that prevents the daemon from running.
    #[error("fatal: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;
