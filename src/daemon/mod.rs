//! relayd daemon - ephemeral encrypted remote-execution channel
//!
//! The daemon is spawned transiently on a target host so a controller can
//! run commands and move files without paying a full secure-shell handshake
//! per operation. It handles:
//! - Encrypted, length-prefixed request/response frames over TCP
//! - Command execution with keepalive heartbeats for long commands
//! - Chunked file transfer in both directions with per-chunk acknowledgment
//! - Single-instance enforcement and a hard lifetime deadline
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                   relayd                      │
//! ├───────────────────────────────────────────────┤
//! │  Lifecycle     │  Listener     │  Session ×N  │
//! │  (pid, timer)  │  (accept)     │  (dispatch)  │
//! ├───────────────────────────────────────────────┤
//! │  executor │ transfer │ envelope │ channel     │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! Every accepted connection becomes an independent session task; the only
//! state shared between sessions is the read-only pre-shared key.

pub mod channel;
pub mod envelope;
pub mod executor;
pub mod lifecycle;
pub mod protocol;
pub mod server;
pub mod transfer;

pub use channel::SecureChannel;
pub use envelope::Envelope;
pub use lifecycle::{Deadline, Lifecycle, LifecycleState, PidFile};
pub use protocol::{Request, Response};
pub use server::{DaemonConfig, DaemonServer};
