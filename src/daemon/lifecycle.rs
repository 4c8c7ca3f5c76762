//! Process lifecycle: single-instance marker, detachment, lifetime deadline.
//!
//! The daemon exists for a bounded lifetime. Startup sweeps any prior
//! instance recorded in the PID marker, detachment re-execs the daemon body
//! as a supervised background child, and the lifetime deadline is a plain
//! timer value whose expiry terminates the process without draining
//! in-flight sessions.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::daemon::server::DaemonConfig;
use crate::error::{RelayError, Result};
use crate::runenv;

/// Exit code used when the lifetime deadline fires.
pub const EXIT_EXPIRED: i32 = 2;

/// How long `detach` waits for the child to bind and write its marker.
const START_POLLS: u32 = 50;
const START_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// States the daemon process moves through. Transitions are logged and
/// never skipped silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Detaching,
    Running,
    Expiring,
    Terminated,
}

/// Tracks the process's position in the lifecycle state machine.
pub struct Lifecycle {
    state: LifecycleState,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Starting,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn transition(&mut self, next: LifecycleState) {
        debug!(from = ?self.state, to = ?next, "lifecycle transition");
        self.state = next;
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// On-disk marker recording the live daemon's process id.
///
/// Enforces at-most-one live daemon per marker path: a stale marker is
/// resolved by force-killing whatever PID it records and removing it.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the recorded PID, if the marker exists and parses.
    pub fn read(&self) -> Option<u32> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        content.trim().parse().ok()
    }

    /// Record the calling process's PID.
    pub fn write_self(&self) -> Result<()> {
        std::fs::write(&self.path, std::process::id().to_string()).map_err(|e| {
            RelayError::Fatal(format!(
                "cannot write PID marker {}: {e}",
                self.path.display()
            ))
        })
    }

    /// Remove the marker, ignoring a missing file.
    pub fn remove(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "could not remove PID marker");
            }
        }
    }

    /// Sweep a prior instance: force-kill the recorded PID (the process is
    /// usually already gone, so kill errors are ignored) and remove the
    /// marker unconditionally.
    pub fn clear_stale(&self) {
        if let Some(pid) = self.read() {
            info!(pid, "terminating prior daemon instance");
            force_kill(pid);
        }
        self.remove();
    }

    /// The recorded PID, if it refers to a live process.
    pub fn live_pid(&self) -> Option<u32> {
        let pid = self.read()?;
        process_alive(pid).then_some(pid)
    }
}

#[cfg(unix)]
pub fn force_kill(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
pub fn force_kill(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/F", "/PID", &pid.to_string()])
        .status();
}

#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // Signal 0 probes existence without delivering anything.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    // No cheap liveness probe here; stale markers are swept at startup.
    false
}

/// Hard process lifetime. A plain cancellable timer value (dropping it
/// cancels it), not a signal handler.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: tokio::time::Instant,
}

impl Deadline {
    pub fn after(lifetime: Duration) -> Self {
        Self {
            at: tokio::time::Instant::now() + lifetime,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at
            .saturating_duration_since(tokio::time::Instant::now())
    }

    /// Resolves once the lifetime is spent.
    pub async fn expired(&self) {
        tokio::time::sleep_until(self.at).await;
    }
}

/// Spawn the detached daemon body (`relayd run`) and wait for it to come up.
///
/// The child gets null stdio, its own session, the filesystem root as its
/// working directory, and the pre-shared key through the environment (never
/// argv). The child writes the PID marker only after a successful bind, so
/// marker presence doubles as the readiness signal. Returns the child's PID.
pub async fn detach(
    config: &DaemonConfig,
    key_b64: &str,
    log_file: &Path,
    pid_file: &PidFile,
) -> Result<u32> {
    let exe = std::env::current_exe()
        .map_err(|e| RelayError::Fatal(format!("cannot locate own executable: {e}")))?;

    let mut cmd = std::process::Command::new(exe);
    cmd.arg("run")
        .arg("--port")
        .arg(config.port.to_string())
        .arg("--timeout")
        .arg(config.idle_timeout.as_secs().to_string())
        .arg("--minutes")
        .arg((config.lifetime.as_secs() / 60).to_string())
        .arg("--log-file")
        .arg(log_file)
        .env(runenv::ENV_KEY, key_b64)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if config.ipv6 {
        cmd.arg("--ipv6");
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.current_dir("/");
        unsafe {
            cmd.pre_exec(|| {
                // New session so the daemon survives the invoker, plus a
                // known file-creation mask.
                libc::setsid();
                libc::umask(0o022);
                Ok(())
            });
        }
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| RelayError::Fatal(format!("failed to spawn daemon body: {e}")))?;

    for _ in 0..START_POLLS {
        if let Some(status) = child
            .try_wait()
            .map_err(|e| RelayError::Fatal(format!("cannot supervise daemon body: {e}")))?
        {
            return Err(RelayError::Fatal(format!(
                "daemon exited during startup ({status}); bind failure or bad key"
            )));
        }
        if let Some(pid) = pid_file.read() {
            if pid == child.id() {
                return Ok(pid);
            }
        }
        tokio::time::sleep(START_POLL_INTERVAL).await;
    }

    Err(RelayError::Fatal(
        "daemon did not become ready in time".into(),
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
