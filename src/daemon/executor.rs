//! Command execution on behalf of the controller.

use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::daemon::protocol::Response;

/// Validate and run one command request, capturing exit code and streams.
///
/// A missing required field produces a failure response naming it and
/// spawns nothing. Runs on a worker task so the session task can keep the
/// connection alive with heartbeats while the command executes.
pub async fn execute(
    cmd: Option<String>,
    tmp_path: Option<String>,
    executable: Option<String>,
) -> Response {
    let Some(cmd) = cmd.filter(|v| !v.is_empty()) else {
        return Response::failure("missing required field 'cmd'");
    };
    let Some(tmp_path) = tmp_path.filter(|v| !v.is_empty()) else {
        return Response::failure("missing required field 'tmp_path'");
    };
    let Some(executable) = executable.filter(|v| !v.is_empty()) else {
        return Response::failure("missing required field 'executable'");
    };

    debug!(%cmd, %executable, tmp = %tmp_path, "running controller command");

    // Spawned fds are close-on-exec, so the child inherits nothing beyond
    // the stdio wiring below.
    let output = match Command::new(&executable)
        .arg("-c")
        .arg(&cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
    {
        Ok(output) => output,
        Err(e) => {
            return Response::failure(format!("failed to spawn '{executable}': {e}"));
        }
    };

    let rc = output.status.code().unwrap_or(-1);
    debug!(rc, "controller command finished");

    Response::Exec {
        rc,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
