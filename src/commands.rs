use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::info;

use relayd::daemon::lifecycle::{self, Lifecycle, LifecycleState};
use relayd::daemon::{DaemonConfig, DaemonServer, Deadline, Envelope, PidFile};
use relayd::runenv;

use crate::args::ServeArgs;

/// Serve in the foreground. This is the daemon body: `start` re-execs it
/// detached, but it can equally be run under a supervisor or by hand.
pub async fn cmd_run(args: ServeArgs) -> Result<()> {
    let key = resolve_key(&args)?;
    let envelope = Envelope::from_base64(&key).context("invalid pre-shared key")?;
    let config = daemon_config(&args);

    let lifecycle = Lifecycle::new();
    let pid_file = PidFile::new(runenv::pid_path());
    pid_file.clear_stale();

    let server = DaemonServer::new(config, envelope);

    // Bind before writing the marker: the marker's appearance is the
    // readiness signal `start` polls for, and a bind failure must be fatal
    // before the daemon commits to running.
    let listener = server.bind().await?;
    pid_file.write_self()?;

    let deadline = Deadline::after(Duration::from_secs(args.minutes * 60));
    info!(
        port = args.port,
        minutes = args.minutes,
        pid = std::process::id(),
        "daemon up"
    );

    let result = server.serve(listener, deadline, lifecycle).await;
    pid_file.remove();
    result.map_err(Into::into)
}

/// Detach the daemon body into the background and report to the invoker.
pub async fn cmd_start(args: ServeArgs) -> Result<()> {
    let key = resolve_key(&args)?;
    // Malformed key material must be reported here, before any detachment.
    Envelope::from_base64(&key).context("invalid pre-shared key")?;

    let pid_file = PidFile::new(runenv::pid_path());
    pid_file.clear_stale();

    let config = daemon_config(&args);
    let log_file = args.log_file.clone().unwrap_or_else(runenv::log_path);

    let mut lifecycle = Lifecycle::new();
    lifecycle.transition(LifecycleState::Detaching);
    let pid = lifecycle::detach(&config, &key, &log_file, &pid_file).await?;

    println!(
        "daemonized on port {} for {} minutes, pid {}",
        args.port, args.minutes, pid
    );
    Ok(())
}

/// Force-kill the instance recorded in the PID marker.
pub fn cmd_stop() -> Result<()> {
    let pid_file = PidFile::new(runenv::pid_path());
    match pid_file.live_pid() {
        Some(pid) => {
            lifecycle::force_kill(pid);
            pid_file.remove();
            println!("stopped daemon (pid {pid})");
        }
        None => {
            pid_file.remove();
            println!("no daemon running");
        }
    }
    Ok(())
}

/// Report marker state and liveness of the recorded PID.
pub fn cmd_status() -> Result<()> {
    let pid_file = PidFile::new(runenv::pid_path());
    match pid_file.live_pid() {
        Some(pid) => println!(
            "daemon running (pid {pid}, marker {})",
            pid_file.path().display()
        ),
        None => println!("daemon not running"),
    }
    Ok(())
}

fn resolve_key(args: &ServeArgs) -> Result<String> {
    match args.key.clone().or_else(runenv::key) {
        Some(key) => Ok(key),
        None => bail!("no pre-shared key: pass --key or set {}", runenv::ENV_KEY),
    }
}

fn daemon_config(args: &ServeArgs) -> DaemonConfig {
    DaemonConfig {
        port: args.port,
        ipv6: args.ipv6,
        idle_timeout: Duration::from_secs(args.timeout),
        lifetime: Duration::from_secs(args.minutes * 60),
    }
}
