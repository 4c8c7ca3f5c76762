use std::path::PathBuf;

/// Base64 pre-shared key material.
pub const ENV_KEY: &str = "RELAYD_KEY";
/// Override for the PID marker path.
pub const ENV_PID: &str = "RELAYD_PID";
/// Override for the detached daemon's log file.
pub const ENV_LOG_FILE: &str = "RELAYD_LOG_FILE";
/// Log filter directives (tracing env-filter syntax).
pub const ENV_LOG: &str = "RELAYD_LOG";

const PID_FILE_NAME: &str = ".relayd.pid";
const LOG_FILE_NAME: &str = ".relayd.log";

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// PID marker path ($RELAYD_PID or ~/.relayd.pid)
pub fn pid_path() -> PathBuf {
    let path = env_opt(ENV_PID)
        .map(PathBuf::from)
        .unwrap_or_else(|| home_dir().join(PID_FILE_NAME));
    tracing::trace!(path = %path.display(), "PID marker path");
    path
}

/// Daemon log file path ($RELAYD_LOG_FILE or ~/.relayd.log)
pub fn log_path() -> PathBuf {
    let path = env_opt(ENV_LOG_FILE)
        .map(PathBuf::from)
        .unwrap_or_else(|| home_dir().join(LOG_FILE_NAME));
    tracing::trace!(path = %path.display(), "Daemon log path");
    path
}

/// Pre-shared key material from the environment ($RELAYD_KEY)
pub fn key() -> Option<String> {
    env_opt(ENV_KEY)
}
