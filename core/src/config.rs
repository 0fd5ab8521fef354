//! Server configuration from settings.json. A missing file means defaults;
//! a file that exists but does not parse is a startup error (the binary
//! exits with code 2). The loaded `Config` is passed explicitly into the
//! registry rather than living in a process-wide singleton.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::CoreError;

/// One entry of `auth.tokens`. When no tokens are configured the server runs
/// single-user: every connection authenticates as the admin user `local`.
#[derive(Debug, Clone)]
pub struct AuthToken {
    pub token: String,
    pub user: String,
    pub admin: bool,
}

/// Tunables for queueing, backpressure, history sync, and the scheduler.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Maximum live sessions in the registry.
    pub max_sessions: usize,
    /// Per-attachment pending queue bound while history sync is in flight.
    pub max_pending_bytes: usize,
    /// Per-conn send queue high-water mark in bytes.
    pub send_queue_bytes: usize,
    /// How long a conn may stay saturated before it is forcibly closed.
    pub backpressure_grace: Duration,
    /// How long to wait for `history_loaded` before opening the gate anyway.
    pub history_grace: Duration,
    /// Deadline for a single PTY write before it fails with `pty_busy`.
    pub input_write_timeout: Duration,
    /// How long terminated sessions stay in the registry for replay.
    pub retention: Duration,
    /// Interval of the registry cleanup pass.
    pub cleanup_interval: Duration,
    /// In-memory output tail bound (introspection only).
    pub tail_bytes: usize,
    /// Scheduler caps.
    pub max_rules_per_session: usize,
    pub max_bytes_per_rule_data: usize,
    pub max_messages_per_session: u32,
    /// Resize ops per second, globally and per session. Stdin is never
    /// rate limited.
    pub global_ops_per_sec: u32,
    pub session_ops_per_sec: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            max_pending_bytes: 512 * 1024,
            send_queue_bytes: 1024 * 1024,
            backpressure_grace: Duration::from_secs(30),
            history_grace: Duration::from_secs(5),
            input_write_timeout: Duration::from_secs(1),
            retention: Duration::from_secs(600),
            cleanup_interval: Duration::from_secs(60),
            tail_bytes: 5 * 1024 * 1024,
            max_rules_per_session: 20,
            max_bytes_per_rule_data: 8192,
            max_messages_per_session: 50,
            global_ops_per_sec: 60,
            session_ops_per_sec: 30,
        }
    }
}

/// Activity tracker tuning (see `activity.rs`).
#[derive(Debug, Clone)]
pub struct ActivityTuning {
    /// Silence before a session transitions back to inactive.
    pub inactive: Duration,
    /// Window after a resize during which transitions are suppressed
    /// (terminal redraws are not activity).
    pub suppress_after_resize: Duration,
    /// Contiguous active-period bytes required before an active transition
    /// is recorded.
    pub min_active_bytes: usize,
}

impl Default for ActivityTuning {
    fn default() -> Self {
        Self {
            inactive: Duration::from_millis(1000),
            suppress_after_resize: Duration::from_millis(250),
            min_active_bytes: 32,
        }
    }
}

/// Parsed settings.json.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Root for per-session state: `<data_dir>/sessions/<id>/`.
    pub data_dir: PathBuf,
    pub auth_tokens: Vec<AuthToken>,
    pub limits: Limits,
    pub activity: ActivityTuning,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5190,
            data_dir: default_data_dir(),
            auth_tokens: Vec::new(),
            limits: Limits::default(),
            activity: ActivityTuning::default(),
        }
    }
}

/// Default data directory: ~/.termdock.
fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home).join(".termdock")
}

impl Config {
    /// Load settings from the given path. Missing file: defaults. Present but
    /// unparseable: `ConfigMissing`, which the caller should treat as fatal.
    pub fn load(path: &Path) -> Result<Config, CoreError> {
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Config::default()),
            Err(e) => return Err(CoreError::ConfigMissing(format!("{}: {}", path.display(), e))),
        };
        let root: serde_json::Value = serde_json::from_str(&data)
            .map_err(|e| CoreError::ConfigMissing(format!("{}: {}", path.display(), e)))?;
        Ok(Self::from_value(&root))
    }

    fn from_value(root: &serde_json::Value) -> Config {
        let mut cfg = Config::default();

        if let Some(port) = root.get("port").and_then(|v| v.as_u64()) {
            cfg.port = port as u16;
        }
        if let Some(dir) = root
            .get("data_dir")
            .and_then(|v| v.as_str())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
        {
            cfg.data_dir = expand_home(dir);
        }

        if let Some(tokens) = root.get("auth").and_then(|a| a.get("tokens")).and_then(|t| t.as_array()) {
            cfg.auth_tokens = tokens
                .iter()
                .filter_map(|t| {
                    let token = t.get("token")?.as_str()?.to_string();
                    let user = t.get("user")?.as_str()?.to_string();
                    let admin = t.get("admin").and_then(|v| v.as_bool()).unwrap_or(false);
                    if token.is_empty() || user.is_empty() {
                        return None;
                    }
                    Some(AuthToken { token, user, admin })
                })
                .collect();
        }

        let limits = root.get("limits");
        let u = |key: &str| limits.and_then(|l| l.get(key)).and_then(|v| v.as_u64());
        if let Some(v) = u("max_sessions") {
            cfg.limits.max_sessions = v as usize;
        }
        if let Some(v) = u("max_pending_bytes") {
            cfg.limits.max_pending_bytes = v as usize;
        }
        if let Some(v) = u("send_queue_bytes") {
            cfg.limits.send_queue_bytes = v as usize;
        }
        if let Some(v) = u("backpressure_grace_ms") {
            cfg.limits.backpressure_grace = Duration::from_millis(v);
        }
        if let Some(v) = u("history_grace_ms") {
            cfg.limits.history_grace = Duration::from_millis(v);
        }
        if let Some(v) = u("input_write_timeout_ms") {
            cfg.limits.input_write_timeout = Duration::from_millis(v);
        }
        if let Some(v) = u("retention_secs") {
            cfg.limits.retention = Duration::from_secs(v);
        }
        if let Some(v) = u("cleanup_interval_secs") {
            cfg.limits.cleanup_interval = Duration::from_secs(v);
        }
        if let Some(v) = u("tail_bytes") {
            cfg.limits.tail_bytes = v as usize;
        }
        if let Some(v) = u("max_rules_per_session") {
            cfg.limits.max_rules_per_session = v as usize;
        }
        if let Some(v) = u("max_bytes_per_rule_data") {
            cfg.limits.max_bytes_per_rule_data = v as usize;
        }
        if let Some(v) = u("max_messages_per_session") {
            cfg.limits.max_messages_per_session = v as u32;
        }

        let activity = root.get("activity");
        let a = |key: &str| activity.and_then(|x| x.get(key)).and_then(|v| v.as_u64());
        if let Some(v) = a("inactive_ms") {
            cfg.activity.inactive = Duration::from_millis(v);
        }
        if let Some(v) = a("suppress_after_resize_ms") {
            cfg.activity.suppress_after_resize = Duration::from_millis(v);
        }
        if let Some(v) = a("min_active_bytes") {
            cfg.activity.min_active_bytes = v as usize;
        }

        cfg
    }
}

/// Expand a leading `~/` against $HOME. Paths without it pass through.
fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(&dir.path().join("settings.json")).unwrap();
        assert_eq!(cfg.port, 5190);
        assert!(cfg.auth_tokens.is_empty());
        assert_eq!(cfg.limits.max_pending_bytes, 512 * 1024);
    }

    #[test]
    fn invalid_json_is_config_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert_eq!(err.code(), "config_missing");
    }

    #[test]
    fn fields_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{
                "port": 9000,
                "data_dir": "/tmp/td-test",
                "auth": { "tokens": [ { "token": "t1", "user": "alice", "admin": true } ] },
                "limits": { "max_pending_bytes": 1024, "history_grace_ms": 250 },
                "activity": { "min_active_bytes": 4 }
            }"#,
        )
        .unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/td-test"));
        assert_eq!(cfg.auth_tokens.len(), 1);
        assert!(cfg.auth_tokens[0].admin);
        assert_eq!(cfg.limits.max_pending_bytes, 1024);
        assert_eq!(cfg.limits.history_grace, Duration::from_millis(250));
        assert_eq!(cfg.activity.min_active_bytes, 4);
        // untouched fields keep defaults
        assert_eq!(cfg.limits.send_queue_bytes, 1024 * 1024);
    }
}
