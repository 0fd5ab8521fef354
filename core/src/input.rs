//! Input admission: stdin and resize from conns (and synthesized stdin from
//! the scheduler) are checked against attachment, interactivity, and
//! visibility before touching the PTY. Resize shares a global and a
//! per-session ops limiter; stdin is never rate limited so pastes pass
//! through at WebSocket frame granularity.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::client::ClientConn;
use crate::error::CoreError;
use crate::session::Session;
use crate::user::User;

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;
pub const MIN_COLS: u16 = 40;
pub const MIN_ROWS: u16 = 10;

/// Token-bucket ops limiter. Refills continuously at `per_sec`, with a burst
/// of the same size.
pub struct OpsLimiter {
    inner: Mutex<LimiterInner>,
    rate: f64,
    burst: f64,
}

struct LimiterInner {
    tokens: f64,
    last_refill: Instant,
}

impl OpsLimiter {
    pub fn new(per_sec: u32) -> Self {
        let rate = per_sec.max(1) as f64;
        Self { inner: Mutex::new(LimiterInner { tokens: rate, last_refill: Instant::now() }), rate, burst: rate }
    }

    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().expect("limiter mutex");
        let now = Instant::now();
        let elapsed = now.duration_since(inner.last_refill).as_secs_f64();
        inner.tokens = (inner.tokens + elapsed * self.rate).min(self.burst);
        inner.last_refill = now;
        if inner.tokens >= 1.0 {
            inner.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Where an input message came from. The scheduler's pseudo-conn carries the
/// owner's identity and skips the attachment check (it is never attached),
/// but still passes interactivity and visibility.
pub enum InputSource<'a> {
    Conn(&'a Arc<ClientConn>),
    Scheduler { user: User },
}

impl InputSource<'_> {
    fn user(&self) -> &User {
        match self {
            InputSource::Conn(conn) => &conn.user,
            InputSource::Scheduler { user } => user,
        }
    }
}

pub struct InputRouter {
    global_ops: OpsLimiter,
}

impl InputRouter {
    pub fn new(limits: &crate::config::Limits) -> Self {
        Self { global_ops: OpsLimiter::new(limits.global_ops_per_sec) }
    }

    /// Admit stdin into a session. Preconditions, in order: attached (conns
    /// only), interactive, not terminated, visibility write rule. Then the
    /// PTY write, surfacing `pty_busy`/`pty_write_failed` to the caller.
    pub async fn handle_stdin(
        &self,
        session: &Arc<Session>,
        source: &InputSource<'_>,
        data: &[u8],
    ) -> Result<(), CoreError> {
        if let InputSource::Conn(conn) = source {
            if !session.is_attached(conn.conn_id) {
                return Err(CoreError::NotAttached);
            }
        }
        if !session.spec.interactive {
            return Err(CoreError::NotInteractive);
        }
        if session.is_terminated() {
            return Err(CoreError::AlreadyTerminated);
        }
        if !session.can_write(source.user()) {
            return Err(CoreError::Forbidden);
        }
        session.write_stdin(data.to_vec()).await
    }

    /// Admit a resize. Resize can race detach and termination, so failures
    /// here are silent: not-attached, terminated, and rate-limited requests
    /// are dropped rather than surfaced.
    pub async fn handle_resize(
        &self,
        session: &Arc<Session>,
        conn: &Arc<ClientConn>,
        cols: Option<f64>,
        rows: Option<f64>,
    ) -> Result<(), CoreError> {
        if !session.is_attached(conn.conn_id) {
            return Ok(());
        }
        if session.attached_count() == 0 || session.is_terminated() {
            return Ok(());
        }
        if !self.global_ops.try_acquire() || !session.resize_limiter.try_acquire() {
            tracing::debug!(session = %session.id, "resize rate limited");
            return Ok(());
        }
        let (cols, rows) = clamp_dims(cols, rows);
        session.resize_pty(cols, rows)?;
        Ok(())
    }
}

/// Clamp requested dimensions: non-finite or missing values coerce to the
/// 80x24 defaults, then cols ≥ 40 and rows ≥ 10.
pub fn clamp_dims(cols: Option<f64>, rows: Option<f64>) -> (u16, u16) {
    let coerce = |value: Option<f64>, default: u16| -> u16 {
        match value {
            Some(v) if v.is_finite() && v >= 0.0 => v.min(u16::MAX as f64) as u16,
            _ => default,
        }
    };
    let cols = coerce(cols, DEFAULT_COLS).max(MIN_COLS);
    let rows = coerce(rows, DEFAULT_ROWS).max(MIN_ROWS);
    (cols, rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityTracker;
    use crate::config::{ActivityTuning, Limits};
    use crate::history::HistoryStore;
    use crate::session::{SessionId, SessionSpec, Visibility};

    fn build_session(spec: SessionSpec) -> (tempfile::TempDir, Arc<Session>) {
        let dir = tempfile::tempdir().unwrap();
        let id = SessionId::new();
        let store = Arc::new(HistoryStore::create(dir.path(), id, true).unwrap());
        let activity = Arc::new(ActivityTracker::new(ActivityTuning::default()));
        let session = Arc::new(Session::new(id, spec, store, activity, Limits::default()));
        session.set_running(None);
        (dir, session)
    }

    fn conn_for(name: &str, admin: bool) -> Arc<ClientConn> {
        Arc::new(ClientConn::new(User::new(name, admin), &Limits::default()))
    }

    #[test]
    fn clamping_rules() {
        assert_eq!(clamp_dims(Some(120.0), Some(40.0)), (120, 40));
        assert_eq!(clamp_dims(Some(10.0), Some(3.0)), (40, 10));
        assert_eq!(clamp_dims(Some(f64::NAN), Some(f64::INFINITY)), (80, 24));
        assert_eq!(clamp_dims(None, None), (80, 24));
        assert_eq!(clamp_dims(Some(-5.0), Some(24.0)), (80, 24));
        // boundary: exactly at the minimums passes through
        assert_eq!(clamp_dims(Some(40.0), Some(10.0)), (40, 10));
    }

    #[test]
    fn ops_limiter_caps_burst() {
        let limiter = OpsLimiter::new(2);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test]
    async fn stdin_requires_attachment() {
        let (_tmp, session) = build_session(SessionSpec::new(vec!["sh".into()], "alice"));
        let router = InputRouter::new(&Limits::default());
        let conn = conn_for("alice", false);
        let err = router
            .handle_stdin(&session, &InputSource::Conn(&conn), b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotAttached));
    }

    #[tokio::test]
    async fn stdin_rejected_on_non_interactive_session() {
        let mut spec = SessionSpec::new(vec!["sh".into()], "alice");
        spec.interactive = false;
        let (_tmp, session) = build_session(spec);
        let router = InputRouter::new(&Limits::default());
        let conn = conn_for("alice", false);
        session.attach(&conn).unwrap();
        let err = router
            .handle_stdin(&session, &InputSource::Conn(&conn), b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotInteractive));
    }

    #[tokio::test]
    async fn stdin_forbidden_for_readonly_viewer() {
        // bob attaches to alice's shared_readonly session, stdin rejected
        let mut spec = SessionSpec::new(vec!["sh".into()], "alice");
        spec.visibility = Visibility::SharedReadonly;
        let (_tmp, session) = build_session(spec);
        let router = InputRouter::new(&Limits::default());
        let bob = conn_for("bob", false);
        session.attach(&bob).unwrap();
        let err = router
            .handle_stdin(&session, &InputSource::Conn(&bob), b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Forbidden));
        // bob stays attached and keeps receiving stdout
        assert!(session.is_attached(bob.conn_id));
    }

    #[tokio::test]
    async fn scheduler_source_skips_attachment_but_not_acl() {
        let mut spec = SessionSpec::new(vec!["sh".into()], "alice");
        spec.visibility = Visibility::SharedReadonly;
        let (_tmp, session) = build_session(spec);
        let router = InputRouter::new(&Limits::default());
        // owner pseudo-identity passes admission; the write then fails only
        // because this test session has no PTY behind it
        let owner = InputSource::Scheduler { user: User::scheduler_for("alice") };
        let err = router.handle_stdin(&session, &owner, b"ls\r").await.unwrap_err();
        assert!(matches!(err, CoreError::PtyClosed));
        // a stranger's identity is still rejected by the write rule
        let stranger = InputSource::Scheduler { user: User::new("mallory", false) };
        let err = router.handle_stdin(&session, &stranger, b"ls\r").await.unwrap_err();
        assert!(matches!(err, CoreError::Forbidden));
    }

    #[tokio::test]
    async fn resize_is_silent_when_not_attached() {
        let (_tmp, session) = build_session(SessionSpec::new(vec!["sh".into()], "alice"));
        let router = InputRouter::new(&Limits::default());
        let conn = conn_for("alice", false);
        // not attached: dropped without error
        router
            .handle_resize(&session, &conn, Some(100.0), Some(30.0))
            .await
            .unwrap();
    }
}
