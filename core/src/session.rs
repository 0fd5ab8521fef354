//! Session aggregate: one PTY child bound to an output log, a durable
//! history store, and the set of attached conns. Output dispatch appends
//! and fans out under one short lock, the same lock an attach samples its
//! history marker under, which is what makes replay gap- and overlap-free.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::activity::{ActivityState, ActivityTracker};
use crate::attach::{Attachment, OfferOutcome};
use crate::client::{ClientConn, ConnId};
use crate::config::Limits;
use crate::error::CoreError;
use crate::history::HistoryStore;
use crate::input::OpsLimiter;
use crate::output_log::OutputLog;
use crate::protocol::ServerMsg;
use crate::pty::PtyProcess;
use crate::sched::SessionSchedule;
use crate::user::User;

/// Unique session identifier (UUID v4). Used in the API and WS frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Who may attach and who may write stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Only the owner (or an admin) may attach.
    #[default]
    Private,
    /// Anyone may attach; only the owner (or an admin) may write.
    SharedReadonly,
    /// Anyone authenticated may attach and write.
    Public,
}

/// Fully resolved session spec. Templates, workspace materialization, and
/// isolation are collaborators: by the time this reaches the core the argv,
/// cwd, and env are final.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
    pub interactive: bool,
    pub load_history: bool,
    pub save_history: bool,
    pub visibility: Visibility,
    pub created_by: String,
    pub alias: Option<String>,
}

impl SessionSpec {
    pub fn new(argv: Vec<String>, created_by: impl Into<String>) -> Self {
        Self {
            argv,
            cwd: None,
            env: Vec::new(),
            cols: 80,
            rows: 24,
            interactive: true,
            load_history: true,
            save_history: true,
            visibility: Visibility::Private,
            created_by: created_by.into(),
            alias: None,
        }
    }
}

/// One-way lifecycle: created → running → terminated.
#[derive(Debug, Clone)]
enum Lifecycle {
    Created,
    Running,
    Terminated { exit_code: Option<i32>, ended_at: DateTime<Utc> },
}

/// Snapshot for the list/detail API.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub argv: Vec<String>,
    pub created_by: String,
    pub visibility: Visibility,
    pub interactive: bool,
    pub state: &'static str,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub output_seq: u64,
    pub activity: ActivityState,
    pub connected_clients: usize,
    pub last_activity_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_user_input_at: Option<String>,
}

pub struct Session {
    pub id: SessionId,
    pub spec: SessionSpec,
    pub created_at: DateTime<Utc>,
    pub log: OutputLog,
    pub store: Arc<HistoryStore>,
    pub activity: Arc<ActivityTracker>,
    pub schedule: SessionSchedule,
    limits: Limits,
    lifecycle: Mutex<Lifecycle>,
    /// Flips to true exactly once, at termination. Long-lived per-session
    /// tasks (activity decay, scheduler loop) watch this to stop.
    ended_tx: watch::Sender<bool>,
    pty: Mutex<Option<Arc<PtyProcess>>>,
    clients: Mutex<HashMap<ConnId, Arc<Attachment>>>,
    /// Per-session resize ops limiter, applied on top of the global one.
    pub resize_limiter: OpsLimiter,
    last_user_input_at: Mutex<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(
        id: SessionId,
        spec: SessionSpec,
        store: Arc<HistoryStore>,
        activity: Arc<ActivityTracker>,
        limits: Limits,
    ) -> Self {
        let log = OutputLog::new(Arc::clone(&store), limits.tail_bytes);
        let (ended_tx, _) = watch::channel(false);
        let resize_limiter = OpsLimiter::new(limits.session_ops_per_sec);
        Self {
            id,
            spec,
            created_at: Utc::now(),
            log,
            store,
            activity,
            schedule: SessionSchedule::default(),
            limits,
            lifecycle: Mutex::new(Lifecycle::Created),
            ended_tx,
            pty: Mutex::new(None),
            clients: Mutex::new(HashMap::new()),
            resize_limiter,
            last_user_input_at: Mutex::new(None),
        }
    }

    /// Transition created → running once the PTY is up.
    pub fn set_running(&self, pty: Option<Arc<PtyProcess>>) {
        *self.pty.lock().expect("pty mutex") = pty;
        let mut lc = self.lifecycle.lock().expect("lifecycle mutex");
        if matches!(*lc, Lifecycle::Created) {
            *lc = Lifecycle::Running;
        }
    }

    pub fn pty_handle(&self) -> Option<Arc<PtyProcess>> {
        self.pty.lock().expect("pty mutex").clone()
    }

    pub fn is_terminated(&self) -> bool {
        matches!(*self.lifecycle.lock().expect("lifecycle mutex"), Lifecycle::Terminated { .. })
    }

    /// `(exit_code, ended_at)` once terminated.
    pub fn ended_info(&self) -> Option<(Option<i32>, DateTime<Utc>)> {
        match *self.lifecycle.lock().expect("lifecycle mutex") {
            Lifecycle::Terminated { exit_code, ended_at } => Some((exit_code, ended_at)),
            _ => None,
        }
    }

    /// Observers of the termination flag (scheduler loop, activity decay).
    pub fn ended_watch(&self) -> watch::Receiver<bool> {
        self.ended_tx.subscribe()
    }

    pub fn state_name(&self) -> &'static str {
        match *self.lifecycle.lock().expect("lifecycle mutex") {
            Lifecycle::Created => "created",
            Lifecycle::Running => "running",
            Lifecycle::Terminated { .. } => "terminated",
        }
    }

    // ---- visibility / ACL ----

    pub fn can_attach(&self, user: &User) -> bool {
        match self.spec.visibility {
            Visibility::Private => user.name == self.spec.created_by || user.is_admin(),
            Visibility::SharedReadonly | Visibility::Public => true,
        }
    }

    pub fn can_write(&self, user: &User) -> bool {
        match self.spec.visibility {
            Visibility::Private | Visibility::SharedReadonly => {
                user.name == self.spec.created_by || user.is_admin()
            }
            Visibility::Public => true,
        }
    }

    pub fn can_manage(&self, user: &User) -> bool {
        user.name == self.spec.created_by || user.is_admin()
    }

    // ---- attach protocol ----

    /// Attach a conn: sample the history marker, start buffering live
    /// output, and queue the `attached` ack. The marker is sampled under the
    /// same lock output dispatch holds, so the ack always precedes the first
    /// live stdout for this conn and no byte between marker and gate-open is
    /// lost.
    pub fn attach(self: &Arc<Self>, conn: &Arc<ClientConn>) -> Result<Arc<Attachment>, CoreError> {
        if !self.can_attach(&conn.user) {
            return Err(CoreError::Forbidden);
        }
        let ended = self.ended_info();
        if ended.is_some() && !self.spec.save_history {
            return Err(CoreError::AlreadyTerminated);
        }

        let attachment = {
            let mut clients = self.clients.lock().expect("clients mutex");
            // re-attach replaces the previous attachment with a fresh marker
            clients.remove(&conn.conn_id);
            let marker = self.log.snapshot_seq();
            let should_load_history =
                self.spec.load_history && self.spec.save_history && marker > 0;
            let attachment = Arc::new(Attachment::new(
                self.id,
                Arc::clone(conn),
                marker,
                should_load_history,
                self.limits.max_pending_bytes,
            ));
            clients.insert(conn.conn_id, Arc::clone(&attachment));
            conn.note_attached(self.id);
            conn.send(ServerMsg::Attached {
                session_id: self.id,
                history_marker: marker,
                history_byte_offset: marker,
                should_load_history,
            });
            attachment
        };

        if attachment.should_load_history {
            self.spawn_history_grace(&attachment);
        } else if ended.is_some() {
            // no history sync to wait for: replay of a terminated session
            // completes immediately
            self.finish_replay(&attachment);
        }
        Ok(attachment)
    }

    /// Grace timer: if `history_loaded` has not arrived in time, surface
    /// `attach_timeout`, flush the pending queue, and open the gate
    /// (attached-with-live-only; the abandoned prefix is the client's loss).
    fn spawn_history_grace(self: &Arc<Self>, attachment: &Arc<Attachment>) {
        let weak_session = Arc::downgrade(self);
        let weak_attachment = Arc::downgrade(attachment);
        let grace = self.limits.history_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let (Some(session), Some(attachment)) =
                (weak_session.upgrade(), weak_attachment.upgrade())
            else {
                return;
            };
            if !attachment.is_buffering() {
                return;
            }
            tracing::warn!(
                session = %session.id,
                conn = %attachment.conn.conn_id,
                "history_loaded not received in time; opening gate"
            );
            attachment.conn.send(ServerMsg::Error {
                message: "history fetch timed out; live output resumes from the attach marker".into(),
                code: Some("attach_timeout"),
            });
            if attachment.open_gate(true) && session.is_terminated() {
                session.finish_replay(&attachment);
            }
        });
    }

    /// Handle `history_loaded`: flush the pending queue and go live. A
    /// second `history_loaded` is a no-op.
    pub fn mark_history_loaded(&self, conn_id: ConnId) -> Result<(), CoreError> {
        let attachment = self
            .attachment(conn_id)
            .ok_or(CoreError::NotAttached)?;
        if attachment.open_gate(true) && self.is_terminated() {
            self.finish_replay(&attachment);
        }
        Ok(())
    }

    /// Replay of a terminated session is complete: `session_ended` is the
    /// last message, then the attachment is released without a `detached`
    /// frame.
    fn finish_replay(&self, attachment: &Arc<Attachment>) {
        if let Some((exit_code, ended_at)) = self.ended_info() {
            attachment.conn.send(ServerMsg::SessionEnded {
                session_id: self.id,
                exit_code,
                ended_at: ended_at.to_rfc3339(),
            });
        }
        self.clients.lock().expect("clients mutex").remove(&attachment.conn.conn_id);
        attachment.conn.note_detached(self.id);
    }

    /// Release an attachment. Its pending queue is discarded.
    pub fn detach(&self, conn: &ClientConn) -> bool {
        let removed = self.clients.lock().expect("clients mutex").remove(&conn.conn_id);
        if let Some(attachment) = removed {
            attachment.conn.send(ServerMsg::Detached { session_id: self.id });
            conn.note_detached(self.id);
            true
        } else {
            false
        }
    }

    /// Force-detach another conn (admin/owner path).
    pub fn detach_conn(&self, target: ConnId) -> Result<(), CoreError> {
        let removed = self.clients.lock().expect("clients mutex").remove(&target);
        let Some(attachment) = removed else {
            return Err(CoreError::NotAttached);
        };
        attachment.conn.send(ServerMsg::Detached { session_id: self.id });
        attachment.conn.note_detached(self.id);
        Ok(())
    }

    pub fn attachment(&self, conn_id: ConnId) -> Option<Arc<Attachment>> {
        self.clients.lock().expect("clients mutex").get(&conn_id).cloned()
    }

    pub fn is_attached(&self, conn_id: ConnId) -> bool {
        self.clients.lock().expect("clients mutex").contains_key(&conn_id)
    }

    pub fn attached_count(&self) -> usize {
        self.clients.lock().expect("clients mutex").len()
    }

    // ---- output path ----

    /// Append a PTY chunk and fan it out. Returns true when the durable log
    /// has failed hard and the session must terminate.
    pub fn handle_output(&self, bytes: Vec<u8>) -> bool {
        if bytes.is_empty() || self.is_terminated() {
            return false;
        }
        let chunk = Bytes::from(bytes);
        let mut overflowed: Vec<Arc<Attachment>> = Vec::new();
        let fatal = {
            let clients = self.clients.lock().expect("clients mutex");
            let result = self.log.append(&chunk);
            self.activity.on_output(chunk.len());
            for attachment in clients.values() {
                if attachment.offer(&chunk) == OfferOutcome::Overflow {
                    overflowed.push(Arc::clone(attachment));
                }
            }
            result.fatal
        };
        for attachment in overflowed {
            tracing::warn!(
                session = %self.id,
                conn = %attachment.conn.conn_id,
                "pending queue overflow; detaching conn"
            );
            self.clients.lock().expect("clients mutex").remove(&attachment.conn.conn_id);
            attachment.conn.send(ServerMsg::error(&CoreError::PendingQueueOverflow));
            attachment.conn.send(ServerMsg::Detached { session_id: self.id });
            attachment.conn.note_detached(self.id);
        }
        fatal
    }

    // ---- input path ----

    /// Write stdin bytes to the PTY. The caller (InputRouter) has already
    /// cleared admission.
    pub async fn write_stdin(&self, bytes: Vec<u8>) -> Result<(), CoreError> {
        let pty = self.pty_handle().ok_or(CoreError::PtyClosed)?;
        pty.write(bytes, self.limits.input_write_timeout).await?;
        *self.last_user_input_at.lock().expect("input mutex") = Some(Utc::now());
        self.activity.on_input();
        Ok(())
    }

    /// Apply a clamped resize. Returns whether an ioctl was issued.
    pub fn resize_pty(&self, cols: u16, rows: u16) -> Result<bool, CoreError> {
        let pty = self.pty_handle().ok_or(CoreError::PtyClosed)?;
        let applied = pty.resize(cols, rows);
        if applied {
            self.activity.on_resize();
        }
        Ok(applied)
    }

    // ---- lifecycle ----

    /// Transition to terminated (idempotent; returns false if already
    /// there). Broadcasts `session_ended` as the last message to every
    /// attached conn, releases all attachments, closes the durable log, and
    /// discards scheduled rules.
    pub fn terminate(&self, exit_code: Option<i32>) -> bool {
        let ended_at = {
            let mut lc = self.lifecycle.lock().expect("lifecycle mutex");
            if matches!(*lc, Lifecycle::Terminated { .. }) {
                return false;
            }
            let ended_at = Utc::now();
            *lc = Lifecycle::Terminated { exit_code, ended_at };
            ended_at
        };
        self.ended_tx.send_replace(true);

        if let Some(pty) = self.pty.lock().expect("pty mutex").take() {
            let _ = pty.kill();
        }

        let drained: Vec<Arc<Attachment>> = {
            let mut clients = self.clients.lock().expect("clients mutex");
            clients.drain().map(|(_, a)| a).collect()
        };
        for attachment in drained {
            // a still-buffering conn gets its suffix flushed first so the
            // bytes it observes stay contiguous from its marker
            attachment.open_gate(true);
            attachment.conn.send(ServerMsg::SessionEnded {
                session_id: self.id,
                exit_code,
                ended_at: ended_at.to_rfc3339(),
            });
            attachment.conn.note_detached(self.id);
        }

        self.store.finalize();
        self.store.finalize_meta(&ended_at.to_rfc3339(), exit_code);
        self.schedule.discard(&self.store);
        tracing::info!(session = %self.id, exit_code = ?exit_code, "session terminated");
        true
    }

    /// Output pump: drains PTY chunks into the dispatch path, then waits for
    /// the exit report and terminates the session. Runs as one task per
    /// session so chunks are dispatched in issuance order.
    pub async fn pump(
        self: Arc<Self>,
        mut out_rx: tokio::sync::mpsc::Receiver<Vec<u8>>,
        mut exit_rx: tokio::sync::mpsc::Receiver<crate::pty::PtyExit>,
    ) {
        while let Some(chunk) = out_rx.recv().await {
            if self.handle_output(chunk) {
                self.terminate(None);
                return;
            }
        }
        let exit_code = exit_rx.recv().await.map(|e| e.exit_code as i32);
        self.terminate(exit_code);
    }

    pub fn info(&self) -> SessionInfo {
        let (ended_at, exit_code) = match self.ended_info() {
            Some((code, at)) => (Some(at.to_rfc3339()), code),
            None => (None, None),
        };
        SessionInfo {
            session_id: self.id,
            alias: self.spec.alias.clone(),
            argv: self.spec.argv.clone(),
            created_by: self.spec.created_by.clone(),
            visibility: self.spec.visibility,
            interactive: self.spec.interactive,
            state: self.state_name(),
            created_at: self.created_at.to_rfc3339(),
            ended_at,
            exit_code,
            output_seq: self.log.snapshot_seq(),
            activity: self.activity.state(),
            connected_clients: self.attached_count(),
            last_activity_at: self.activity.last_activity_at().to_rfc3339(),
            last_user_input_at: self
                .last_user_input_at
                .lock()
                .expect("input mutex")
                .map(|t| t.to_rfc3339()),
        }
    }

    /// Persisted metadata for this session.
    pub fn meta(&self) -> crate::history::SessionMeta {
        crate::history::SessionMeta {
            session_id: self.id,
            alias: self.spec.alias.clone(),
            argv: self.spec.argv.clone(),
            cwd: self.spec.cwd.as_ref().map(|p| p.to_string_lossy().into_owned()),
            env: self.spec.env.clone(),
            created_by: self.spec.created_by.clone(),
            visibility: self.spec.visibility,
            interactive: self.spec.interactive,
            load_history: self.spec.load_history,
            save_history: self.spec.save_history,
            created_at: self.created_at.to_rfc3339(),
            ended_at: None,
            exit_code: None,
        }
    }
}
