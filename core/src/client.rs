//! One WebSocket endpoint's server-side state: identity, attachment set,
//! and a bounded send queue drained by the server's writer task. Fan-out
//! never waits on a slow client: when the queue is over its high-water mark
//! stdout is dropped (with a counter bump), control messages evict the
//! oldest stdout instead, and a conn that stays saturated past the grace
//! period is forcibly closed.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::config::Limits;
use crate::protocol::ServerMsg;
use crate::session::SessionId;
use crate::user::User;

/// Unique connection identifier (UUID v4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ConnId(pub uuid::Uuid);

impl ConnId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Result of enqueueing a message for this conn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// Dropped under backpressure (stdout only).
    Dropped,
    /// Saturated past the grace period; the conn has been closed.
    MustClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnState {
    Open,
    /// Close requested, queue still draining to the wire.
    Draining,
    Closed,
}

struct QueueInner {
    queue: VecDeque<ServerMsg>,
    queued_bytes: usize,
    dropped: u64,
    saturated_since: Option<Instant>,
    closing: bool,
}

pub struct ClientConn {
    pub conn_id: ConnId,
    pub user: User,
    inner: Mutex<QueueInner>,
    notify: Notify,
    max_bytes: usize,
    grace: Duration,
    attached: Mutex<HashSet<SessionId>>,
}

impl ClientConn {
    pub fn new(user: User, limits: &Limits) -> Self {
        Self {
            conn_id: ConnId::new(),
            user,
            inner: Mutex::new(QueueInner {
                queue: VecDeque::new(),
                queued_bytes: 0,
                dropped: 0,
                saturated_since: None,
                closing: false,
            }),
            notify: Notify::new(),
            max_bytes: limits.send_queue_bytes,
            grace: limits.backpressure_grace,
            attached: Mutex::new(HashSet::new()),
        }
    }

    /// Enqueue a message. Non-blocking by design: the appending task hands
    /// off here and continues regardless of how slow this client is.
    pub fn send(&self, msg: ServerMsg) -> SendOutcome {
        let mut inner = self.inner.lock().expect("send queue mutex");
        if inner.closing {
            return SendOutcome::Dropped;
        }
        let cost = msg.cost();
        if inner.queued_bytes + cost <= self.max_bytes {
            inner.saturated_since = None;
            inner.queued_bytes += cost;
            inner.queue.push_back(msg);
            drop(inner);
            self.notify.notify_one();
            return SendOutcome::Queued;
        }

        if msg.is_control() {
            // Control messages replace the oldest stdout chunks; they are
            // accepted even if no stdout can be evicted.
            while inner.queued_bytes + cost > self.max_bytes {
                let Some(idx) = inner.queue.iter().position(|m| !m.is_control()) else { break };
                if let Some(evicted) = inner.queue.remove(idx) {
                    inner.queued_bytes -= evicted.cost();
                    inner.dropped += 1;
                }
            }
            inner.queued_bytes += cost;
            inner.queue.push_back(msg);
            drop(inner);
            self.notify.notify_one();
            return SendOutcome::Queued;
        }

        inner.dropped += 1;
        let since = *inner.saturated_since.get_or_insert_with(Instant::now);
        if since.elapsed() > self.grace {
            inner.closing = true;
            drop(inner);
            self.notify.notify_one();
            tracing::warn!(conn = %self.conn_id, "conn saturated past grace; closing");
            return SendOutcome::MustClose;
        }
        SendOutcome::Dropped
    }

    /// Next message for the wire. Returns `None` once the conn is closed and
    /// the queue has drained; the server's writer task exits on that.
    pub async fn next_msg(&self) -> Option<ServerMsg> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().expect("send queue mutex");
                if let Some(msg) = inner.queue.pop_front() {
                    inner.queued_bytes -= msg.cost();
                    return Some(msg);
                }
                if inner.closing {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Request close. Already-queued messages still drain to the wire.
    pub fn close(&self) {
        self.inner.lock().expect("send queue mutex").closing = true;
        self.notify.notify_one();
    }

    pub fn state(&self) -> ConnState {
        let inner = self.inner.lock().expect("send queue mutex");
        match (inner.closing, inner.queue.is_empty()) {
            (false, _) => ConnState::Open,
            (true, false) => ConnState::Draining,
            (true, true) => ConnState::Closed,
        }
    }

    pub fn is_closing(&self) -> bool {
        self.inner.lock().expect("send queue mutex").closing
    }

    /// Messages dropped under backpressure so far.
    pub fn dropped_count(&self) -> u64 {
        self.inner.lock().expect("send queue mutex").dropped
    }

    pub fn note_attached(&self, session_id: SessionId) {
        self.attached.lock().expect("attached mutex").insert(session_id);
    }

    pub fn note_detached(&self, session_id: SessionId) {
        self.attached.lock().expect("attached mutex").remove(&session_id);
    }

    pub fn is_attached(&self, session_id: SessionId) -> bool {
        self.attached.lock().expect("attached mutex").contains(&session_id)
    }

    pub fn attached_sessions(&self) -> Vec<SessionId> {
        self.attached.lock().expect("attached mutex").iter().copied().collect()
    }
}
