//! The attach/history-sync state machine. At attach time the session's
//! `output_seq` is sampled as the history marker M under the dispatch lock;
//! live output is buffered per attachment until the client reports
//! `history_loaded` for bytes `[0, M)`. The canonical stream a conn
//! observes is `history[0..M) ++ queue[M..Q) ++ live[Q..)`: no gap because
//! M is sampled before any later append can fan out, no overlap because the
//! range read is bounded by M and live delivery is gated behind it.

use std::sync::Mutex;

use bytes::Bytes;

use crate::client::{ClientConn, SendOutcome};
use crate::protocol::ServerMsg;
use crate::session::SessionId;

/// Gate state for one `(session, conn)` attachment.
enum Gate {
    /// History sync in flight: live bytes accumulate in the pending queue.
    Buffering { queue: Vec<Bytes>, queued_bytes: usize },
    /// Gate open: bytes go straight to the conn's send queue.
    Live,
    /// Pending queue overflowed; the attachment is dead and the client must
    /// re-attach for a fresh marker.
    Dropped,
}

/// Outcome of offering a live chunk to an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    Delivered,
    Buffered,
    /// Queue exceeded `max_pending_bytes`; the session must detach this conn.
    Overflow,
    /// Attachment already dropped; nothing was done.
    Ignored,
}

pub struct Attachment {
    pub session_id: SessionId,
    pub conn: std::sync::Arc<ClientConn>,
    /// The session's `output_seq` at attach time. Inclusive upper boundary
    /// for history replay, lower boundary for live delivery.
    pub marker: u64,
    pub should_load_history: bool,
    gate: Mutex<Gate>,
    max_pending_bytes: usize,
}

impl Attachment {
    /// Build an attachment. With `should_load_history == false` the gate
    /// opens immediately (the sampled buffer is intentionally discarded; the
    /// client displays only new output).
    pub fn new(
        session_id: SessionId,
        conn: std::sync::Arc<ClientConn>,
        marker: u64,
        should_load_history: bool,
        max_pending_bytes: usize,
    ) -> Self {
        let gate = if should_load_history {
            Gate::Buffering { queue: Vec::new(), queued_bytes: 0 }
        } else {
            Gate::Live
        };
        Self { session_id, conn, marker, should_load_history, gate: Mutex::new(gate), max_pending_bytes }
    }

    /// Offer a live chunk. Called under the session's dispatch lock, so the
    /// order of offers equals the order of appends.
    pub fn offer(&self, chunk: &Bytes) -> OfferOutcome {
        let mut gate = self.gate.lock().expect("gate mutex");
        match &mut *gate {
            Gate::Live => {
                self.deliver(chunk, false);
                OfferOutcome::Delivered
            }
            Gate::Buffering { queue, queued_bytes } => {
                if *queued_bytes + chunk.len() > self.max_pending_bytes {
                    *gate = Gate::Dropped;
                    OfferOutcome::Overflow
                } else {
                    *queued_bytes += chunk.len();
                    queue.push(chunk.clone());
                    OfferOutcome::Buffered
                }
            }
            Gate::Dropped => OfferOutcome::Ignored,
        }
    }

    /// Open the gate: flush the pending queue in order (marked
    /// `from_queue`) and resume direct delivery. Returns false if the gate
    /// was already open or dropped, so a second `history_loaded` is a no-op.
    pub fn open_gate(&self, flush: bool) -> bool {
        let mut gate = self.gate.lock().expect("gate mutex");
        let Gate::Buffering { queue, .. } = &mut *gate else {
            return false;
        };
        let pending = std::mem::take(queue);
        if flush {
            for chunk in &pending {
                self.deliver(chunk, true);
            }
        }
        *gate = Gate::Live;
        true
    }

    pub fn is_buffering(&self) -> bool {
        matches!(*self.gate.lock().expect("gate mutex"), Gate::Buffering { .. })
    }

    pub fn is_dropped(&self) -> bool {
        matches!(*self.gate.lock().expect("gate mutex"), Gate::Dropped)
    }

    /// Buffered bytes while history sync is in flight.
    pub fn pending_bytes(&self) -> usize {
        match &*self.gate.lock().expect("gate mutex") {
            Gate::Buffering { queued_bytes, .. } => *queued_bytes,
            _ => 0,
        }
    }

    fn deliver(&self, chunk: &Bytes, from_queue: bool) {
        let msg = ServerMsg::Stdout {
            session_id: self.session_id,
            data: String::from_utf8_lossy(chunk).into_owned(),
            from_queue: from_queue.then_some(true),
        };
        if self.conn.send(msg) == SendOutcome::MustClose {
            tracing::debug!(conn = %self.conn.conn_id, session = %self.session_id, "delivery hit closed conn");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Limits;
    use crate::user::User;
    use std::sync::Arc;

    fn conn() -> Arc<ClientConn> {
        Arc::new(ClientConn::new(User::new("alice", false), &Limits::default()))
    }

    async fn drain_stdout(conn: &ClientConn, n: usize) -> Vec<(String, Option<bool>)> {
        let mut out = Vec::new();
        for _ in 0..n {
            match conn.next_msg().await {
                Some(ServerMsg::Stdout { data, from_queue, .. }) => out.push((data, from_queue)),
                other => panic!("expected stdout, got {other:?}"),
            }
        }
        out
    }

    #[tokio::test]
    async fn buffers_until_history_loaded_then_flushes_in_order() {
        let c = conn();
        let att = Attachment::new(SessionId::new(), Arc::clone(&c), 100, true, 1024);
        assert_eq!(att.offer(&Bytes::from_static(b"one")), OfferOutcome::Buffered);
        assert_eq!(att.offer(&Bytes::from_static(b"two")), OfferOutcome::Buffered);
        assert_eq!(att.pending_bytes(), 6);

        assert!(att.open_gate(true));
        assert_eq!(att.offer(&Bytes::from_static(b"live")), OfferOutcome::Delivered);

        let msgs = drain_stdout(&c, 3).await;
        assert_eq!(msgs[0], ("one".into(), Some(true)));
        assert_eq!(msgs[1], ("two".into(), Some(true)));
        assert_eq!(msgs[2], ("live".into(), None));
    }

    #[tokio::test]
    async fn second_history_loaded_is_noop() {
        let att = Attachment::new(SessionId::new(), conn(), 0, true, 1024);
        assert!(att.open_gate(true));
        assert!(!att.open_gate(true));
    }

    #[tokio::test]
    async fn skip_history_opens_gate_immediately() {
        let c = conn();
        let att = Attachment::new(SessionId::new(), Arc::clone(&c), 100, false, 1024);
        assert!(!att.is_buffering());
        assert_eq!(att.offer(&Bytes::from_static(b"new")), OfferOutcome::Delivered);
        let msgs = drain_stdout(&c, 1).await;
        assert_eq!(msgs[0], ("new".into(), None));
    }

    #[tokio::test]
    async fn overflow_exactly_past_bound() {
        let att = Attachment::new(SessionId::new(), conn(), 0, true, 8);
        // exactly at the bound: accepted
        assert_eq!(att.offer(&Bytes::from(vec![b'x'; 8])), OfferOutcome::Buffered);
        // the next byte overflows and drops the whole queue
        assert_eq!(att.offer(&Bytes::from_static(b"y")), OfferOutcome::Overflow);
        assert!(att.is_dropped());
        assert_eq!(att.offer(&Bytes::from_static(b"z")), OfferOutcome::Ignored);
        // history_loaded on a dropped attachment does nothing
        assert!(!att.open_gate(true));
    }

    #[tokio::test]
    async fn timeout_policy_flushes_buffered_suffix() {
        // the documented choice on history-fetch timeout: flush and go live
        let c = conn();
        let att = Attachment::new(SessionId::new(), Arc::clone(&c), 5, true, 1024);
        att.offer(&Bytes::from_static(b"FGH"));
        assert!(att.open_gate(true));
        let msgs = drain_stdout(&c, 1).await;
        assert_eq!(msgs[0], ("FGH".into(), Some(true)));
        // stream from the marker onward is contiguous: FGH then live
        assert_eq!(att.offer(&Bytes::from_static(b"IJ")), OfferOutcome::Delivered);
    }
}
