//! Wire protocol: one JSON text frame per message, internally tagged with
//! `type`. Client frames arrive on the WebSocket; server frames are queued
//! per conn and drained by the server's writer task. `stdout.data` is a
//! UTF-8 string (lossy at the protocol edge); the byte offsets of the
//! history range endpoint stay authoritative.

use crate::client::ConnId;
use crate::session::SessionId;

/// Client → server messages.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Request attach; session-scoped ACL applies. `session_id` may be a
    /// UUID or an alias.
    Attach { session_id: String },
    /// Release an attachment.
    Detach { session_id: String },
    /// Force-detach another conn (admin/owner only).
    DetachClient { session_id: String, target_conn_id: ConnId },
    /// History sync complete; flush the pending queue and go live.
    HistoryLoaded { session_id: String },
    /// Raw bytes to the PTY.
    Stdin { session_id: String, data: String },
    /// PTY size. Values are accepted as JSON numbers and clamped server-side;
    /// missing or non-finite values coerce to the 80x24 defaults.
    Resize {
        session_id: String,
        #[serde(default)]
        cols: Option<f64>,
        #[serde(default)]
        rows: Option<f64>,
    },
    Ping { timestamp: i64 },
}

/// Server → client messages.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    Attached {
        session_id: SessionId,
        history_marker: u64,
        history_byte_offset: u64,
        should_load_history: bool,
    },
    Detached {
        session_id: SessionId,
    },
    Stdout {
        session_id: SessionId,
        data: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        from_queue: Option<bool>,
    },
    SessionEnded {
        session_id: SessionId,
        exit_code: Option<i32>,
        ended_at: String,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<&'static str>,
    },
    /// Opaque passthrough for collaborators outside the core.
    Notification {
        payload: serde_json::Value,
    },
    Pong {
        timestamp: i64,
    },
    /// Last message before the server goes down.
    Shutdown,
}

impl ServerMsg {
    /// Control messages may evict queued stdout under backpressure; stdout
    /// itself is dropped when the queue is full.
    pub fn is_control(&self) -> bool {
        !matches!(self, ServerMsg::Stdout { .. })
    }

    /// Approximate queue cost in bytes, used against the send-queue
    /// high-water mark.
    pub fn cost(&self) -> usize {
        const FRAME_OVERHEAD: usize = 64;
        match self {
            ServerMsg::Stdout { data, .. } => data.len() + FRAME_OVERHEAD,
            ServerMsg::Error { message, .. } => message.len() + FRAME_OVERHEAD,
            _ => FRAME_OVERHEAD,
        }
    }

    pub fn error(err: &crate::error::CoreError) -> ServerMsg {
        ServerMsg::Error { message: err.to_string(), code: Some(err.code()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_parse() {
        let m: ClientMsg = serde_json::from_str(r#"{"type":"attach","session_id":"abc"}"#).unwrap();
        assert!(matches!(m, ClientMsg::Attach { session_id } if session_id == "abc"));

        let m: ClientMsg =
            serde_json::from_str(r#"{"type":"stdin","session_id":"abc","data":"ls\r"}"#).unwrap();
        assert!(matches!(m, ClientMsg::Stdin { data, .. } if data == "ls\r"));

        let m: ClientMsg =
            serde_json::from_str(r#"{"type":"resize","session_id":"abc","cols":120,"rows":40}"#)
                .unwrap();
        match m {
            ClientMsg::Resize { cols, rows, .. } => {
                assert_eq!(cols, Some(120.0));
                assert_eq!(rows, Some(40.0));
            }
            other => panic!("unexpected: {other:?}"),
        }

        // resize without dimensions still parses; the router applies defaults
        let m: ClientMsg = serde_json::from_str(r#"{"type":"resize","session_id":"abc"}"#).unwrap();
        assert!(matches!(m, ClientMsg::Resize { cols: None, rows: None, .. }));
    }

    #[test]
    fn server_frames_tag_with_type() {
        let id = SessionId::new();
        let json = serde_json::to_string(&ServerMsg::Attached {
            session_id: id,
            history_marker: 150,
            history_byte_offset: 150,
            should_load_history: true,
        })
        .unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["type"], "attached");
        assert_eq!(v["history_marker"], 150);
        assert_eq!(v["history_byte_offset"], 150);

        let json = serde_json::to_string(&ServerMsg::Stdout {
            session_id: id,
            data: "hi".into(),
            from_queue: None,
        })
        .unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["type"], "stdout");
        assert!(v.get("from_queue").is_none());
    }

    #[test]
    fn stdout_is_not_control() {
        let id = SessionId::new();
        let stdout = ServerMsg::Stdout { session_id: id, data: "x".into(), from_queue: None };
        assert!(!stdout.is_control());
        assert!(ServerMsg::Detached { session_id: id }.is_control());
        assert!(stdout.cost() > 0);
    }
}
