//! Error taxonomy for the session core. Every rejection that reaches a client
//! carries a stable `code()` string, sent in `error{code}` wire messages.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    // Config / preconditions: fatal at startup, synchronous rejection for requests.
    #[error("configuration missing or invalid: {0}")]
    ConfigMissing(String),
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    // Authentication / authorization.
    #[error("not authenticated")]
    Unauthenticated,
    #[error("forbidden")]
    Forbidden,

    // Not-found.
    #[error("session not found")]
    SessionNotFound,
    #[error("scheduled rule not found")]
    RuleNotFound,

    // State.
    #[error("not attached to session")]
    NotAttached,
    #[error("session is not interactive")]
    NotInteractive,
    #[error("session already terminated")]
    AlreadyTerminated,

    // Resource: caller may retry later.
    #[error("session limit exceeded")]
    SessionLimitExceeded,
    #[error("schedule cap exceeded: {0}")]
    ScheduleCapExceeded(&'static str),
    #[error("pending queue overflow")]
    PendingQueueOverflow,
    #[error("alias already in use")]
    AliasInUse,

    // Transient I/O: retried internally once where safe, then surfaced.
    #[error("pty input busy")]
    PtyBusy,
    #[error("pty closed")]
    PtyClosed,
    #[error("pty write failed: {0}")]
    PtyWriteFailed(String),
    #[error("history read failed: {0}")]
    HistoryReadFailed(String),

    // Fatal runtime: the owning session transitions to terminated.
    #[error("spawn failed: {0}")]
    SpawnFailed(String),
    #[error("durable log failed: {0}")]
    DurableLogFailed(String),
}

impl CoreError {
    /// Stable wire code for `error{code}` messages and HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::ConfigMissing(_) => "config_missing",
            CoreError::InvalidParams(_) => "invalid_params",
            CoreError::Unauthenticated => "unauthenticated",
            CoreError::Forbidden => "forbidden",
            CoreError::SessionNotFound => "session_not_found",
            CoreError::RuleNotFound => "rule_not_found",
            CoreError::NotAttached => "not_attached",
            CoreError::NotInteractive => "not_interactive",
            CoreError::AlreadyTerminated => "already_terminated",
            CoreError::SessionLimitExceeded => "session_limit_exceeded",
            CoreError::ScheduleCapExceeded(_) => "schedule_cap_exceeded",
            CoreError::PendingQueueOverflow => "pending_overflow",
            CoreError::AliasInUse => "alias_in_use",
            CoreError::PtyBusy => "pty_busy",
            CoreError::PtyClosed => "pty_closed",
            CoreError::PtyWriteFailed(_) => "pty_write_failed",
            CoreError::HistoryReadFailed(_) => "history_read_failed",
            CoreError::SpawnFailed(_) => "spawn_failed",
            CoreError::DurableLogFailed(_) => "durable_log_failed",
        }
    }
}
