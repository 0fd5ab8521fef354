//! Append-only per-session output log with a monotonic byte offset (`seq`).
//! The durable file is the source of truth for range reads; the in-memory
//! tail is a bounded convenience for operational introspection and never
//! affects correctness. Durable writes are best-effort: the first failure
//! marks the log unhealthy and appends continue in memory, a second failure
//! is fatal so the session can terminate instead of silently diverging.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::history::HistoryStore;

/// Fixed-capacity tail of recent output (bytes). New data appends; when over
/// capacity, oldest bytes are dropped.
pub struct TailBuffer {
    data: Mutex<Vec<u8>>,
    cap: usize,
}

impl TailBuffer {
    pub fn new(cap: usize) -> Self {
        Self { data: Mutex::new(Vec::new()), cap }
    }

    /// Append bytes; if over capacity, drop oldest.
    pub fn push(&self, bytes: &[u8]) {
        let mut g = self.data.lock().expect("tail mutex");
        g.extend_from_slice(bytes);
        if g.len() > self.cap {
            let excess = g.len() - self.cap;
            g.drain(..excess);
        }
    }

    /// Copy of the current tail contents.
    pub fn dump(&self) -> Vec<u8> {
        self.data.lock().expect("tail mutex").clone()
    }
}

/// Outcome of an append: the offset the bytes begin at, and whether the
/// durable log has failed hard enough that the session must terminate.
#[derive(Debug, Clone, Copy)]
pub struct AppendResult {
    pub start_seq: u64,
    pub fatal: bool,
}

pub struct OutputLog {
    /// Total bytes appended since session creation. Monotonic; published
    /// with Release so an attach snapshot taken under the session's
    /// dispatch lock sees every prior append.
    seq: AtomicU64,
    tail: TailBuffer,
    store: Arc<HistoryStore>,
    /// Durable write failures so far. 0 = healthy, 1 = degraded, 2+ = fatal.
    strikes: AtomicU8,
}

impl OutputLog {
    pub fn new(store: Arc<HistoryStore>, tail_cap: usize) -> Self {
        Self { seq: AtomicU64::new(0), tail: TailBuffer::new(tail_cap), store, strikes: AtomicU8::new(0) }
    }

    /// Append bytes: advances `seq` by `len(bytes)` and returns the offset
    /// they begin at. Appending zero bytes is a no-op. The caller (the
    /// session's dispatch path) holds its client lock across append +
    /// fan-out, which is what makes the attach marker race-free.
    pub fn append(&self, bytes: &[u8]) -> AppendResult {
        let start_seq = self.seq.load(Ordering::Acquire);
        if bytes.is_empty() {
            return AppendResult { start_seq, fatal: false };
        }
        self.tail.push(bytes);
        let mut fatal = false;
        if let Err(e) = self.store.append(bytes) {
            let strikes = self.strikes.fetch_add(1, Ordering::AcqRel) + 1;
            if strikes == 1 {
                tracing::warn!(error = %e, "durable output log write failed; continuing in memory");
            } else {
                tracing::error!(error = %e, "durable output log failed again; terminating session");
                fatal = true;
            }
        }
        self.seq.store(start_seq + bytes.len() as u64, Ordering::Release);
        AppendResult { start_seq, fatal }
    }

    /// Current `seq`: total bytes appended since creation.
    pub fn snapshot_seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Read `[start, end_inclusive]` from the durable store. Empty when
    /// `start` is at or past `seq`; the end is capped at `seq - 1`.
    pub fn read_range(&self, start: u64, end_inclusive: u64) -> Result<Vec<u8>, crate::error::CoreError> {
        let seq = self.snapshot_seq();
        if seq == 0 || start >= seq {
            return Ok(Vec::new());
        }
        self.store.read_range(start, end_inclusive.min(seq - 1))
    }

    pub fn healthy(&self) -> bool {
        self.strikes.load(Ordering::Acquire) == 0
    }

    /// Bounded in-memory tail (introspection only).
    pub fn tail(&self) -> Vec<u8> {
        self.tail.dump()
    }
}
