//! Durable per-session state under `<data_dir>/sessions/<id>/`:
//! `output.log` (append-only raw bytes; offsets ARE the protocol's seq
//! values), `meta.json`, and `scheduled.json`. One appender per session;
//! readers open their own handle and only see bytes at or below the
//! published high-water mark, so range reads are safe against the writer.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::CoreError;
use crate::session::{SessionId, Visibility};

const OUTPUT_FILE: &str = "output.log";
const META_FILE: &str = "meta.json";
const SCHEDULE_FILE: &str = "scheduled.json";

/// Persisted session metadata, written at create and finalized at
/// termination.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionMeta {
    pub session_id: SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub argv: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    pub env: Vec<(String, String)>,
    pub created_by: String,
    pub visibility: Visibility,
    pub interactive: bool,
    pub load_history: bool,
    pub save_history: bool,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Append-only byte log plus metadata files for one session.
pub struct HistoryStore {
    dir: PathBuf,
    /// When false (save_history off) appends are dropped and range reads
    /// come back empty.
    enabled: bool,
    writer: Mutex<Option<File>>,
    /// Bytes durably written. Published with Release so readers that load it
    /// with Acquire never read past what is on disk.
    high_water: AtomicU64,
}

impl HistoryStore {
    /// Create the session directory and open the output log for append.
    pub fn create(data_dir: &Path, id: SessionId, enabled: bool) -> Result<Self, CoreError> {
        let dir = data_dir.join("sessions").join(id.to_string());
        std::fs::create_dir_all(&dir)
            .map_err(|e| CoreError::DurableLogFailed(format!("{}: {}", dir.display(), e)))?;
        let writer = if enabled {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(OUTPUT_FILE))
                .map_err(|e| CoreError::DurableLogFailed(e.to_string()))?;
            Some(file)
        } else {
            None
        };
        Ok(Self { dir, enabled, writer: Mutex::new(writer), high_water: AtomicU64::new(0) })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Bytes durably written so far.
    pub fn durable_len(&self) -> u64 {
        self.high_water.load(Ordering::Acquire)
    }

    /// Append bytes to the output log. The high-water mark advances only
    /// after the write succeeds, so a concurrent reader never observes a
    /// partially written suffix.
    pub fn append(&self, bytes: &[u8]) -> Result<(), CoreError> {
        if !self.enabled || bytes.is_empty() {
            return Ok(());
        }
        let mut guard = self.writer.lock().expect("history writer mutex");
        let Some(file) = guard.as_mut() else {
            return Err(CoreError::DurableLogFailed("output log closed".into()));
        };
        file.write_all(bytes)
            .map_err(|e| CoreError::DurableLogFailed(e.to_string()))?;
        self.high_water.fetch_add(bytes.len() as u64, Ordering::Release);
        Ok(())
    }

    /// Read the inclusive byte range `[start, end]` from the output log,
    /// capped at the durable high-water mark. Ranges past the end return an
    /// empty buffer rather than an error.
    pub fn read_range(&self, start: u64, end_inclusive: u64) -> Result<Vec<u8>, CoreError> {
        let durable = self.durable_len();
        if !self.enabled || durable == 0 || start >= durable || end_inclusive < start {
            return Ok(Vec::new());
        }
        let end = end_inclusive.min(durable - 1);
        let len = (end - start + 1) as usize;
        let mut file = File::open(self.dir.join(OUTPUT_FILE))
            .map_err(|e| CoreError::HistoryReadFailed(e.to_string()))?;
        file.seek(SeekFrom::Start(start))
            .map_err(|e| CoreError::HistoryReadFailed(e.to_string()))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)
            .map_err(|e| CoreError::HistoryReadFailed(e.to_string()))?;
        Ok(buf)
    }

    /// Fsync and close the output log. Called once at session termination;
    /// appends after this fail.
    pub fn finalize(&self) {
        let mut guard = self.writer.lock().expect("history writer mutex");
        if let Some(file) = guard.take() {
            if let Err(e) = file.sync_all() {
                tracing::warn!(dir = %self.dir.display(), error = %e, "output log fsync failed");
            }
        }
    }

    /// Write meta.json (atomic tmp+rename).
    pub fn write_meta(&self, meta: &SessionMeta) {
        if let Err(e) = write_json_atomic(&self.dir.join(META_FILE), meta) {
            tracing::warn!(dir = %self.dir.display(), error = %e, "meta.json write failed");
        }
    }

    /// Update meta.json with the terminal fields. Tolerates a missing file
    /// (best-effort durability).
    pub fn finalize_meta(&self, ended_at: &str, exit_code: Option<i32>) {
        let path = self.dir.join(META_FILE);
        let Ok(data) = std::fs::read_to_string(&path) else { return };
        let Ok(mut meta) = serde_json::from_str::<SessionMeta>(&data) else { return };
        meta.ended_at = Some(ended_at.to_string());
        meta.exit_code = exit_code;
        self.write_meta(&meta);
    }

    /// Snapshot the scheduler rules (atomic tmp+rename).
    pub fn write_schedule<T: serde::Serialize>(&self, rules: &T) {
        if let Err(e) = write_json_atomic(&self.dir.join(SCHEDULE_FILE), rules) {
            tracing::warn!(dir = %self.dir.display(), error = %e, "scheduled.json write failed");
        }
    }

    /// Remove the rule snapshot (session terminated; rules are discarded).
    pub fn discard_schedule(&self) {
        let path = self.dir.join(SCHEDULE_FILE);
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "scheduled.json removal failed");
            }
        }
    }
}

/// Write a JSON file atomically: serialize to `.tmp`, then rename over.
fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_string_pretty(value).map_err(std::io::Error::other)?;
    std::fs::write(&tmp, data)?;
    std::fs::rename(tmp, path)
}

/// Startup sweep: sessions never resume across restarts, so scheduled.json
/// snapshots left by a previous process belong to dead sessions and are
/// discarded.
pub fn sweep_stale_schedules(data_dir: &Path) {
    let sessions = data_dir.join("sessions");
    let Ok(entries) = std::fs::read_dir(&sessions) else { return };
    for entry in entries.filter_map(|e| e.ok()) {
        let stale = entry.path().join(SCHEDULE_FILE);
        if stale.exists() {
            if let Err(e) = std::fs::remove_file(&stale) {
                tracing::warn!(path = %stale.display(), error = %e, "stale schedule sweep failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(enabled: bool) -> (tempfile::TempDir, HistoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let st = HistoryStore::create(dir.path(), SessionId::new(), enabled).unwrap();
        (dir, st)
    }

    #[test]
    fn append_then_range_read_is_exact() {
        let (_tmp, st) = store(true);
        st.append(b"ABCDE").unwrap();
        st.append(b"FGH").unwrap();
        assert_eq!(st.durable_len(), 8);
        assert_eq!(st.read_range(0, 4).unwrap(), b"ABCDE");
        assert_eq!(st.read_range(5, 7).unwrap(), b"FGH");
        assert_eq!(st.read_range(2, 6).unwrap(), b"CDEFG");
    }

    #[test]
    fn range_past_end_caps_at_high_water() {
        let (_tmp, st) = store(true);
        st.append(b"ABCDE").unwrap();
        assert_eq!(st.read_range(0, 999).unwrap(), b"ABCDE");
        assert_eq!(st.read_range(5, 10).unwrap(), b"");
        assert_eq!(st.read_range(3, 2).unwrap(), b"");
    }

    #[test]
    fn disabled_store_drops_appends() {
        let (_tmp, st) = store(false);
        st.append(b"ABCDE").unwrap();
        assert_eq!(st.durable_len(), 0);
        assert_eq!(st.read_range(0, 4).unwrap(), b"");
    }

    #[test]
    fn append_after_finalize_fails() {
        let (_tmp, st) = store(true);
        st.append(b"AB").unwrap();
        st.finalize();
        let err = st.append(b"CD").unwrap_err();
        assert_eq!(err.code(), "durable_log_failed");
        // the durable prefix stays readable for replay
        assert_eq!(st.read_range(0, 1).unwrap(), b"AB");
    }

    #[test]
    fn meta_roundtrip_and_finalize() {
        let (_tmp, st) = store(true);
        let id = SessionId::new();
        let meta = SessionMeta {
            session_id: id,
            alias: None,
            argv: vec!["sh".into()],
            cwd: None,
            env: vec![],
            created_by: "alice".into(),
            visibility: Visibility::Private,
            interactive: true,
            load_history: true,
            save_history: true,
            created_at: "2026-01-01T00:00:00Z".into(),
            ended_at: None,
            exit_code: None,
        };
        st.write_meta(&meta);
        st.finalize_meta("2026-01-01T00:01:00Z", Some(0));
        let data = std::fs::read_to_string(st.dir().join("meta.json")).unwrap();
        let read: SessionMeta = serde_json::from_str(&data).unwrap();
        assert_eq!(read.session_id, id);
        assert_eq!(read.ended_at.as_deref(), Some("2026-01-01T00:01:00Z"));
        assert_eq!(read.exit_code, Some(0));
    }

    #[test]
    fn stale_schedules_are_swept() {
        let dir = tempfile::tempdir().unwrap();
        let st = HistoryStore::create(dir.path(), SessionId::new(), true).unwrap();
        st.write_schedule(&vec!["placeholder"]);
        assert!(st.dir().join("scheduled.json").exists());
        sweep_stale_schedules(dir.path());
        assert!(!st.dir().join("scheduled.json").exists());
    }
}
