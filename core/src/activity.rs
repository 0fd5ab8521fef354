//! Per-session activity tracking: a session is `active` while output is
//! flowing and decays to `inactive` after a quiet interval. Output inside
//! the post-resize window does not count (redraws are not activity), and an
//! active transition is only recorded once enough contiguous bytes arrived.
//! State changes are published on a watch channel so the scheduler's
//! `defer` policy can wait for idle.

use std::sync::Mutex;

use tokio::sync::{watch, Notify};
use tokio::time::Instant;

use crate::config::ActivityTuning;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityState {
    Active,
    Inactive,
}

struct Inner {
    last_output_at: Option<Instant>,
    last_resize_at: Option<Instant>,
    /// Bytes seen in the current active period (reset on decay).
    active_bytes: usize,
    last_activity_at: chrono::DateTime<chrono::Utc>,
}

pub struct ActivityTracker {
    tuning: ActivityTuning,
    state_tx: watch::Sender<ActivityState>,
    inner: Mutex<Inner>,
    /// Wakes the decay task to re-arm its deadline.
    wake: Notify,
}

impl ActivityTracker {
    pub fn new(tuning: ActivityTuning) -> Self {
        let (state_tx, _) = watch::channel(ActivityState::Inactive);
        Self {
            tuning,
            state_tx,
            inner: Mutex::new(Inner {
                last_output_at: None,
                last_resize_at: None,
                active_bytes: 0,
                last_activity_at: chrono::Utc::now(),
            }),
            wake: Notify::new(),
        }
    }

    pub fn state(&self) -> ActivityState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ActivityState> {
        self.state_tx.subscribe()
    }

    pub fn last_activity_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.inner.lock().expect("activity mutex").last_activity_at
    }

    /// Record output. Bytes landing within the resize-suppression window are
    /// ignored entirely; otherwise the active period extends and, once the
    /// byte threshold is met, the active transition is recorded.
    pub fn on_output(&self, len: usize) {
        if len == 0 {
            return;
        }
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("activity mutex");
        if let Some(resized) = inner.last_resize_at {
            if now.duration_since(resized) < self.tuning.suppress_after_resize {
                return;
            }
        }
        inner.last_output_at = Some(now);
        inner.last_activity_at = chrono::Utc::now();
        if self.state() == ActivityState::Inactive {
            inner.active_bytes += len;
            if inner.active_bytes >= self.tuning.min_active_bytes {
                self.state_tx.send_replace(ActivityState::Active);
            }
        }
        drop(inner);
        self.wake.notify_one();
    }

    /// Record a resize: opens the suppression window.
    pub fn on_resize(&self) {
        self.inner.lock().expect("activity mutex").last_resize_at = Some(Instant::now());
    }

    /// Record user input for `last_activity_at` bookkeeping.
    pub fn on_input(&self) {
        self.inner.lock().expect("activity mutex").last_activity_at = chrono::Utc::now();
    }

    /// Decay task: runs for the session's lifetime and flips the state back
    /// to inactive after `inactive` of silence. `ended` closes when the
    /// session terminates.
    pub async fn run_decay(self: std::sync::Arc<Self>, mut ended: watch::Receiver<bool>) {
        loop {
            if *ended.borrow() {
                break;
            }
            let deadline = {
                let inner = self.inner.lock().expect("activity mutex");
                match (self.state(), inner.last_output_at) {
                    (ActivityState::Active, Some(last)) => Some(last + self.tuning.inactive),
                    _ => None,
                }
            };
            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {
                            let mut inner = self.inner.lock().expect("activity mutex");
                            let quiet = inner
                                .last_output_at
                                .map_or(true, |last| last.elapsed() >= self.tuning.inactive);
                            if quiet {
                                inner.active_bytes = 0;
                                self.state_tx.send_replace(ActivityState::Inactive);
                            }
                        }
                        _ = self.wake.notified() => {}
                        _ = ended.changed() => break,
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = ended.changed() => break,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn tuning() -> ActivityTuning {
        ActivityTuning {
            inactive: Duration::from_millis(1000),
            suppress_after_resize: Duration::from_millis(250),
            min_active_bytes: 32,
        }
    }

    fn spawn_decay(tracker: &Arc<ActivityTracker>) -> watch::Sender<bool> {
        let (ended_tx, ended_rx) = watch::channel(false);
        tokio::spawn(Arc::clone(tracker).run_decay(ended_rx));
        ended_tx
    }

    #[tokio::test(start_paused = true)]
    async fn small_output_does_not_record_active() {
        let tracker = Arc::new(ActivityTracker::new(tuning()));
        tracker.on_output(8);
        assert_eq!(tracker.state(), ActivityState::Inactive);
        tracker.on_output(16);
        assert_eq!(tracker.state(), ActivityState::Inactive);
        // crossing min_active_bytes records the transition
        tracker.on_output(16);
        assert_eq!(tracker.state(), ActivityState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn decays_to_inactive_after_quiet_interval() {
        let tracker = Arc::new(ActivityTracker::new(tuning()));
        let _ended = spawn_decay(&tracker);
        tracker.on_output(64);
        assert_eq!(tracker.state(), ActivityState::Active);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(tracker.state(), ActivityState::Inactive);
        // a fresh burst starts a new active period from zero bytes
        tracker.on_output(8);
        assert_eq!(tracker.state(), ActivityState::Inactive);
        tracker.on_output(64);
        assert_eq!(tracker.state(), ActivityState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn output_after_resize_is_suppressed() {
        let tracker = Arc::new(ActivityTracker::new(tuning()));
        tracker.on_resize();
        tracker.on_output(4096);
        assert_eq!(tracker.state(), ActivityState::Inactive);
        // past the suppression window output counts again
        tokio::time::sleep(Duration::from_millis(300)).await;
        tracker.on_output(64);
        assert_eq!(tracker.state(), ActivityState::Active);
    }
}
