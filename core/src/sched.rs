//! Scheduled input: per-session rules that inject synthesized stdin, either
//! once after a delay or on a repeating interval capped by `stop_after`.
//! One timer loop per session owns the earliest-next computation; each fire
//! is dispatched through the InputRouter under the scheduler's
//! pseudo-identity so the normal admission rules apply. Rules are
//! snapshotted to scheduled.json after every mutation and discarded when
//! the session terminates.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::activity::ActivityState;
use crate::config::Limits;
use crate::error::CoreError;
use crate::history::HistoryStore;
use crate::input::{InputRouter, InputSource};
use crate::session::{Session, SessionId};
use crate::user::User;

/// Interval rules may not fire more often than once a second.
pub const MIN_INTERVAL_MS: u64 = 1000;
/// Upper bound for both delays and periods: 7 days.
pub const MAX_DELAY_MS: u64 = 7 * 24 * 60 * 60 * 1000;
/// Bounded wait for the `defer` activity policy.
const DEFER_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub uuid::Uuid);

impl RuleId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for RuleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    OneShot,
    Interval,
}

/// Which line ending `submit` appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnterStyle {
    #[default]
    Cr,
    Lf,
    CrLf,
}

impl EnterStyle {
    pub fn bytes(self) -> &'static [u8] {
        match self {
            EnterStyle::Cr => b"\r",
            EnterStyle::Lf => b"\n",
            EnterStyle::CrLf => b"\r\n",
        }
    }
}

/// What to do when the session is active at fire time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityPolicy {
    /// Send regardless.
    #[default]
    Immediate,
    /// Drop the fire entirely while active.
    Suppress,
    /// Wait for inactive, bounded by `DEFER_MAX`, then send.
    Defer,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RuleOptions {
    #[serde(default = "default_submit")]
    pub submit: bool,
    #[serde(default)]
    pub enter_style: EnterStyle,
    #[serde(default)]
    pub activity_policy: ActivityPolicy,
    #[serde(default)]
    pub simulate_typing: bool,
    #[serde(default = "default_typing_delay_ms")]
    pub typing_delay_ms: u64,
}

fn default_submit() -> bool {
    true
}

fn default_typing_delay_ms() -> u64 {
    50
}

impl Default for RuleOptions {
    fn default() -> Self {
        Self {
            submit: true,
            enter_style: EnterStyle::default(),
            activity_policy: ActivityPolicy::default(),
            simulate_typing: false,
            typing_delay_ms: default_typing_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ScheduledRule {
    pub rule_id: RuleId,
    pub session_id: SessionId,
    pub rule_type: RuleType,
    /// Delay for one-shot rules, period for interval rules (ms).
    pub delay_ms: u64,
    pub data: String,
    #[serde(default)]
    pub options: RuleOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_after: Option<u32>,
    #[serde(default)]
    pub paused: bool,
    /// Epoch millis of the next fire.
    pub next_run_at: i64,
    #[serde(default)]
    pub fired_count: u32,
}

/// Creation parameters, as received from the API.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct NewRule {
    pub rule_type: RuleType,
    pub delay_ms: u64,
    pub data: String,
    #[serde(default)]
    pub options: RuleOptions,
    #[serde(default)]
    pub stop_after: Option<u32>,
    #[serde(default)]
    pub paused: bool,
}

/// One fire, extracted from the rule set by the timer loop.
#[derive(Debug, Clone)]
pub struct FireOrder {
    pub rule_id: RuleId,
    pub data: String,
    pub options: RuleOptions,
}

#[derive(Default)]
struct SchedInner {
    rules: Vec<ScheduledRule>,
    /// Messages actually sent over the session's lifetime.
    sent_total: u32,
}

/// Rule set for one session, owned by the `Session`.
#[derive(Default)]
pub struct SessionSchedule {
    inner: Mutex<SchedInner>,
    changed: Notify,
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl SessionSchedule {
    /// Validate and add a rule. Caps are enforced here; overruns reject
    /// with `schedule_cap_exceeded`.
    pub fn add(
        &self,
        session_id: SessionId,
        limits: &Limits,
        new: NewRule,
    ) -> Result<ScheduledRule, CoreError> {
        if new.data.len() > limits.max_bytes_per_rule_data {
            return Err(CoreError::ScheduleCapExceeded("max_bytes_per_rule_data"));
        }
        match new.rule_type {
            RuleType::Interval => {
                if new.delay_ms < MIN_INTERVAL_MS || new.delay_ms > MAX_DELAY_MS {
                    return Err(CoreError::InvalidParams(format!(
                        "interval must be within [{MIN_INTERVAL_MS}, {MAX_DELAY_MS}] ms"
                    )));
                }
            }
            RuleType::OneShot => {
                if new.delay_ms > MAX_DELAY_MS {
                    return Err(CoreError::InvalidParams(format!(
                        "delay must be at most {MAX_DELAY_MS} ms"
                    )));
                }
            }
        }
        if matches!(new.stop_after, Some(0)) {
            return Err(CoreError::InvalidParams("stop_after must be at least 1".into()));
        }

        let mut inner = self.inner.lock().expect("schedule mutex");
        if inner.rules.len() >= limits.max_rules_per_session {
            return Err(CoreError::ScheduleCapExceeded("max_rules_per_session"));
        }
        let rule = ScheduledRule {
            rule_id: RuleId::new(),
            session_id,
            rule_type: new.rule_type,
            delay_ms: new.delay_ms,
            data: new.data,
            options: new.options,
            stop_after: new.stop_after,
            paused: new.paused,
            next_run_at: now_ms() + new.delay_ms as i64,
            fired_count: 0,
        };
        inner.rules.push(rule.clone());
        drop(inner);
        self.changed.notify_one();
        Ok(rule)
    }

    pub fn remove(&self, rule_id: RuleId) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().expect("schedule mutex");
        let before = inner.rules.len();
        inner.rules.retain(|r| r.rule_id != rule_id);
        if inner.rules.len() == before {
            return Err(CoreError::RuleNotFound);
        }
        drop(inner);
        self.changed.notify_one();
        Ok(())
    }

    pub fn set_paused(&self, rule_id: RuleId, paused: bool) -> Result<ScheduledRule, CoreError> {
        let mut inner = self.inner.lock().expect("schedule mutex");
        let rule = inner
            .rules
            .iter_mut()
            .find(|r| r.rule_id == rule_id)
            .ok_or(CoreError::RuleNotFound)?;
        rule.paused = paused;
        let snapshot = rule.clone();
        drop(inner);
        self.changed.notify_one();
        Ok(snapshot)
    }

    pub fn list(&self) -> Vec<ScheduledRule> {
        self.inner.lock().expect("schedule mutex").rules.clone()
    }

    /// Earliest `next_run_at` among unpaused rules.
    pub fn next_due(&self) -> Option<i64> {
        self.inner
            .lock()
            .expect("schedule mutex")
            .rules
            .iter()
            .filter(|r| !r.paused)
            .map(|r| r.next_run_at)
            .min()
    }

    /// Extract fires due at `now`. One-shot rules and interval rules that
    /// reached `stop_after` are removed; surviving interval rules advance
    /// from `now` (missed periods collapse into one fire, no bursts).
    pub fn take_due(&self, now: i64) -> Vec<FireOrder> {
        let mut inner = self.inner.lock().expect("schedule mutex");
        let mut fires = Vec::new();
        inner.rules.retain_mut(|rule| {
            if rule.paused || rule.next_run_at > now {
                return true;
            }
            rule.fired_count += 1;
            fires.push(FireOrder {
                rule_id: rule.rule_id,
                data: rule.data.clone(),
                options: rule.options.clone(),
            });
            match rule.rule_type {
                RuleType::OneShot => false,
                RuleType::Interval => {
                    if rule.stop_after.is_some_and(|cap| rule.fired_count >= cap) {
                        false
                    } else {
                        rule.next_run_at = now + rule.delay_ms as i64;
                        true
                    }
                }
            }
        });
        fires
    }

    /// Count a message against the session-lifetime cap. False means the
    /// cap is exhausted and the fire must be skipped.
    pub fn try_count_send(&self, cap: u32) -> bool {
        let mut inner = self.inner.lock().expect("schedule mutex");
        if inner.sent_total >= cap {
            return false;
        }
        inner.sent_total += 1;
        true
    }

    pub fn sent_total(&self) -> u32 {
        self.inner.lock().expect("schedule mutex").sent_total
    }

    /// Snapshot the rule set to scheduled.json.
    pub fn snapshot(&self, store: &HistoryStore) {
        store.write_schedule(&self.list());
    }

    /// Drop all rules (session terminated) and remove the snapshot.
    pub fn discard(&self, store: &HistoryStore) {
        self.inner.lock().expect("schedule mutex").rules.clear();
        store.discard_schedule();
        self.changed.notify_one();
    }

    /// Wait until the rule set changes.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }
}

/// Timer loop for one session. Sleeps until the earliest unpaused rule is
/// due, extracts the fires, snapshots, and dispatches each fire on its own
/// task (typing simulation and defer waits must not delay other rules).
pub async fn run_schedule(session: Arc<Session>, router: Arc<InputRouter>, limits: Limits) {
    let mut ended = session.ended_watch();
    loop {
        if *ended.borrow() {
            break;
        }
        match session.schedule.next_due() {
            None => {
                tokio::select! {
                    _ = session.schedule.changed() => {}
                    _ = ended.changed() => break,
                }
            }
            Some(at) => {
                let now = now_ms();
                if at > now {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis((at - now) as u64)) => {}
                        _ = session.schedule.changed() => continue,
                        _ = ended.changed() => break,
                    }
                }
                let fires = session.schedule.take_due(now_ms());
                if fires.is_empty() {
                    continue;
                }
                session.schedule.snapshot(&session.store);
                for order in fires {
                    let session = Arc::clone(&session);
                    let router = Arc::clone(&router);
                    let cap = limits.max_messages_per_session;
                    tokio::spawn(async move {
                        fire(&session, &router, order, cap).await;
                    });
                }
            }
        }
    }
}

/// Execute one fire: apply the activity policy, check the lifetime cap,
/// then synthesize the input sequence through the InputRouter.
async fn fire(session: &Arc<Session>, router: &Arc<InputRouter>, order: FireOrder, cap: u32) {
    match order.options.activity_policy {
        ActivityPolicy::Immediate => {}
        ActivityPolicy::Suppress => {
            if session.activity.state() == ActivityState::Active {
                tracing::debug!(session = %session.id, rule = %order.rule_id, "fire suppressed while active");
                return;
            }
        }
        ActivityPolicy::Defer => {
            let mut rx = session.activity.subscribe();
            if *rx.borrow() == ActivityState::Active {
                let _ = tokio::time::timeout(DEFER_MAX, async {
                    while rx.changed().await.is_ok() {
                        if *rx.borrow() == ActivityState::Inactive {
                            break;
                        }
                    }
                })
                .await;
            }
        }
    }

    if !session.schedule.try_count_send(cap) {
        tracing::warn!(session = %session.id, rule = %order.rule_id, "lifetime message cap reached; fire skipped");
        return;
    }

    let source = InputSource::Scheduler { user: User::scheduler_for(&session.spec.created_by) };
    let result = if order.options.simulate_typing {
        send_typed(session, router, &source, &order).await
    } else {
        router.handle_stdin(session, &source, order.data.as_bytes()).await
    };
    let result = match result {
        Ok(()) if order.options.submit => {
            router
                .handle_stdin(session, &source, order.options.enter_style.bytes())
                .await
        }
        other => other,
    };
    if let Err(e) = result {
        tracing::warn!(session = %session.id, rule = %order.rule_id, error = %e, "scheduled input failed");
    }
}

/// Typing simulation: one character per write with the configured delay.
async fn send_typed(
    session: &Arc<Session>,
    router: &Arc<InputRouter>,
    source: &InputSource<'_>,
    order: &FireOrder,
) -> Result<(), CoreError> {
    let delay = Duration::from_millis(order.options.typing_delay_ms);
    let mut buf = [0u8; 4];
    for ch in order.data.chars() {
        router.handle_stdin(session, source, ch.encode_utf8(&mut buf).as_bytes()).await?;
        tokio::time::sleep(delay).await;
    }
    Ok(())
}
