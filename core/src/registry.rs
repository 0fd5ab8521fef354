//! Process-wide index of live and recently terminated sessions, plus the
//! conn index used for shutdown broadcast and force-detach. Injected
//! explicitly into the server's handlers; there are no ambient globals.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::client::{ClientConn, ConnId};
use crate::config::Config;
use crate::error::CoreError;
use crate::history::{self, HistoryStore};
use crate::input::InputRouter;
use crate::protocol::ServerMsg;
use crate::pty;
use crate::sched;
use crate::session::{Session, SessionId, SessionInfo, SessionSpec};
use crate::user::User;

/// Grace between SIGTERM and SIGKILL at shutdown.
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(2);

pub struct Registry {
    sessions: DashMap<SessionId, Arc<Session>>,
    /// alias → session id; unique, conflicts rejected at create.
    aliases: DashMap<String, SessionId>,
    conns: DashMap<ConnId, Arc<ClientConn>>,
    router: Arc<InputRouter>,
    pub config: Arc<Config>,
    pub started_at: DateTime<Utc>,
}

impl Registry {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        history::sweep_stale_schedules(&config.data_dir);
        let router = Arc::new(InputRouter::new(&config.limits));
        Arc::new(Self {
            sessions: DashMap::new(),
            aliases: DashMap::new(),
            conns: DashMap::new(),
            router,
            config,
            started_at: Utc::now(),
        })
    }

    pub fn router(&self) -> Arc<InputRouter> {
        Arc::clone(&self.router)
    }

    /// Create and start a session from a resolved spec: reserve the alias,
    /// open the history store, spawn the PTY, and wire up the pump, exit
    /// watcher, activity decay, and scheduler tasks.
    pub fn create_session(self: &Arc<Self>, spec: SessionSpec) -> Result<Arc<Session>, CoreError> {
        if spec.argv.is_empty() {
            return Err(CoreError::InvalidParams("argv must not be empty".into()));
        }
        if let Some(alias) = &spec.alias {
            validate_alias(alias)?;
        }
        let running = self.sessions.iter().filter(|e| !e.value().is_terminated()).count();
        if running >= self.config.limits.max_sessions {
            return Err(CoreError::SessionLimitExceeded);
        }

        let id = SessionId::new();
        if let Some(alias) = &spec.alias {
            match self.aliases.entry(alias.clone()) {
                dashmap::mapref::entry::Entry::Occupied(_) => return Err(CoreError::AliasInUse),
                dashmap::mapref::entry::Entry::Vacant(e) => {
                    e.insert(id);
                }
            }
        }
        let alias = spec.alias.clone();

        let build = || -> Result<Arc<Session>, CoreError> {
            let store = Arc::new(HistoryStore::create(&self.config.data_dir, id, spec.save_history)?);
            let activity =
                Arc::new(crate::activity::ActivityTracker::new(self.config.activity.clone()));
            let (pty, out_rx, exit_rx) = pty::spawn(
                &spec.argv,
                spec.cwd.as_deref(),
                &spec.env,
                spec.cols,
                spec.rows,
            )?;
            let session = Arc::new(Session::new(
                id,
                spec,
                Arc::clone(&store),
                Arc::clone(&activity),
                self.config.limits.clone(),
            ));
            store.write_meta(&session.meta());
            session.set_running(Some(Arc::new(pty)));

            tokio::spawn(Arc::clone(&session).pump(out_rx, exit_rx));
            tokio::spawn(activity.run_decay(session.ended_watch()));
            tokio::spawn(sched::run_schedule(
                Arc::clone(&session),
                self.router(),
                self.config.limits.clone(),
            ));
            Ok(session)
        };

        match build() {
            Ok(session) => {
                self.sessions.insert(id, Arc::clone(&session));
                tracing::info!(
                    session = %id,
                    alias = session.spec.alias.as_deref().unwrap_or(""),
                    argv = ?session.spec.argv,
                    created_by = %session.spec.created_by,
                    "session created"
                );
                Ok(session)
            }
            Err(e) => {
                if let Some(alias) = alias {
                    self.aliases.remove(&alias);
                }
                Err(e)
            }
        }
    }

    /// Resolve a session by UUID or alias.
    pub fn get(&self, key: &str) -> Option<Arc<Session>> {
        if let Ok(uuid) = uuid::Uuid::parse_str(key) {
            if let Some(session) = self.sessions.get(&SessionId(uuid)) {
                return Some(Arc::clone(session.value()));
            }
        }
        let id = *self.aliases.get(key)?.value();
        self.sessions.get(&id).map(|s| Arc::clone(s.value()))
    }

    /// ACL-filtered listing: private sessions are visible only to their
    /// owner and admins.
    pub fn list(&self, user: &User) -> Vec<SessionInfo> {
        let mut out: Vec<SessionInfo> = self
            .sessions
            .iter()
            .filter(|e| {
                let s = e.value();
                match s.spec.visibility {
                    crate::session::Visibility::Private => s.can_manage(user),
                    _ => true,
                }
            })
            .map(|e| e.value().info())
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    /// Admin/owner terminate.
    pub fn terminate_session(&self, key: &str, user: &User) -> Result<(), CoreError> {
        let session = self.get(key).ok_or(CoreError::SessionNotFound)?;
        if !session.can_manage(user) {
            return Err(CoreError::Forbidden);
        }
        if !session.terminate(None) {
            return Err(CoreError::AlreadyTerminated);
        }
        Ok(())
    }

    /// Force-detach another conn from a session (admin/owner only).
    pub fn detach_client(
        &self,
        session: &Arc<Session>,
        requester: &User,
        target: ConnId,
    ) -> Result<(), CoreError> {
        if !session.can_manage(requester) {
            return Err(CoreError::Forbidden);
        }
        session.detach_conn(target)
    }

    // ---- conn index ----

    pub fn register_conn(&self, conn: Arc<ClientConn>) {
        self.conns.insert(conn.conn_id, conn);
    }

    /// Remove a conn: release all of its attachments and close its queue.
    /// The owning sessions continue unaffected.
    pub fn remove_conn(&self, conn_id: ConnId) {
        let Some((_, conn)) = self.conns.remove(&conn_id) else { return };
        for session_id in conn.attached_sessions() {
            if let Some(session) = self.sessions.get(&session_id) {
                session.value().detach(&conn);
            }
        }
        conn.close();
    }

    pub fn conn_count(&self) -> usize {
        self.conns.len()
    }

    /// (running, terminated) session counts.
    pub fn counts(&self) -> (usize, usize) {
        let mut running = 0;
        let mut terminated = 0;
        for e in self.sessions.iter() {
            if e.value().is_terminated() {
                terminated += 1;
            } else {
                running += 1;
            }
        }
        (running, terminated)
    }

    // ---- cleanup / shutdown ----

    /// Evict terminated sessions whose retention has lapsed. The on-disk
    /// history stays; only the registry entry (and alias) goes.
    pub fn cleanup_pass(&self) {
        let retention = chrono::Duration::from_std(self.config.limits.retention)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));
        let now = Utc::now();
        let expired: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter_map(|e| {
                let session = e.value();
                let (_, ended_at) = session.ended_info()?;
                (ended_at + retention < now).then(|| Arc::clone(session))
            })
            .collect();
        for session in expired {
            self.sessions.remove(&session.id);
            if let Some(alias) = &session.spec.alias {
                self.aliases.remove(alias);
            }
            tracing::debug!(session = %session.id, "terminated session evicted");
        }
    }

    /// Periodic cleanup task; runs for the server's lifetime.
    pub async fn run_cleanup(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.limits.cleanup_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.cleanup_pass();
        }
    }

    /// Graceful shutdown: `shutdown` is broadcast to every conn, then each
    /// running PTY gets SIGTERM and, after the grace, SIGKILL.
    pub async fn shutdown(&self) {
        for e in self.conns.iter() {
            e.value().send(ServerMsg::Shutdown);
        }
        let mut tasks = tokio::task::JoinSet::new();
        for e in self.sessions.iter() {
            let session = Arc::clone(e.value());
            tasks.spawn(async move {
                if let Some(pty) = session.pty_handle() {
                    pty.terminate(SHUTDOWN_GRACE).await;
                }
                session.terminate(None);
            });
        }
        while tasks.join_next().await.is_some() {}
        for e in self.conns.iter() {
            e.value().close();
        }
        tracing::info!("registry shut down");
    }
}

/// Aliases are URL-safe: alphanumerics, `-`, `_`, up to 64 chars.
fn validate_alias(alias: &str) -> Result<(), CoreError> {
    let ok = !alias.is_empty()
        && alias.len() <= 64
        && alias.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(CoreError::InvalidParams("alias must be URL-safe (alphanumeric, '-', '_')".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Limits;

    fn registry_with(f: impl FnOnce(&mut Config)) -> (tempfile::TempDir, Arc<Registry>) {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.data_dir = dir.path().to_path_buf();
        f(&mut cfg);
        (dir, Registry::new(Arc::new(cfg)))
    }

    fn sleeper(created_by: &str, alias: Option<&str>) -> SessionSpec {
        let mut spec =
            SessionSpec::new(vec!["sh".into(), "-c".into(), "sleep 30".into()], created_by);
        spec.alias = alias.map(|s| s.to_string());
        spec
    }

    #[tokio::test]
    async fn alias_conflicts_are_rejected() {
        let (_tmp, registry) = registry_with(|_| {});
        let first = registry.create_session(sleeper("alice", Some("build"))).unwrap();
        let err = registry.create_session(sleeper("alice", Some("build"))).unwrap_err();
        assert!(matches!(err, CoreError::AliasInUse));
        // resolvable by both uuid and alias
        assert_eq!(registry.get(&first.id.to_string()).unwrap().id, first.id);
        assert_eq!(registry.get("build").unwrap().id, first.id);
        first.terminate(None);
    }

    #[tokio::test]
    async fn invalid_alias_is_rejected() {
        let (_tmp, registry) = registry_with(|_| {});
        let err = registry.create_session(sleeper("alice", Some("no/slash"))).unwrap_err();
        assert!(matches!(err, CoreError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn session_limit() {
        let (_tmp, registry) = registry_with(|cfg| cfg.limits.max_sessions = 1);
        let first = registry.create_session(sleeper("alice", None)).unwrap();
        let err = registry.create_session(sleeper("alice", None)).unwrap_err();
        assert!(matches!(err, CoreError::SessionLimitExceeded));
        // terminated sessions free their slot
        first.terminate(None);
        let second = registry.create_session(sleeper("alice", None)).unwrap();
        second.terminate(None);
    }

    #[tokio::test]
    async fn list_hides_private_sessions_from_strangers() {
        let (_tmp, registry) = registry_with(|_| {});
        let mut shared = sleeper("alice", None);
        shared.visibility = crate::session::Visibility::SharedReadonly;
        let s1 = registry.create_session(sleeper("alice", None)).unwrap();
        let s2 = registry.create_session(shared).unwrap();

        let bob = User::new("bob", false);
        let visible = registry.list(&bob);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].session_id, s2.id);

        let admin = User::new("root", true);
        assert_eq!(registry.list(&admin).len(), 2);
        assert_eq!(registry.list(&User::new("alice", false)).len(), 2);
        s1.terminate(None);
        s2.terminate(None);
    }

    #[tokio::test]
    async fn terminate_requires_manage_rights() {
        let (_tmp, registry) = registry_with(|_| {});
        let session = registry.create_session(sleeper("alice", None)).unwrap();
        let key = session.id.to_string();
        let err = registry.terminate_session(&key, &User::new("bob", false)).unwrap_err();
        assert!(matches!(err, CoreError::Forbidden));
        registry.terminate_session(&key, &User::new("alice", false)).unwrap();
        let err = registry.terminate_session(&key, &User::new("alice", false)).unwrap_err();
        assert!(matches!(err, CoreError::AlreadyTerminated));
    }

    #[tokio::test]
    async fn cleanup_evicts_after_retention() {
        let (_tmp, registry) =
            registry_with(|cfg| cfg.limits.retention = std::time::Duration::ZERO);
        let session = registry.create_session(sleeper("alice", Some("gone"))).unwrap();
        session.terminate(Some(0));
        registry.cleanup_pass();
        assert!(registry.get(&session.id.to_string()).is_none());
        assert!(registry.get("gone").is_none());
        let (running, terminated) = registry.counts();
        assert_eq!((running, terminated), (0, 0));
    }

    #[tokio::test]
    async fn detach_client_requires_rights_and_an_attached_target() {
        let (_tmp, registry) = registry_with(|_| {});
        let mut spec = sleeper("alice", None);
        spec.visibility = crate::session::Visibility::Public;
        let session = registry.create_session(spec).unwrap();
        let viewer = Arc::new(ClientConn::new(User::new("bob", false), &Limits::default()));
        session.attach(&viewer).unwrap();

        // a non-owner cannot force-detach others
        let err = registry
            .detach_client(&session, &User::new("mallory", false), viewer.conn_id)
            .unwrap_err();
        assert!(matches!(err, CoreError::Forbidden));

        // a target that is not attached is an error, matching the wire reply
        let stranger = crate::client::ConnId::new();
        let err = registry
            .detach_client(&session, &User::new("alice", false), stranger)
            .unwrap_err();
        assert!(matches!(err, CoreError::NotAttached));

        registry
            .detach_client(&session, &User::new("alice", false), viewer.conn_id)
            .unwrap();
        assert_eq!(session.attached_count(), 0);
        session.terminate(None);
    }

    #[tokio::test]
    async fn remove_conn_detaches_everywhere() {
        let (_tmp, registry) = registry_with(|_| {});
        let session = registry.create_session(sleeper("alice", None)).unwrap();
        let conn = Arc::new(ClientConn::new(User::new("alice", false), &Limits::default()));
        registry.register_conn(Arc::clone(&conn));
        session.attach(&conn).unwrap();
        assert_eq!(session.attached_count(), 1);

        registry.remove_conn(conn.conn_id);
        assert_eq!(session.attached_count(), 0);
        assert!(conn.is_closing());
        assert_eq!(registry.conn_count(), 0);
        session.terminate(None);
    }
}
