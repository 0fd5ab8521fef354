//! End-to-end session flows against real PTY children: clean replay of a
//! finished session, live input round-trips, and scheduled input.

use std::sync::Arc;
use std::time::Duration;

use common::client::ClientConn;
use common::config::Config;
use common::input::InputSource;
use common::protocol::ServerMsg;
use common::registry::Registry;
use common::sched::{NewRule, RuleOptions, RuleType, EnterStyle};
use common::session::{Session, SessionSpec};
use common::user::User;

fn registry(data_dir: &std::path::Path) -> Arc<Registry> {
    let mut cfg = Config::default();
    cfg.data_dir = data_dir.to_path_buf();
    Registry::new(Arc::new(cfg))
}

fn conn_for(registry: &Arc<Registry>, name: &str) -> Arc<ClientConn> {
    let conn = Arc::new(ClientConn::new(
        User::new(name, false),
        &registry.config.limits,
    ));
    registry.register_conn(Arc::clone(&conn));
    conn
}

async fn wait_terminated(session: &Arc<Session>) {
    for _ in 0..100 {
        if session.is_terminated() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("session did not terminate in time");
}

async fn next_msg(conn: &ClientConn) -> ServerMsg {
    tokio::time::timeout(Duration::from_secs(5), conn.next_msg())
        .await
        .expect("timed out waiting for message")
        .expect("conn closed")
}

#[tokio::test]
async fn clean_replay_of_finished_session() {
    // create, let the child finish, then attach fresh and replay everything
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(tmp.path());
    let mut spec = SessionSpec::new(
        vec!["sh".into(), "-c".into(), "printf ABCDE".into()],
        "alice",
    );
    spec.interactive = false;
    let session = registry.create_session(spec).unwrap();
    wait_terminated(&session).await;
    let (exit_code, _) = session.ended_info().unwrap();
    assert_eq!(exit_code, Some(0));

    let conn = conn_for(&registry, "alice");
    session.attach(&conn).unwrap();
    match next_msg(&conn).await {
        ServerMsg::Attached { history_marker, should_load_history, .. } => {
            assert_eq!(history_marker, 5);
            assert!(should_load_history);
        }
        other => panic!("expected attached, got {other:?}"),
    }

    // the client-side history fetch: bytes 0..=M-1
    assert_eq!(session.log.read_range(0, 4).unwrap(), b"ABCDE");

    session.mark_history_loaded(conn.conn_id).unwrap();
    match next_msg(&conn).await {
        ServerMsg::SessionEnded { exit_code, .. } => assert_eq!(exit_code, Some(0)),
        other => panic!("expected session_ended, got {other:?}"),
    }

    // the durable file holds exactly the stream
    let out = std::fs::read(session.store.dir().join("output.log")).unwrap();
    assert_eq!(out, b"ABCDE");
    // meta.json was finalized with the exit code
    let meta = std::fs::read_to_string(session.store.dir().join("meta.json")).unwrap();
    assert!(meta.contains("\"exit_code\": 0"));
}

#[tokio::test]
async fn stdin_reaches_the_child() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(tmp.path());
    let mut spec = SessionSpec::new(
        vec!["sh".into(), "-c".into(), "cat > out.txt".into()],
        "alice",
    );
    spec.cwd = Some(tmp.path().to_path_buf());
    let session = registry.create_session(spec).unwrap();

    let conn = conn_for(&registry, "alice");
    session.attach(&conn).unwrap();
    // nothing written yet: marker 0, no history to load
    match next_msg(&conn).await {
        ServerMsg::Attached { history_marker: 0, should_load_history: false, .. } => {}
        other => panic!("unexpected attach ack: {other:?}"),
    }

    let router = registry.router();
    router
        .handle_stdin(&session, &InputSource::Conn(&conn), b"hello\n")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    session.terminate(None);
    wait_terminated(&session).await;
    let out = std::fs::read_to_string(tmp.path().join("out.txt")).unwrap();
    assert_eq!(out, "hello\n");
}

#[tokio::test]
async fn interval_rule_fires_exactly_stop_after_times() {
    // interval 1s with stop_after 3: three writes, then silence
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(tmp.path());
    let mut spec = SessionSpec::new(
        vec!["sh".into(), "-c".into(), "cat > out.txt".into()],
        "alice",
    );
    spec.cwd = Some(tmp.path().to_path_buf());
    let session = registry.create_session(spec).unwrap();

    let rule = session
        .schedule
        .add(
            session.id,
            &registry.config.limits,
            NewRule {
                rule_type: RuleType::Interval,
                delay_ms: 1000,
                data: "ls".into(),
                options: RuleOptions {
                    // LF passes the tty line discipline untranslated
                    enter_style: EnterStyle::Lf,
                    ..RuleOptions::default()
                },
                stop_after: Some(3),
                paused: false,
            },
        )
        .unwrap();
    assert_eq!(rule.stop_after, Some(3));
    session.schedule.snapshot(&session.store);
    assert!(session.store.dir().join("scheduled.json").exists());

    // three fires at ~1s/2s/3s, then the rule is removed; wait out a fourth
    tokio::time::sleep(Duration::from_millis(4500)).await;
    assert!(session.schedule.list().is_empty(), "rule should be removed");

    session.terminate(None);
    wait_terminated(&session).await;
    let out = std::fs::read_to_string(tmp.path().join("out.txt")).unwrap();
    assert_eq!(out, "ls\nls\nls\n");
    // rules of terminated sessions are discarded
    assert!(!session.store.dir().join("scheduled.json").exists());
}

#[tokio::test]
async fn reconnect_replays_missed_bytes_exactly_once() {
    // reconnect against a live child: consume some output, drop, reconnect
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(tmp.path());
    let spec = SessionSpec::new(
        vec![
            "sh".into(),
            "-c".into(),
            "printf 0123456789; sleep 0.5; printf abcde; sleep 30".into(),
        ],
        "alice",
    );
    let session = registry.create_session(spec).unwrap();

    // wait until the first burst landed
    for _ in 0..100 {
        if session.log.snapshot_seq() >= 10 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let a = conn_for(&registry, "alice");
    session.attach(&a).unwrap();
    session.mark_history_loaded(a.conn_id).unwrap();
    // socket drops
    registry.remove_conn(a.conn_id);

    // wait until the second burst landed
    for _ in 0..200 {
        if session.log.snapshot_seq() >= 15 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let b = conn_for(&registry, "alice");
    let attachment = session.attach(&b).unwrap();
    assert_eq!(attachment.marker, 15);
    let history = session.log.read_range(0, attachment.marker - 1).unwrap();
    assert_eq!(history, b"0123456789abcde");
    session.mark_history_loaded(b.conn_id).unwrap();

    session.terminate(None);
}
