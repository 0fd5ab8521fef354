//! Portable PTY: spawn a resolved argv in a pseudo-terminal and bridge its
//! I/O to the async side. The child is wrapped in a Mutex so a watcher
//! thread can poll try_wait() and report the exit exactly once. Each PTY has
//! its own reader thread, so chunks from different sessions never interleave.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{self, Arc, Mutex};
use std::time::Duration;

use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tokio::sync::mpsc;

use crate::error::CoreError;

/// Read size for the master fd. Sized to the typical OS PTY buffer so a
/// bursty child produces few large chunks rather than many small ones.
const READ_CHUNK: usize = 64 * 1024;

/// Poll interval for the exit watcher thread.
const EXIT_POLL: Duration = Duration::from_millis(250);

/// Exit report, delivered exactly once per process.
#[derive(Debug, Clone, Copy)]
pub struct PtyExit {
    pub exit_code: u32,
}

/// Sender to request a PTY resize (cols, rows). A dedicated thread runs
/// master.resize() so the async side never blocks on the ioctl.
pub type ResizeSender = sync::mpsc::Sender<(u16, u16)>;

/// One child process attached to a PTY: writer for stdin, resize channel,
/// and the child handle for kill/terminate.
pub struct PtyProcess {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send + Sync>>>,
    resize_tx: ResizeSender,
    /// Current (cols, rows); resize to the same values is a no-op.
    size: Mutex<(u16, u16)>,
    alive: Arc<AtomicBool>,
    pid: Option<u32>,
}

/// Build the command for a resolved session spec. The argv arrives fully
/// resolved (templates and isolation are collaborators); only TERM defaults
/// are injected so children see a modern terminal.
fn build_command(argv: &[String], cwd: Option<&Path>, env: &[(String, String)]) -> CommandBuilder {
    let mut cmd = CommandBuilder::new(&argv[0]);
    for arg in &argv[1..] {
        cmd.arg(arg);
    }
    if let Some(dir) = cwd {
        cmd.cwd(dir);
    }
    let mut has_term = false;
    for (k, v) in env {
        if k == "TERM" {
            has_term = true;
        }
        cmd.env(k, v);
    }
    if !has_term {
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
    }
    cmd
}

/// Spawn argv in a fresh PTY at the given size. Returns the process handle,
/// the output receiver (fed by a blocking reader thread), and the exit
/// receiver (fed by a watcher thread, exactly one message).
pub fn spawn(
    argv: &[String],
    cwd: Option<&Path>,
    env: &[(String, String)],
    cols: u16,
    rows: u16,
) -> Result<(PtyProcess, mpsc::Receiver<Vec<u8>>, mpsc::Receiver<PtyExit>), CoreError> {
    if argv.is_empty() {
        return Err(CoreError::InvalidParams("argv must not be empty".into()));
    }

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 })
        .map_err(|e| CoreError::SpawnFailed(e.to_string()))?;

    let cmd = build_command(argv, cwd, env);
    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| CoreError::SpawnFailed(e.to_string()))?;
    let pid = child.process_id();

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| CoreError::SpawnFailed(e.to_string()))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| CoreError::SpawnFailed(e.to_string()))?;
    let master = pair.master;

    let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(256);
    let (resize_tx, resize_rx) = sync::mpsc::channel::<(u16, u16)>();
    let (exit_tx, exit_rx) = mpsc::channel::<PtyExit>(1);

    let child = Arc::new(Mutex::new(child));
    let alive = Arc::new(AtomicBool::new(true));

    // Blocking thread: read the master fd and hand chunks to the async side.
    std::thread::spawn(move || {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if out_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    // Dedicated thread: apply resizes. Owns the master so the ioctl happens
    // off the async runtime.
    std::thread::spawn(move || {
        while let Ok((cols, rows)) = resize_rx.recv() {
            let size = PtySize { cols, rows, pixel_width: 0, pixel_height: 0 };
            let _ = master.resize(size);
        }
    });

    // Watcher thread: poll try_wait() and deliver the exit exactly once.
    let child_poll = Arc::clone(&child);
    let alive_poll = Arc::clone(&alive);
    std::thread::spawn(move || {
        loop {
            let exit_code = {
                let mut guard = match child_poll.lock() {
                    Ok(g) => g,
                    Err(_) => break,
                };
                match guard.try_wait() {
                    Ok(None) => None,
                    Ok(Some(status)) => Some(status.exit_code()),
                    Err(_) => break,
                }
            };
            if let Some(exit_code) = exit_code {
                alive_poll.store(false, Ordering::Release);
                let _ = exit_tx.blocking_send(PtyExit { exit_code });
                break;
            }
            std::thread::sleep(EXIT_POLL);
        }
    });

    let process = PtyProcess {
        writer: Arc::new(Mutex::new(writer)),
        child,
        resize_tx,
        size: Mutex::new((cols, rows)),
        alive,
        pid,
    };
    Ok((process, out_rx, exit_rx))
}

impl PtyProcess {
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Write bytes to the PTY master. The write runs on a blocking thread
    /// with a deadline: a full kernel input buffer surfaces as `PtyBusy`
    /// rather than stalling the caller.
    pub async fn write(&self, bytes: Vec<u8>, deadline: Duration) -> Result<(), CoreError> {
        if !self.is_alive() {
            return Err(CoreError::PtyClosed);
        }
        let writer = Arc::clone(&self.writer);
        let join = tokio::task::spawn_blocking(move || -> Result<(), CoreError> {
            let mut guard = writer
                .lock()
                .map_err(|_| CoreError::PtyWriteFailed("writer mutex poisoned".into()))?;
            guard
                .write_all(&bytes)
                .and_then(|()| guard.flush())
                .map_err(|e| CoreError::PtyWriteFailed(e.to_string()))
        });
        match tokio::time::timeout(deadline, join).await {
            Ok(Ok(res)) => res,
            Ok(Err(join_err)) => Err(CoreError::PtyWriteFailed(join_err.to_string())),
            Err(_) => Err(CoreError::PtyBusy),
        }
    }

    /// Change the PTY window size. No-op when the values equal the current
    /// size, so repeated identical resizes produce a single ioctl.
    pub fn resize(&self, cols: u16, rows: u16) -> bool {
        let mut size = self.size.lock().expect("size mutex");
        if *size == (cols, rows) {
            return false;
        }
        *size = (cols, rows);
        let _ = self.resize_tx.send((cols, rows));
        true
    }

    pub fn size(&self) -> (u16, u16) {
        *self.size.lock().expect("size mutex")
    }

    /// Kill the child immediately (SIGKILL).
    pub fn kill(&self) -> Result<(), std::io::Error> {
        let mut guard = self
            .child
            .lock()
            .map_err(|_| std::io::Error::other("child mutex poisoned"))?;
        guard.kill()
    }

    /// Graceful stop: SIGTERM, then SIGKILL after the grace period if the
    /// child is still running.
    pub async fn terminate(&self, grace: Duration) {
        if !self.is_alive() {
            return;
        }
        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
                tokio::time::sleep(grace).await;
            }
        }
        if self.is_alive() {
            let _ = self.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    #[tokio::test]
    async fn spawn_collects_output_and_exit() {
        let (pty, mut out_rx, mut exit_rx) = spawn(&sh("printf ABCDE"), None, &[], 80, 24).unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = out_rx.recv().await {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, b"ABCDE");
        let exit = exit_rx.recv().await.expect("exit report");
        assert_eq!(exit.exit_code, 0);
        assert!(!pty.is_alive());
    }

    #[tokio::test]
    async fn spawn_bad_binary_fails() {
        let argv = vec!["/definitely/not/a/binary".to_string()];
        match spawn(&argv, None, &[], 80, 24) {
            Err(CoreError::SpawnFailed(_)) => {}
            // Some PTY backends report exec failure through the exit path
            // instead of spawn; accept a fast nonzero exit as equivalent.
            Ok((_pty, _out, mut exit_rx)) => {
                let exit = exit_rx.recv().await.expect("exit report");
                assert_ne!(exit.exit_code, 0);
            }
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn resize_same_size_is_noop() {
        let (pty, _out_rx, mut exit_rx) = spawn(&sh("sleep 5"), None, &[], 80, 24).unwrap();
        assert!(!pty.resize(80, 24));
        assert!(pty.resize(120, 40));
        assert_eq!(pty.size(), (120, 40));
        assert!(!pty.resize(120, 40));
        pty.kill().unwrap();
        let _ = exit_rx.recv().await;
    }

    #[tokio::test]
    async fn write_after_exit_is_pty_closed() {
        let (pty, mut out_rx, mut exit_rx) = spawn(&sh("true"), None, &[], 80, 24).unwrap();
        while out_rx.recv().await.is_some() {}
        let _ = exit_rx.recv().await;
        let err = pty.write(b"x".to_vec(), Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, CoreError::PtyClosed));
    }
}
