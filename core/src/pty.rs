//! PTY spawning: open a pseudo-terminal, run a shell inside it, and bridge
//! stdin/stdout/resize across the blocking PTY I/O boundary into async
//! channels the session actor can select over.

use crate::error::SpawnFailure;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use std::io::{Read, Write};
use std::sync::{self, Arc, Mutex};
use tokio::sync::mpsc;

/// Environment variable prefixes stripped from the spawned shell's
/// environment so a nested shell doesn't inherit a stale multiplexer
/// session from whatever spawned this process.
const STRIPPED_ENV_PREFIXES: &[&str] = &["ZELLIJ", "TMUX"];

fn build_command(argv: &[String]) -> Result<CommandBuilder, SpawnFailure> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| SpawnFailure("empty shell argv".to_string()))?;
    let mut cmd = CommandBuilder::new(program);
    for arg in args {
        cmd.arg(arg);
    }
    for (key, _) in std::env::vars() {
        if STRIPPED_ENV_PREFIXES.iter().any(|p| key.starts_with(p)) {
            cmd.env_remove(&key);
        }
    }
    cmd.env("TERM", "xterm-256color");
    Ok(cmd)
}

/// Run state of the PTY child, polled from a background thread and
/// reported to whoever owns the bridge.
#[derive(Debug, Clone, Copy)]
pub enum PtyRunState {
    Running,
    Exited { exit_code: u32 },
}

/// Sender to request a PTY resize (cols, rows); a dedicated thread performs
/// the actual `master.resize()` call since `MasterPty` is not `Send`-safe
/// to hand across an async boundary directly.
pub type ResizeSender = sync::mpsc::Sender<(u16, u16)>;

/// A spawned PTY: stdin writer plus a handle to kill the child.
pub struct PtyBridge {
    pub writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send + Sync>>>,
}

impl PtyBridge {
    /// Best-effort kill of the child process.
    pub fn kill(&self) -> std::io::Result<()> {
        let mut guard = self
            .child
            .lock()
            .map_err(|_| std::io::Error::other("child mutex poisoned"))?;
        guard.kill()
    }

    /// OS process id of the spawned child, for admin-surface summaries.
    pub fn pid(&self) -> Option<u32> {
        self.child.lock().ok().and_then(|c| c.process_id())
    }
}

/// Spawn `argv` inside a PTY sized `(cols, rows)`. Returns the bridge, a
/// receiver of raw stdout bytes, a resize sender, and a receiver of run
/// state transitions (`Running` once, then exactly one `Exited`).
pub fn spawn_pty(
    argv: &[String],
    cols: u16,
    rows: u16,
) -> Result<(PtyBridge, mpsc::Receiver<Vec<u8>>, ResizeSender, mpsc::Receiver<PtyRunState>), SpawnFailure> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 })
        .map_err(|e| SpawnFailure(e.to_string()))?;

    let cmd = build_command(argv)?;
    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| SpawnFailure(e.to_string()))?;

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| SpawnFailure(e.to_string()))?;
    let writer = pair.master.take_writer().map_err(|e| SpawnFailure(e.to_string()))?;
    let master = pair.master;

    let (tx, rx) = mpsc::channel::<Vec<u8>>(256);
    let (resize_tx, resize_rx) = sync::mpsc::channel::<(u16, u16)>();
    let (state_tx, state_rx) = mpsc::channel::<PtyRunState>(4);

    let child = Arc::new(Mutex::new(child));

    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    std::thread::spawn(move || {
        while let Ok((cols, rows)) = resize_rx.recv() {
            let size = PtySize { cols, rows, pixel_width: 0, pixel_height: 0 };
            let _ = master.resize(size);
        }
    });

    let child_poll = Arc::clone(&child);
    std::thread::spawn(move || {
        let mut sent_running = false;
        loop {
            let exit_status = {
                let mut guard = match child_poll.lock() {
                    Ok(g) => g,
                    Err(_) => break,
                };
                match guard.try_wait() {
                    Ok(None) => None,
                    Ok(Some(s)) => Some(s.exit_code()),
                    Err(_) => break,
                }
            };
            if let Some(code) = exit_status {
                let _ = state_tx.blocking_send(PtyRunState::Exited { exit_code: code });
                break;
            }
            if !sent_running {
                sent_running = true;
                let _ = state_tx.blocking_send(PtyRunState::Running);
            }
            std::thread::sleep(std::time::Duration::from_millis(500));
        }
    });

    let bridge = PtyBridge { writer: Arc::new(Mutex::new(writer)), child };
    Ok((bridge, rx, resize_tx, state_rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_command_rejects_empty_argv() {
        assert!(build_command(&[]).is_err());
    }

    #[test]
    fn build_command_succeeds_with_tmux_and_zellij_env_present() {
        // env_remove() is best-effort bookkeeping on CommandBuilder; this
        // guards against build_command panicking or erroring when those
        // prefixes are present in the parent environment, which is the
        // common case when this process itself runs inside tmux/zellij.
        std::env::set_var("TMUX", "/tmp/tmux-1000/default,123,0");
        std::env::set_var("ZELLIJ_SESSION_NAME", "work");
        let result = build_command(&["bash".to_string(), "-l".to_string()]);
        std::env::remove_var("TMUX");
        std::env::remove_var("ZELLIJ_SESSION_NAME");
        assert!(result.is_ok());
    }

    #[test]
    #[cfg(unix)]
    fn spawn_and_read_echoed_output() {
        let (bridge, mut rx, _resize_tx, _state_rx) =
            spawn_pty(&["sh".to_string(), "-c".to_string(), "echo hi".to_string()], 80, 24).unwrap();
        let mut collected = Vec::new();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(3);
        while std::time::Instant::now() < deadline {
            match rx.try_recv() {
                Ok(bytes) => collected.extend_from_slice(&bytes),
                Err(_) => std::thread::sleep(std::time::Duration::from_millis(20)),
            }
            if String::from_utf8_lossy(&collected).contains("hi") {
                break;
            }
        }
        assert!(String::from_utf8_lossy(&collected).contains("hi"));
        let _ = bridge.kill();
    }
}
