//! Managed Process - Direct process spawning with stdio capture
//!
//! The launcher owns the server process directly:
//! - stdout lines go through a [`StdoutRouter`] (log forwarding or reply scanning)
//! - stderr lines go to a fixed consumer, bypassing the router
//! - stdin receives whole command lines from a single writer task
//! - a waiter task reports the exit through a watch channel

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::error::{Result, SupervisorError};
use super::router::{StdoutConsumer, StdoutRouter};

/// The launcher's handle on one running server process.
pub struct ManagedProcess {
    /// PID returned by the spawn call
    pub pid: u32,
    /// Launch generation this handle belongs to
    pub generation: u64,
    /// Channel to send command lines to stdin
    stdin_tx: mpsc::Sender<String>,
    router: Arc<StdoutRouter>,
    /// `None` while running, exit description afterwards
    exit_rx: watch::Receiver<Option<String>>,
    /// PID found by re-enumerating processes after launch (0 = not yet confirmed)
    confirmed_pid: AtomicU32,
    /// Cancelled when the handle is dropped; stops background helpers
    cancel: CancellationToken,
}

impl ManagedProcess {
    /// Spawn the server with piped stdio.
    ///
    /// `router` must already carry its default consumer: output produced
    /// right after the spawn is routed through it.
    pub fn spawn(
        program: &Path,
        args: &[String],
        working_dir: &Path,
        router: Arc<StdoutRouter>,
        stderr_sink: StdoutConsumer,
        generation: u64,
    ) -> Result<Self> {
        let mut cmd = TokioCommand::new(program);
        cmd.args(args)
            .current_dir(working_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(false);

        // Windows: hide console window
        crate::utils::apply_creation_flags(&mut cmd);

        let spawn_failed = |reason: String| SupervisorError::SpawnFailed {
            program: program.display().to_string(),
            reason,
        };

        let mut child = cmd.spawn().map_err(|e| spawn_failed(e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| spawn_failed("process exited before its PID could be read".to_string()))?;

        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(256);
        let (exit_tx, exit_rx) = watch::channel::<Option<String>>(None);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdin = child.stdin.take();

        // ── stdout reader ────────────────────────────────────
        if let Some(stdout) = stdout {
            let router = router.clone();
            tokio::spawn(async move {
                read_lines(stdout, |line| router.dispatch(line)).await;
            });
        }

        // ── stderr reader ────────────────────────────────────
        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                read_lines(stderr, |line| {
                    stderr_sink(line);
                })
                .await;
            });
        }

        // ── stdin writer ─────────────────────────────────────
        // 한 줄씩 통째로 쓰므로 동시에 들어온 명령끼리 한 줄 안에서 섞이지 않는다
        if let Some(mut stdin_handle) = stdin {
            let mut rx = stdin_rx;
            tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    if stdin_handle.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                    if stdin_handle.flush().await.is_err() {
                        break;
                    }
                }
            });
        }

        // ── process waiter ───────────────────────────────────
        tokio::spawn(async move {
            let exit_msg = match child.wait().await {
                Ok(status) => format!("Server process {} exited with {}", pid, status),
                Err(e) => format!("Failed to wait for server process {}: {}", pid, e),
            };
            tracing::info!("{}", exit_msg);
            let _ = exit_tx.send(Some(exit_msg));
        });

        tracing::info!("Spawned '{}' with PID {}", program.display(), pid);

        Ok(Self {
            pid,
            generation,
            stdin_tx,
            router,
            exit_rx,
            confirmed_pid: AtomicU32::new(0),
            cancel: CancellationToken::new(),
        })
    }

    /// Queue one command line for stdin. Trailing line breaks in `command`
    /// are dropped and exactly one `\n` is appended.
    pub async fn send_line(&self, command: &str) -> Result<()> {
        if !self.is_running() {
            return Err(SupervisorError::NotRunning);
        }
        let line = format!("{}\n", command.trim_end_matches(['\r', '\n']));
        self.stdin_tx
            .send(line)
            .await
            .map_err(|_| SupervisorError::NotRunning)
    }

    pub fn router(&self) -> &Arc<StdoutRouter> {
        &self.router
    }

    /// Whether the process is still running.
    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// Wait until the process exits and return the exit description.
    pub async fn wait_for_exit(&self) -> String {
        let mut rx = self.exit_rx.clone();
        let result = match rx.wait_for(|exit| exit.is_some()).await {
            Ok(exit) => exit.clone().unwrap_or_default(),
            Err(_) => format!("Server process {} exited", self.pid),
        };
        result
    }

    /// Exit notification that does not keep the handle alive.
    pub fn exit_watch(&self) -> watch::Receiver<Option<String>> {
        self.exit_rx.clone()
    }

    pub fn confirm_pid(&self, pid: u32) {
        self.confirmed_pid.store(pid, Ordering::SeqCst);
    }

    /// The PID confirmed by process enumeration, if the confirmation ran.
    pub fn confirmed_pid(&self) -> Option<u32> {
        match self.confirmed_pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// 줄 단위로 읽되 UTF-8이 아닌 출력도 손실 변환으로 살린다
async fn read_lines<R, F>(reader: R, mut on_line: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                on_line(line.trim_end_matches(['\r', '\n']));
            }
            Err(e) => {
                tracing::warn!("Stopped reading server output: {}", e);
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::supervisor::router::Flow;
    use std::sync::Mutex;
    use std::time::Duration;

    fn collecting_router() -> (Arc<Mutex<Vec<String>>>, Arc<StdoutRouter>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let default: StdoutConsumer = Arc::new(move |chunk: &str| {
            sink.lock().unwrap().push(chunk.to_string());
            Flow::Continue
        });
        (lines, Arc::new(StdoutRouter::new(default)))
    }

    #[tokio::test]
    async fn test_echo_through_stdin_and_stdout() {
        let (lines, router) = collecting_router();
        let proc = ManagedProcess::spawn(
            Path::new("cat"),
            &[],
            Path::new("."),
            router.clone(),
            router.default_consumer(),
            1,
        )
        .unwrap();

        proc.send_line("hello\n").await.unwrap();
        proc.send_line("world").await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while lines.lock().unwrap().len() < 2 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(lines.lock().unwrap().as_slice(), ["hello", "world"]);

        crate::supervisor::process::kill_process_tree_async(proc.pid).await.unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(5), proc.wait_for_exit())
            .await
            .unwrap();
        assert!(exit.contains(&proc.pid.to_string()));
        assert!(!proc.is_running());
        assert!(matches!(proc.send_line("late").await, Err(SupervisorError::NotRunning)));
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let (_, router) = collecting_router();
        let result = ManagedProcess::spawn(
            Path::new("/nonexistent/caspar/server"),
            &[],
            Path::new("."),
            router.clone(),
            router.default_consumer(),
            1,
        );
        assert!(matches!(result, Err(SupervisorError::SpawnFailed { .. })));
    }
}
