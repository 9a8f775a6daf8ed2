pub mod console;
pub mod error;
pub mod managed_process;
pub mod process;
pub mod query;
pub mod router;
pub mod state_machine;

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, oneshot, Mutex};

use crate::path_detector::{has_configuration_file, ProcessLocator, SERVER_CONFIG_FILE};
use console::{parse_log_level, LogBuffer, LogLevel, LogLine, LogSource, DEFAULT_LOG_BUFFER};
use error::{Result, SupervisorError};
use managed_process::ManagedProcess;
use query::{marker_scanner, StdoutQuery};
use router::{ConsumerId, Flow, StdoutConsumer, StdoutRouter};
use state_machine::{State, StateMachine};

/// Tunables for one supervisor, usually built from `GlobalConfig`.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Install directory hint (directory or full executable path)
    pub install_dir: Option<String>,
    pub args: Vec<String>,
    pub query_timeout: Duration,
    pub pid_confirm_timeout: Duration,
    pub restart_grace: Duration,
    pub log_buffer_size: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            install_dir: None,
            args: Vec::new(),
            query_timeout: Duration::from_secs(5),
            pid_confirm_timeout: Duration::from_secs(10),
            restart_grace: Duration::from_secs(5),
            log_buffer_size: DEFAULT_LOG_BUFFER,
        }
    }
}

/// Snapshot of the supervised server. Only the supervisor mutates the
/// underlying state; everyone else gets copies.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerState {
    pub is_running: bool,
    pub launch_time: Option<DateTime<Utc>>,
    pub install_dir: Option<PathBuf>,
    pub state: State,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// Fired once per transition into or out of `Running`, whether the stop
    /// was requested or not.
    StatusChanged {
        is_running: bool,
        launch_time: Option<DateTime<Utc>>,
    },
    Log(LogLine),
}

/// Console history + event bus, shared with background tasks.
#[derive(Clone)]
struct EventSink {
    console: Arc<StdMutex<LogBuffer>>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl EventSink {
    fn log(&self, source: LogSource, content: String, level: LogLevel) {
        let line = self
            .console
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(source, content, level);
        // 구독자가 없으면 실패하지만 로그 전달은 fire-and-forget
        let _ = self.events.send(SupervisorEvent::Log(line));
    }

    fn system(&self, content: String) {
        self.log(LogSource::System, content, LogLevel::Info);
    }

    fn status(&self, is_running: bool, launch_time: Option<DateTime<Utc>>) {
        let _ = self.events.send(SupervisorEvent::StatusChanged { is_running, launch_time });
    }

    /// Consumer that turns every line into a log event.
    fn output_consumer(&self, source: LogSource) -> StdoutConsumer {
        let sink = self.clone();
        Arc::new(move |chunk: &str| {
            sink.log(source, chunk.to_string(), parse_log_level(chunk));
            Flow::Continue
        })
    }
}

struct Inner {
    machine: StateMachine,
    handle: Option<Arc<ManagedProcess>>,
    launch_time: Option<DateTime<Utc>>,
    install_dir: Option<PathBuf>,
    generation: u64,
}

impl Inner {
    fn transition(&mut self, to: State) -> Result<()> {
        self.machine
            .transition(to)
            .map_err(|e| SupervisorError::Internal(e.into()))
    }

    fn snapshot(&self) -> ServerState {
        let live = self.handle.as_ref().filter(|h| h.is_running());
        ServerState {
            is_running: live.is_some(),
            launch_time: live.and(self.launch_time),
            install_dir: self.install_dir.clone(),
            state: self.machine.state(),
            pid: live.map(|h| h.confirmed_pid().unwrap_or(h.pid)),
        }
    }

    /// The handle exited on its own; drop it and tell subscribers.
    fn reap_exited(&mut self, sink: &EventSink, exit_msg: String) {
        self.handle = None;
        self.launch_time = None;
        if let Err(e) = self.transition(State::Stopped) {
            tracing::warn!("{}", e);
        }
        sink.system(exit_msg);
        sink.status(false, None);
    }
}

/// Owns the lifecycle of at most one server process.
pub struct Supervisor {
    settings: SupervisorSettings,
    locator: ProcessLocator,
    inner: Arc<Mutex<Inner>>,
    /// 응답 스캐너는 한 번에 하나만 슬롯을 차지한다
    query_lock: Mutex<()>,
    sink: EventSink,
}

impl Supervisor {
    pub fn new(locator: ProcessLocator, settings: SupervisorSettings) -> Self {
        let (events, _) = broadcast::channel(2048);
        let console = Arc::new(StdMutex::new(LogBuffer::with_capacity(settings.log_buffer_size)));
        Self {
            settings,
            locator,
            inner: Arc::new(Mutex::new(Inner {
                machine: StateMachine::new(),
                handle: None,
                launch_time: None,
                install_dir: None,
                generation: 0,
            })),
            query_lock: Mutex::new(()),
            sink: EventSink { console, events },
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.sink.events.subscribe()
    }

    pub async fn state(&self) -> ServerState {
        self.inner.lock().await.snapshot()
    }

    /// Install directory: the one in use, else whatever the locator resolves.
    pub async fn install_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = self.inner.lock().await.install_dir.clone() {
            return Ok(dir);
        }
        self.locator.locate(self.settings.install_dir.as_deref())
    }

    /// Start the server. Resolves as soon as the spawn call succeeded.
    pub async fn launch(&self) -> Result<ServerState> {
        let mut inner = self.inner.lock().await;
        let executable = self.locator.executable().to_string();

        if let Some(handle) = inner.handle.clone() {
            if handle.is_running() {
                return Err(SupervisorError::AlreadyRunning(executable));
            }
            // 종료는 됐지만 감시 태스크가 아직 처리하지 못한 핸들
            let exit_msg = handle.wait_for_exit().await;
            inner.reap_exited(&self.sink, exit_msg);
        }

        if let Some(found) = self.locator.find_running().await {
            tracing::warn!("'{}' is already running with PID {}", executable, found.pid);
            return Err(SupervisorError::AlreadyRunning(executable));
        }

        let dir = self.locator.locate(self.settings.install_dir.as_deref())?;

        inner.transition(State::Launching)?;
        if !has_configuration_file(&dir) {
            tracing::warn!("No {} found in {}", SERVER_CONFIG_FILE, dir.display());
        }

        inner.generation += 1;
        let generation = inner.generation;
        let program = dir.join(&executable);
        let router = Arc::new(StdoutRouter::new(self.sink.output_consumer(LogSource::Stdout)));
        let stderr_sink = self.sink.output_consumer(LogSource::Stderr);

        let process = match ManagedProcess::spawn(
            &program,
            &self.settings.args,
            &dir,
            router,
            stderr_sink,
            generation,
        ) {
            Ok(process) => Arc::new(process),
            Err(e) => {
                tracing::error!("{}", e);
                inner.transition(State::Stopped)?;
                return Err(e);
            }
        };

        let launch_time = Utc::now();
        inner.handle = Some(process.clone());
        inner.launch_time = Some(launch_time);
        inner.install_dir = Some(dir);
        inner.transition(State::Running)?;

        self.sink.system(format!("Server started with PID {}", process.pid));
        self.sink.status(true, Some(launch_time));

        self.spawn_exit_watcher(&process);
        self.spawn_pid_confirmation(&process);

        Ok(inner.snapshot())
    }

    /// Kill the whole server process tree.
    ///
    /// Fails with `NotRunning` when nothing is managed; that is the only
    /// policy for a stop request while stopped.
    pub async fn terminate(&self) -> Result<ServerState> {
        let mut inner = self.inner.lock().await;
        let Some(handle) = inner.handle.clone() else {
            return Err(SupervisorError::NotRunning);
        };
        if !handle.is_running() {
            let exit_msg = handle.wait_for_exit().await;
            inner.reap_exited(&self.sink, exit_msg);
            return Err(SupervisorError::NotRunning);
        }

        inner.transition(State::Terminating)?;
        if let Err(e) = process::kill_process_tree_async(handle.pid).await {
            tracing::error!("{}", e);
            inner.transition(State::Running)?;
            return Err(e);
        }
        if let Some(confirmed) = handle.confirmed_pid().filter(|&p| p != handle.pid) {
            if let Err(e) = process::kill_process_tree_async(confirmed).await {
                tracing::warn!("{}", e);
            }
        }

        inner.handle = None;
        inner.launch_time = None;
        inner.transition(State::Stopped)?;
        self.sink.system(format!("Server stopped (PID {})", handle.pid));
        self.sink.status(false, None);
        tracing::info!("Server process tree {} terminated", handle.pid);

        Ok(inner.snapshot())
    }

    /// Stop, wait for the old process to go away, start again.
    pub async fn restart(&self) -> Result<ServerState> {
        let old = self.inner.lock().await.handle.clone();
        match self.terminate().await {
            Ok(_) | Err(SupervisorError::NotRunning) => {}
            Err(e) => return Err(e),
        }
        if let Some(old) = old {
            if tokio::time::timeout(self.settings.restart_grace, old.wait_for_exit())
                .await
                .is_err()
            {
                tracing::warn!("PID {} still alive after restart grace period", old.pid);
            }
        }
        self.launch().await
    }

    /// Current state, reconciled against the OS when nothing is managed.
    ///
    /// An instance started outside this launcher is reported as
    /// `UnmanagedInstance`: it is running, but cannot be commanded or stopped
    /// from here.
    pub async fn check_status(&self) -> Result<ServerState> {
        {
            let mut inner = self.inner.lock().await;
            if let Some(handle) = inner.handle.clone() {
                if handle.is_running() {
                    return Ok(inner.snapshot());
                }
                let exit_msg = handle.wait_for_exit().await;
                inner.reap_exited(&self.sink, exit_msg);
            }
        }

        match self.locator.find_running().await {
            Some(found) => Err(SupervisorError::UnmanagedInstance { pid: found.pid }),
            None => Ok(self.state().await),
        }
    }

    async fn live_handle(&self) -> Result<Arc<ManagedProcess>> {
        self.inner
            .lock()
            .await
            .handle
            .clone()
            .filter(|h| h.is_running())
            .ok_or(SupervisorError::NotRunning)
    }

    /// Write one command line to the server's stdin.
    pub async fn send_command(&self, command: &str) -> Result<()> {
        let handle = self.live_handle().await?;
        tracing::info!("Sending command to server: {}", command.trim_end());
        handle.send_line(command).await
    }

    pub async fn set_stdout_consumer(&self, consumer: StdoutConsumer) -> Result<ConsumerId> {
        let handle = self.live_handle().await?;
        Ok(handle.router().set_consumer(consumer))
    }

    pub async fn reset_stdout_consumer(&self) -> Result<()> {
        let handle = self.live_handle().await?;
        handle.router().reset_to_default();
        Ok(())
    }

    /// Send `query.command` and wait for the marked reply in stdout.
    ///
    /// Queries run one at a time; a second caller waits for the first to
    /// finish before its own timeout starts.
    pub async fn query(&self, query: &StdoutQuery) -> Result<String> {
        let _turn = self.query_lock.lock().await;
        let handle = self.live_handle().await?;
        let router = handle.router().clone();
        let (tx, rx) = oneshot::channel();
        let id = router.set_consumer(marker_scanner(query, tx, router.default_consumer()));

        if let Err(e) = handle.send_line(&query.command).await {
            router.release(id);
            return Err(e);
        }

        tokio::select! {
            reply = rx => match reply {
                Ok(field) => Ok(field),
                Err(_) if !handle.is_running() => Err(SupervisorError::NotRunning),
                // 외부에서 set_stdout_consumer로 스캐너를 밀어낸 경우
                Err(_) => Err(SupervisorError::Internal(anyhow::anyhow!(
                    "'{}' reply scanner was replaced before a reply arrived",
                    query.command
                ))),
            },
            _ = handle.wait_for_exit() => {
                router.release(id);
                Err(SupervisorError::NotRunning)
            }
            _ = tokio::time::sleep(self.settings.query_timeout) => {
                router.release(id);
                tracing::warn!("No '{}' reply within {:?}", query.marker, self.settings.query_timeout);
                Err(SupervisorError::Timeout {
                    operation: "Server query",
                    after: self.settings.query_timeout,
                })
            }
        }
    }

    pub async fn version(&self) -> Result<String> {
        self.query(&StdoutQuery::version()).await
    }

    /// Console history: lines after `since`, or the last `count` lines.
    pub fn console(&self, since: Option<u64>, count: Option<usize>) -> Vec<LogLine> {
        let console = self.sink.console.lock().unwrap_or_else(|e| e.into_inner());
        console.read(since, count)
    }

    /// Stop the managed server, if any. Used on daemon shutdown.
    pub async fn shutdown(&self) {
        match self.terminate().await {
            Ok(_) => tracing::info!("Managed server stopped for shutdown"),
            Err(SupervisorError::NotRunning) => {}
            Err(e) => tracing::error!("Failed to stop managed server on shutdown: {}", e),
        }
    }

    fn spawn_exit_watcher(&self, handle: &Arc<ManagedProcess>) {
        let inner = self.inner.clone();
        let sink = self.sink.clone();
        let generation = handle.generation;
        let mut exit_rx = handle.exit_watch();

        tokio::spawn(async move {
            let exit_msg = match exit_rx.wait_for(|exit| exit.is_some()).await {
                Ok(exit) => exit.clone().unwrap_or_default(),
                Err(_) => "Server process exited".to_string(),
            };

            let mut guard = inner.lock().await;
            let current = guard.handle.as_ref().map(|h| h.generation);
            if current == Some(generation) {
                tracing::warn!("Server exited without a stop request: {}", exit_msg);
                guard.reap_exited(&sink, exit_msg);
            }
        });
    }

    /// Re-enumerate processes to find the server's real PID. Runs in the
    /// background; `launch()` does not wait for it.
    fn spawn_pid_confirmation(&self, handle: &Arc<ManagedProcess>) {
        let locator = self.locator.clone();
        let weak = Arc::downgrade(handle);
        let cancel = handle.cancel_token();
        let spawned = handle.pid;
        let limit = self.settings.pid_confirm_timeout;

        tokio::spawn(async move {
            let confirm = async {
                loop {
                    if let Ok(found) = locator.find_all().await {
                        let pick = found
                            .iter()
                            .find(|p| p.pid == spawned)
                            .or_else(|| found.iter().find(|p| p.parent_pid == Some(spawned)))
                            .or_else(|| found.first());
                        if let Some(p) = pick {
                            return p.pid;
                        }
                    }
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {}
                res = tokio::time::timeout(limit, confirm) => match res {
                    Ok(pid) => {
                        if let Some(handle) = weak.upgrade() {
                            tracing::info!("Confirmed server PID {} (spawned as {})", pid, spawned);
                            handle.confirm_pid(pid);
                        }
                    }
                    Err(_) => tracing::debug!("Could not confirm server PID within {:?}", limit),
                },
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_monitor::StaticProcessTable;

    fn supervisor(running: &[&str], install_dir: Option<&str>) -> Supervisor {
        let locator = ProcessLocator::new(
            "app.exe",
            Arc::new(StaticProcessTable::with_names(running)),
            Duration::from_secs(1),
        );
        let settings = SupervisorSettings {
            install_dir: install_dir.map(String::from),
            ..Default::default()
        };
        Supervisor::new(locator, settings)
    }

    #[tokio::test]
    async fn test_initial_state_is_stopped() {
        let sup = supervisor(&[], None);
        let state = sup.state().await;
        assert!(!state.is_running);
        assert_eq!(state.launch_time, None);
        assert_eq!(state.state, State::Stopped);
    }

    #[tokio::test]
    async fn test_launch_while_external_instance_running() {
        let sup = supervisor(&["app.exe"], Some("/tmp"));
        assert!(matches!(sup.launch().await, Err(SupervisorError::AlreadyRunning(_))));
        assert_eq!(sup.state().await.state, State::Stopped);
    }

    #[tokio::test]
    async fn test_launch_spawn_failure_returns_to_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(&[], dir.path().to_str());
        let mut events = sup.subscribe();

        assert!(matches!(sup.launch().await, Err(SupervisorError::SpawnFailed { .. })));
        let state = sup.state().await;
        assert_eq!(state.state, State::Stopped);
        assert!(!state.is_running);
        // 실패한 시작은 상태 변경 알림을 보내지 않는다
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, SupervisorEvent::StatusChanged { .. }));
        }
    }

    #[tokio::test]
    async fn test_terminate_while_stopped_is_not_running() {
        let sup = supervisor(&[], None);
        assert!(matches!(sup.terminate().await, Err(SupervisorError::NotRunning)));
        assert!(matches!(sup.terminate().await, Err(SupervisorError::NotRunning)));
    }

    #[tokio::test]
    async fn test_commands_require_running_server() {
        let sup = supervisor(&[], None);
        assert!(matches!(sup.send_command("PLAY 1-10 AMB").await, Err(SupervisorError::NotRunning)));
        assert!(matches!(sup.version().await, Err(SupervisorError::NotRunning)));
        let consumer: StdoutConsumer = Arc::new(|_chunk: &str| Flow::Continue);
        assert!(matches!(sup.set_stdout_consumer(consumer).await, Err(SupervisorError::NotRunning)));
        assert!(matches!(sup.reset_stdout_consumer().await, Err(SupervisorError::NotRunning)));
    }

    #[tokio::test]
    async fn test_check_status_reports_unmanaged_instance() {
        let sup = supervisor(&["app.exe"], None);
        assert!(matches!(
            sup.check_status().await,
            Err(SupervisorError::UnmanagedInstance { pid: 1000 })
        ));

        let sup = supervisor(&["notepad.exe"], None);
        assert!(!sup.check_status().await.unwrap().is_running);
    }

    #[tokio::test]
    async fn test_install_dir_from_hint() {
        let sup = supervisor(&[], Some(r"C:\srv\app.exe"));
        assert_eq!(sup.install_dir().await.unwrap(), PathBuf::from(r"C:\srv"));
    }
}
