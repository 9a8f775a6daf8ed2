use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::supervisor::console::DEFAULT_LOG_BUFFER;
use crate::supervisor::SupervisorSettings;

pub const DEFAULT_CONFIG_PATH: &str = "config/global.toml";
pub const DEFAULT_LISTEN: &str = "127.0.0.1:57480";

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct GlobalConfig {
    pub ipc_listen: String,
    pub log_buffer_size: usize,
    pub server: ServerConfig,
    pub timeouts: TimeoutConfig,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// 설치 디렉토리 (실행 파일 경로를 넣어도 됨)
    pub install_dir: Option<String>,
    pub executable: String,
    pub args: Vec<String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub enumeration_ms: u64,
    pub query_ms: u64,
    pub pid_confirm_ms: u64,
    pub restart_grace_ms: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            ipc_listen: DEFAULT_LISTEN.to_string(),
            log_buffer_size: DEFAULT_LOG_BUFFER,
            server: ServerConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            install_dir: None,
            executable: crate::utils::default_executable_name().to_string(),
            args: Vec::new(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            enumeration_ms: 5000,
            query_ms: 5000,
            pid_confirm_ms: 10_000,
            restart_grace_ms: 5000,
        }
    }
}

impl GlobalConfig {
    /// `CASPAR_LAUNCHER_CONFIG` (or `config/global.toml`) plus environment
    /// overrides.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("CASPAR_LAUNCHER_CONFIG")
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut cfg = Self::load_from(Path::new(&path))?;
        cfg.apply_overrides(|key| std::env::var(key).ok());
        Ok(cfg)
    }

    /// A missing file means defaults; a malformed one is an error.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let s = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };
        toml::from_str(&s).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn apply_overrides<F>(&mut self, get: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = get("CASPARCG_INSTALL_DIR") {
            self.server.install_dir = Some(dir);
        }
        // 실행 파일 경로가 지정되면 디렉토리와 파일명 모두 그것을 따른다
        if let Some(exe) = get("CASPARCG_EXE_PATH") {
            let (dir, name) = split_executable_path(&exe);
            if let Some(dir) = dir {
                self.server.install_dir = Some(dir);
            }
            self.server.executable = name;
        }
        if let Some(listen) = get("CASPAR_LAUNCHER_LISTEN") {
            self.ipc_listen = listen;
        }
    }

    pub fn enumeration_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.enumeration_ms)
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            install_dir: self.server.install_dir.clone(),
            args: self.server.args.clone(),
            query_timeout: Duration::from_millis(self.timeouts.query_ms),
            pid_confirm_timeout: Duration::from_millis(self.timeouts.pid_confirm_ms),
            restart_grace: Duration::from_millis(self.timeouts.restart_grace_ms),
            log_buffer_size: self.log_buffer_size,
        }
    }
}

/// `C:\CasparCG\casparcg.exe` → (`C:\CasparCG`, `casparcg.exe`), with either separator.
fn split_executable_path(path: &str) -> (Option<String>, String) {
    let path = path.trim();
    match path.rfind(['\\', '/']) {
        Some(idx) => {
            let dir = &path[..idx];
            let dir = if dir.is_empty() { &path[..=idx] } else { dir };
            (Some(dir.to_string()), path[idx + 1..].to_string())
        }
        None => (None, path.to_string()),
    }
}
