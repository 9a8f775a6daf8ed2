//! Install-directory discovery and "is the server already up" probing.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use glob::glob;

use crate::process_monitor::{find_by_image, ProcessTable, RunningProcess};
use crate::supervisor::error::{Result, SupervisorError};

/// CasparCG가 읽는 기본 설정 파일 이름
pub const SERVER_CONFIG_FILE: &str = "casparcg.config";

/// Finds the server's install directory and detects running instances.
#[derive(Clone)]
pub struct ProcessLocator {
    executable: String,
    table: Arc<dyn ProcessTable>,
    enumeration_timeout: Duration,
}

impl ProcessLocator {
    pub fn new(executable: &str, table: Arc<dyn ProcessTable>, enumeration_timeout: Duration) -> Self {
        Self {
            executable: executable.to_string(),
            table,
            enumeration_timeout,
        }
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }

    /// Resolves the install directory.
    ///
    /// A hint is taken as-is (only normalized); without one the directories
    /// above the launcher's own binary are searched.
    pub fn locate(&self, hint: Option<&str>) -> Result<PathBuf> {
        if let Some(hint) = hint.filter(|h| !h.trim().is_empty()) {
            let dir = self.normalize_install_dir(hint);
            tracing::debug!("Using configured install directory: {}", dir.display());
            return Ok(dir);
        }

        let start = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .or_else(|| std::env::current_dir().ok())
            .ok_or_else(|| SupervisorError::MissingExecutable(self.executable.clone()))?;

        self.search_upward(&start)
            .ok_or_else(|| SupervisorError::MissingExecutable(self.executable.clone()))
    }

    /// 시작 디렉토리부터 부모 방향으로 실행 파일을 찾는다.
    /// 탐색 횟수는 시작 경로의 깊이로 제한된다.
    pub fn search_upward(&self, start: &Path) -> Option<PathBuf> {
        let depth = start.components().count();
        let mut dir = start.to_path_buf();
        for _ in 0..depth.max(1) {
            if dir.join(&self.executable).is_file() {
                tracing::info!("Found server executable in {}", dir.display());
                return Some(dir);
            }
            match dir.parent() {
                Some(parent) => dir = parent.to_path_buf(),
                None => break,
            }
        }
        tracing::warn!("Could not find server executable: {}", self.executable);
        None
    }

    /// `C:\srv\app.exe` → `C:\srv`. String based on purpose: Windows paths
    /// must normalize the same way on every host.
    pub fn normalize_install_dir(&self, path: &str) -> PathBuf {
        let trimmed = path.trim();
        let name_len = self.executable.len();
        let cut = if trimmed.len() >= name_len
            && trimmed.is_char_boundary(trimmed.len() - name_len)
            && trimmed[trimmed.len() - name_len..].eq_ignore_ascii_case(&self.executable)
        {
            &trimmed[..trimmed.len() - name_len]
        } else {
            trimmed
        };
        let dir = cut.trim_end_matches(['\\', '/']);
        if dir.is_empty() {
            // "app.exe" 또는 "/app.exe" 같은 입력
            if cut.starts_with('/') || cut.starts_with('\\') {
                return PathBuf::from(&cut[..1]);
            }
            return PathBuf::from(".");
        }
        PathBuf::from(dir)
    }

    /// 이미지 이름으로 실행 중인 서버를 찾는다. 열거는 블로킹 스레드풀에서,
    /// `enumeration_timeout` 안에 끝나야 한다.
    pub async fn probe(&self) -> Result<Option<RunningProcess>> {
        Ok(self.find_all().await?.into_iter().next())
    }

    /// Every process whose image matches the server executable.
    pub async fn find_all(&self) -> Result<Vec<RunningProcess>> {
        let table = self.table.clone();
        let image = self.executable.clone();
        let task = tokio::task::spawn_blocking(move || find_by_image(table.as_ref(), &image));

        match tokio::time::timeout(self.enumeration_timeout, task).await {
            Ok(Ok(found)) => Ok(found),
            Ok(Err(e)) => Err(SupervisorError::Internal(anyhow::anyhow!(
                "Process enumeration task failed: {}",
                e
            ))),
            Err(_) => Err(SupervisorError::Timeout {
                operation: "Process enumeration",
                after: self.enumeration_timeout,
            }),
        }
    }

    /// Like [`probe`](Self::probe) but failures count as "not found".
    pub async fn find_running(&self) -> Option<RunningProcess> {
        match self.probe().await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!("Process probe for '{}' failed: {}", self.executable, e);
                None
            }
        }
    }

    pub async fn is_already_running(&self) -> bool {
        self.find_running().await.is_some()
    }
}

/// 설치 디렉토리의 `*.config` 파일 목록
pub fn find_configuration_files(dir: &Path) -> Vec<String> {
    let pattern = dir.join("*.config");
    let Some(pattern) = pattern.to_str() else {
        return Vec::new();
    };
    let Ok(paths) = glob(pattern) else {
        return Vec::new();
    };
    let mut configs: Vec<String> = paths
        .flatten()
        .filter(|p| p.is_file())
        .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(String::from))
        .collect();
    configs.sort();
    configs
}

pub fn has_configuration_file(dir: &Path) -> bool {
    dir.join(SERVER_CONFIG_FILE).is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_monitor::StaticProcessTable;

    fn locator(exe: &str, names: &[&str]) -> ProcessLocator {
        ProcessLocator::new(
            exe,
            Arc::new(StaticProcessTable::with_names(names)),
            Duration::from_secs(2),
        )
    }

    #[test]
    fn test_hint_with_executable_suffix_is_normalized() {
        let loc = locator("app.exe", &[]);
        assert_eq!(loc.locate(Some(r"C:\srv\app.exe")).unwrap(), PathBuf::from(r"C:\srv"));
        assert_eq!(loc.normalize_install_dir("/opt/srv/APP.EXE"), PathBuf::from("/opt/srv"));
    }

    #[test]
    fn test_hint_directory_is_used_verbatim() {
        let loc = locator("app.exe", &[]);
        assert_eq!(loc.locate(Some(r"D:\media\caspar\")).unwrap(), PathBuf::from(r"D:\media\caspar"));
        assert_eq!(loc.locate(Some("/srv/caspar")).unwrap(), PathBuf::from("/srv/caspar"));
    }

    #[test]
    fn test_bare_executable_hint() {
        let loc = locator("app.exe", &[]);
        assert_eq!(loc.normalize_install_dir("app.exe"), PathBuf::from("."));
        assert_eq!(loc.normalize_install_dir("/app.exe"), PathBuf::from("/"));
    }

    #[test]
    fn test_search_upward_finds_parent() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("app.exe"), b"").unwrap();
        let nested = root.path().join("resources").join("app");
        std::fs::create_dir_all(&nested).unwrap();

        let loc = locator("app.exe", &[]);
        assert_eq!(loc.search_upward(&nested), Some(root.path().to_path_buf()));
    }

    #[test]
    fn test_search_upward_exhausted() {
        let root = tempfile::tempdir().unwrap();
        let loc = locator("definitely-not-here-4242.exe", &[]);
        assert_eq!(loc.search_upward(root.path()), None);
    }

    #[test]
    fn test_configuration_files() {
        let root = tempfile::tempdir().unwrap();
        assert!(!has_configuration_file(root.path()));
        std::fs::write(root.path().join("casparcg.config"), b"<configuration/>").unwrap();
        std::fs::write(root.path().join("backup.config"), b"").unwrap();
        std::fs::write(root.path().join("readme.txt"), b"").unwrap();

        assert!(has_configuration_file(root.path()));
        assert_eq!(
            find_configuration_files(root.path()),
            vec!["backup.config".to_string(), "casparcg.config".to_string()]
        );
    }

    #[tokio::test]
    async fn test_is_already_running_with_fabricated_list() {
        assert!(locator("app.exe", &["svchost.exe", "app.exe"]).is_already_running().await);
        assert!(!locator("app.exe", &["notepad.exe"]).is_already_running().await);
    }

    struct SlowTable;

    impl ProcessTable for SlowTable {
        fn processes(&self) -> Vec<RunningProcess> {
            std::thread::sleep(Duration::from_millis(300));
            Vec::new()
        }
    }

    #[tokio::test]
    async fn test_slow_enumeration_times_out() {
        let loc = ProcessLocator::new("app.exe", Arc::new(SlowTable), Duration::from_millis(20));
        assert!(matches!(loc.probe().await, Err(SupervisorError::Timeout { .. })));
        assert!(!loc.is_already_running().await);
    }
}
