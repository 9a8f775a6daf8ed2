use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessStatus, System};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunningProcess {
    pub pid: u32,
    pub name: String,
    pub executable_path: Option<String>,
    /// 부모 PID (프로세스 트리 종료에 사용)
    #[serde(default)]
    pub parent_pid: Option<u32>,
}

impl RunningProcess {
    /// 이미지 이름 매칭 — 대소문자 무시, `.exe` 접미사 유무 무시.
    /// 리눅스의 comm 이름은 15자로 잘리므로 실행 파일 경로의 파일명도 함께 확인한다.
    pub fn matches_image(&self, image_name: &str) -> bool {
        if image_eq(&self.name, image_name) {
            return true;
        }
        self.executable_path
            .as_deref()
            .and_then(|p| Path::new(p).file_name())
            .and_then(|n| n.to_str())
            .map(|n| image_eq(n, image_name))
            .unwrap_or(false)
    }
}

fn strip_exe(name: &str) -> &str {
    let len = name.len();
    if len > 4 && name.is_char_boundary(len - 4) && name[len - 4..].eq_ignore_ascii_case(".exe") {
        &name[..len - 4]
    } else {
        name
    }
}

fn image_eq(a: &str, b: &str) -> bool {
    strip_exe(a).eq_ignore_ascii_case(strip_exe(b))
}

/// Source of the host's process list.
///
/// The supervisor only ever talks to this trait, so tests can hand it a
/// fabricated process list instead of the real OS table.
pub trait ProcessTable: Send + Sync + 'static {
    fn processes(&self) -> Vec<RunningProcess>;
}

/// The real OS process table, read through `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessTable;

impl ProcessTable for SystemProcessTable {
    fn processes(&self) -> Vec<RunningProcess> {
        get_running_processes()
    }
}

/// Fixed process list, mostly for tests.
#[derive(Debug, Default, Clone)]
pub struct StaticProcessTable {
    pub processes: Vec<RunningProcess>,
}

impl StaticProcessTable {
    pub fn with_names(names: &[&str]) -> Self {
        let processes = names
            .iter()
            .enumerate()
            .map(|(i, name)| RunningProcess {
                pid: 1000 + i as u32,
                name: name.to_string(),
                executable_path: None,
                parent_pid: None,
            })
            .collect();
        Self { processes }
    }
}

impl ProcessTable for StaticProcessTable {
    fn processes(&self) -> Vec<RunningProcess> {
        self.processes.clone()
    }
}

/// 크로스 플랫폼: 실행 중인 모든 프로세스 목록 가져오기
pub fn get_running_processes() -> Vec<RunningProcess> {
    let mut sys = System::new();
    sys.refresh_processes();

    let processes: Vec<RunningProcess> = sys
        .processes()
        .iter()
        .map(|(pid, process)| RunningProcess {
            pid: pid.as_u32(),
            name: process.name().to_string(),
            executable_path: process.exe().and_then(|p| p.to_str()).map(String::from),
            parent_pid: process.parent().map(|p| p.as_u32()),
        })
        .collect();

    tracing::debug!("Found {} running processes", processes.len());
    processes
}

/// 특정 이미지 이름으로 검색
pub fn find_by_image(table: &dyn ProcessTable, image_name: &str) -> Vec<RunningProcess> {
    table
        .processes()
        .into_iter()
        .filter(|p| p.matches_image(image_name))
        .collect()
}

/// `root` 아래의 모든 자손 PID (깊은 것부터). `root` 자신은 포함하지 않는다.
pub fn descendants_of(processes: &[RunningProcess], root: u32) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for p in processes {
        if let Some(parent) = p.parent_pid {
            if parent != p.pid {
                children.entry(parent).or_default().push(p.pid);
            }
        }
    }

    // BFS 순서로 모은 뒤 뒤집어서 리프부터 종료되도록 한다
    let mut order = Vec::new();
    let mut queue = vec![root];
    while let Some(pid) = queue.pop() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                if kid != root && !order.contains(&kid) {
                    order.push(kid);
                    queue.push(kid);
                }
            }
        }
    }
    order.reverse();
    order
}

/// 특정 PID가 실행 중인지 확인 (크로스 플랫폼). 좀비 프로세스는 실행 중으로 보지 않는다.
pub fn is_running(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_processes();
    sys.process(Pid::from_u32(pid))
        .map(|p| p.status() != ProcessStatus::Zombie)
        .unwrap_or(false)
}
