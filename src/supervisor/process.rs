//! Process-tree termination.
//!
//! CasparCG may spawn helper processes (scanner, ffmpeg workers), so killing
//! only the tracked PID can leave orphans behind. Everything here kills the
//! whole tree rooted at a PID.

use crate::supervisor::error::{Result, SupervisorError};

/// Kill `pid` and all of its descendants. Blocking; call through
/// [`kill_process_tree_async`] from async code.
#[cfg(target_os = "windows")]
pub fn kill_process_tree(pid: u32) -> Result<()> {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x08000000;

    tracing::info!("Killing process tree rooted at PID {}", pid);
    let output = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdin(std::process::Stdio::null())
        .creation_flags(CREATE_NO_WINDOW)
        .output()
        .map_err(|e| SupervisorError::KillFailed {
            pid,
            reason: format!("failed to run taskkill: {}", e),
        })?;

    if output.status.success() {
        Ok(())
    } else {
        Err(SupervisorError::KillFailed {
            pid,
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Kill `pid` and all of its descendants. Blocking; call through
/// [`kill_process_tree_async`] from async code.
#[cfg(not(target_os = "windows"))]
pub fn kill_process_tree(pid: u32) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let processes = crate::process_monitor::get_running_processes();
    let descendants = crate::process_monitor::descendants_of(&processes, pid);
    tracing::info!(
        "Killing process tree rooted at PID {} ({} descendants)",
        pid,
        descendants.len()
    );

    // 자손 먼저 — 루트를 먼저 죽이면 자식들이 init으로 재부모화되어 놓칠 수 있다
    for child in descendants {
        match signal::kill(Pid::from_raw(child as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => tracing::warn!("Failed to kill descendant PID {}: {}", child, e),
        }
    }

    match signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        // 이미 종료됨
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(SupervisorError::KillFailed {
            pid,
            reason: format!("Failed to send signal: {}", e),
        }),
    }
}

pub async fn kill_process_tree_async(pid: u32) -> Result<()> {
    tokio::task::spawn_blocking(move || kill_process_tree(pid))
        .await
        .map_err(|e| SupervisorError::KillFailed {
            pid,
            reason: format!("kill task failed: {}", e),
        })?
}
