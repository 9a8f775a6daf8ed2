//! Small platform helpers shared by the launcher.

use tokio::process::Command;

/// Keep the spawned server from popping up its own console window on
/// Windows. No-op elsewhere.
#[cfg(target_os = "windows")]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    cmd.creation_flags(CREATE_NO_WINDOW)
}

#[cfg(not(target_os = "windows"))]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    cmd
}

/// Platform default for the server's executable name.
pub fn default_executable_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "casparcg.exe"
    } else {
        "casparcg"
    }
}
