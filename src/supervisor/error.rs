//! Supervisor 전용 에러 타입 — 에러 종류를 구분하여 IPC 핸들러에서
//! 적절한 HTTP 상태 코드와 응답 모양을 고를 수 있게 합니다.

use std::time::Duration;

use axum::http::StatusCode;

/// Supervisor 작업 중 발생할 수 있는 에러 유형
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("Server '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Could not find '{0}' in the install directory or any parent directory")]
    MissingExecutable(String),

    #[error("Server is not running")]
    NotRunning,

    #[error("Failed to spawn '{program}': {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("Failed to terminate process tree rooted at PID {pid}: {reason}")]
    KillFailed { pid: u32, reason: String },

    #[error("Server is already running (PID {pid}) outside this launcher. Stop it and start it again from here.")]
    UnmanagedInstance { pid: u32 },

    #[error("{operation} timed out after {}ms", .after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl SupervisorError {
    /// HTTP 상태 코드 매핑
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::AlreadyRunning(_) | Self::UnmanagedInstance { .. } => StatusCode::CONFLICT,
            Self::NotRunning => StatusCode::CONFLICT,
            Self::MissingExecutable(_) => StatusCode::NOT_FOUND,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::SpawnFailed { .. } | Self::KillFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON 에러 응답 생성 (`{error: true, message, code}`)
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": true,
            "message": self.to_string(),
            "code": self.error_code(),
        })
    }

    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AlreadyRunning(_) => "ALREADY_RUNNING",
            Self::MissingExecutable(_) => "MISSING_EXECUTABLE",
            Self::NotRunning => "NOT_RUNNING",
            Self::SpawnFailed { .. } => "SPAWN_FAILED",
            Self::KillFailed { .. } => "KILL_FAILED",
            Self::UnmanagedInstance { .. } => "UNMANAGED_INSTANCE",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T, E = SupervisorError> = std::result::Result<T, E>;
