//! 统一错误处理
//!
//! `AgentError` 汇总各模块错误并映射进程退出码；
//! `ApiError` 实现 `IntoResponse`，供状态端点使用

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::config::ConfigError;
use crate::infra::github::GitHubError;
use crate::services::dns::DnsError;
use crate::services::guard::GuardError;
use crate::services::lease::LeaseError;
use crate::services::lock::LockError;
use crate::services::orchestrator::{MigrationFailure, OrchestratorError};
use crate::services::persistence::PersistError;
use crate::services::registry::RegistryError;
use crate::services::remote::RemoteError;
use crate::services::supervisor::SupervisorError;
use crate::services::transfer::TransferError;

/// 进程退出码
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const RUNTIME: i32 = 1;
    pub const CONFIG: i32 = 2;
    /// 候选池耗尽
    pub const NO_CANDIDATE: i32 = 3;
}

/// Agent 错误
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Lease(#[from] LeaseError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Dns(#[from] DnsError),
    #[error(transparent)]
    Migration(#[from] MigrationFailure),
    #[error(transparent)]
    Guard(#[from] GuardError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error(transparent)]
    GitHub(#[from] GitHubError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("http client setup failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AgentError {
    pub fn exit_code(&self) -> i32 {
        match self {
            AgentError::Config(_) => exit_code::CONFIG,
            AgentError::Migration(failure) if matches!(failure.error, OrchestratorError::NoCandidate) => {
                exit_code::NO_CANDIDATE
            }
            _ => exit_code::RUNTIME,
        }
    }
}

/// API 错误响应结构
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}

/// 状态端点错误
#[derive(Debug)]
pub enum ApiError {
    /// 500 - 内部错误
    Internal(String),
    /// 503 - 本机尚未初始化
    ServiceUnavailable(String),
}

impl From<LeaseError> for ApiError {
    fn from(e: LeaseError) -> Self {
        match e {
            LeaseError::NotInitialized => ApiError::ServiceUnavailable(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            ApiError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg)
            }
        };

        let body = ErrorResponse::new(error_type, message);
        (status, Json(body)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Internal(m) => write!(f, "Internal error: {}", m),
            ApiError::ServiceUnavailable(m) => write!(f, "Service unavailable: {}", m),
        }
    }
}

impl std::error::Error for ApiError {}

/// 便捷类型别名
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MigrationSession;

    fn failure(error: OrchestratorError) -> AgentError {
        AgentError::Migration(MigrationFailure {
            phase: crate::domain::MigrationPhase::Selecting,
            session: Box::new(MigrationSession::new(None, None, chrono::Utc::now())),
            error,
        })
    }

    #[test]
    fn test_exit_codes() {
        let config = AgentError::Config(ConfigError::Missing("HERMIT_CURRENT_DOMAIN".into()));
        assert_eq!(config.exit_code(), 2);
        assert_eq!(failure(OrchestratorError::NoCandidate).exit_code(), 3);
        assert_eq!(
            failure(OrchestratorError::VerificationFailed("10.0.0.2".into())).exit_code(),
            1
        );
        assert_eq!(AgentError::Lease(LeaseError::NotInitialized).exit_code(), 1);
    }

    #[test]
    fn test_uninitialized_lease_is_unavailable() {
        let err: ApiError = LeaseError::NotInitialized.into();
        assert!(matches!(err, ApiError::ServiceUnavailable(_)));
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
