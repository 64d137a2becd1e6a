//! 周期触发器管理接口

use async_trait::async_trait;
use thiserror::Error;

/// 进程管理错误
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to run {command}: {reason}")]
    Command { command: String, reason: String },
    #[error("{command} exited with {code:?}: {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// 启停本机的周期触发器（守护服务）
#[async_trait]
pub trait Supervisor: Send + Sync {
    async fn enable(&self) -> Result<(), SupervisorError>;
    async fn disable(&self) -> Result<(), SupervisorError>;
    async fn is_active(&self) -> Result<bool, SupervisorError>;
}
