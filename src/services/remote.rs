//! 远程执行通道

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::infra::command::CommandError;

/// 远程命令输出
#[derive(Clone, Debug, Default)]
pub struct RemoteOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// 远程执行错误
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote command could not run: {0}")]
    Command(#[from] CommandError),
    #[error("remote command exited with {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },
    #[error("cannot prepare local ssh key {}: {source}", .path.display())]
    LocalKey {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// 到其他主机的命令通道
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// 连通性探测
    async fn probe(&self, address: &str, timeout: Duration) -> bool;

    /// 确保可以免口令登录
    ///
    /// 实现可在密钥被拒时用已知口令安装密钥后重试；默认等同于连通性探测
    async fn ensure_access(&self, address: &str, timeout: Duration) -> bool {
        self.probe(address, timeout).await
    }

    /// 执行远程命令，非零退出码不视为错误，由调用方判断
    async fn exec(&self, address: &str, command: &str, timeout: Duration)
        -> Result<RemoteOutput, RemoteError>;

    /// 执行并要求成功
    async fn exec_ok(&self, address: &str, command: &str, timeout: Duration) -> Result<RemoteOutput, RemoteError> {
        let output = self.exec(address, command, timeout).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(RemoteError::Failed {
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}
