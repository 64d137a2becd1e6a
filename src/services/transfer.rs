//! 传输引擎
//!
//! 两层复制：
//! 1. 批量增量同步：rsync over ssh，保留部分文件，重跑时从差异处续传
//! 2. 流式传输：逐目录 tar | ssh，失败只重传该目录
//!
//! 进度由会话持有，重试时跳过已完成的部分。

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::remote::RemoteChannel;
use crate::config::{constants::PRESERVE_BACKUP_DIR, AgentConfig};
use crate::domain::TransferProgress;
use crate::infra::command::{shell_quote, CommandError, CommandResult, CommandRunner};
use crate::infra::ssh::SshChannel;

/// rsync 的部分文件目录（相对于每个目标目录）
const PARTIAL_DIR: &str = ".rsync-partial";

/// rsync I/O 超时（秒）
const RSYNC_IO_TIMEOUT_SECS: u64 = 300;

/// rsync 退出码 24：源文件在传输中消失
const RSYNC_VANISHED: i32 = 24;

/// 传输错误
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("{step} could not run: {source}")]
    Command {
        step: String,
        #[source]
        source: CommandError,
    },
    #[error("bulk sync exited with {code:?}: {stderr}")]
    Bulk { code: Option<i32>, stderr: String },
    #[error("stream of {dir} exited with {code:?}: {stderr}")]
    Stream {
        dir: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("{0} timed out")]
    Timeout(String),
    #[error("transfer cancelled")]
    Cancelled,
    #[error("remote step failed: {0}")]
    Remote(String),
}

impl TransferError {
    fn from_command(step: &str, e: CommandError) -> Self {
        match e {
            CommandError::Cancelled => TransferError::Cancelled,
            CommandError::Timeout => TransferError::Timeout(step.to_string()),
            other => TransferError::Command {
                step: step.to_string(),
                source: other,
            },
        }
    }

    /// 是否值得重试
    pub fn is_transient(&self) -> bool {
        match self {
            TransferError::Cancelled => false,
            // 本地缺少 rsync/ssh 之类，重试无用
            TransferError::Command {
                source: CommandError::SpawnFailed(_),
                ..
            } => false,
            // rsync 1/2/4：参数或协议错误
            TransferError::Bulk {
                code: Some(1 | 2 | 4),
                ..
            } => false,
            _ => true,
        }
    }
}

/// 复制接口
#[async_trait]
pub trait Replicator: Send + Sync {
    /// 将本机状态复制到目标主机
    async fn clone_to(
        &self,
        target: &str,
        progress: &mut TransferProgress,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError>;

    /// 连通性 + 标记文件校验；只判断，不修复
    async fn verify(&self, target: &str, expected_marker: &str) -> Result<bool, TransferError>;

    /// 交接后再次同步数据与日志目录
    async fn final_sync(&self, target: &str, cancel: &CancellationToken) -> Result<(), TransferError>;
}

/// 传输参数
#[derive(Clone, Debug)]
pub struct TransferSettings {
    pub exclusions: Vec<String>,
    pub stream_dirs: Vec<String>,
    pub bandwidth_limit_kbps: u64,
    pub timeout: Duration,
    pub verify_timeout: Duration,
    pub connect_timeout: Duration,
    pub preserve_paths: Vec<String>,
    pub marker_path: PathBuf,
    /// final_sync 同步的目录
    pub sync_dirs: Vec<PathBuf>,
}

impl TransferSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            exclusions: config.transfer.exclusions.clone(),
            stream_dirs: config.transfer.stream_dirs.clone(),
            bandwidth_limit_kbps: config.transfer.bandwidth_limit_kbps,
            timeout: Duration::from_secs(config.transfer.timeout_secs),
            verify_timeout: Duration::from_secs(config.transfer.verify_timeout_secs),
            connect_timeout: Duration::from_secs(config.ssh.connect_timeout_secs),
            preserve_paths: config.transfer.preserve_paths.clone(),
            marker_path: config.marker_file(),
            sync_dirs: vec![config.data_dir(), config.log_dir()],
        }
    }
}

/// rsync + tar 传输引擎
pub struct TransferEngine {
    settings: TransferSettings,
    ssh: SshChannel,
    remote: Arc<dyn RemoteChannel>,
}

impl TransferEngine {
    pub fn new(settings: TransferSettings, ssh: SshChannel, remote: Arc<dyn RemoteChannel>) -> Self {
        Self {
            settings,
            ssh,
            remote,
        }
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    /// 批量层 rsync 参数
    pub fn bulk_args(&self, target: &str) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-aAXHz".into(),
            "--numeric-ids".into(),
            "--delete".into(),
            "--partial".into(),
            format!("--partial-dir={}", PARTIAL_DIR),
            format!("--timeout={}", RSYNC_IO_TIMEOUT_SECS),
            "--stats".into(),
        ];

        let excluded = self
            .settings
            .exclusions
            .iter()
            .chain(self.settings.stream_dirs.iter())
            .map(String::as_str)
            .chain(std::iter::once(PRESERVE_BACKUP_DIR));
        for path in excluded {
            args.push(format!("--exclude={}", path));
        }

        if self.settings.bandwidth_limit_kbps > 0 {
            args.push(format!("--bwlimit={}", self.settings.bandwidth_limit_kbps));
        }

        args.push("-e".into());
        args.push(self.ssh.transport_command());
        args.push("/".into());
        args.push(format!("{}:/", self.ssh.destination(target)));
        args
    }

    /// 流式层命令：本地 tar 经 ssh 解包到目标同一路径
    pub fn stream_command(&self, target: &str, dir: &str) -> String {
        let relative = dir.trim_start_matches('/');
        format!(
            "tar -czf - -C / {} | {} {} {}",
            shell_quote(relative),
            self.ssh.transport_command(),
            shell_quote(&self.ssh.destination(target)),
            shell_quote("tar -xzf - -C /"),
        )
    }

    fn preserve_command(&self) -> String {
        let paths = self.relative_preserve_paths();
        format!(
            "mkdir -p {backup} && cd / && for p in {paths}; do \
             if [ -e \"$p\" ] && [ ! -e {backup}/\"$p\" ]; then cp -a --parents \"$p\" {backup}/; fi; done",
            backup = PRESERVE_BACKUP_DIR,
            paths = paths,
        )
    }

    fn restore_command(&self) -> String {
        let paths = self.relative_preserve_paths();
        format!(
            "cd {backup} && for p in {paths}; do \
             if [ -e \"$p\" ]; then cp -a --parents \"$p\" /; fi; done",
            backup = PRESERVE_BACKUP_DIR,
            paths = paths,
        )
    }

    fn relative_preserve_paths(&self) -> String {
        self.settings
            .preserve_paths
            .iter()
            .map(|p| shell_quote(p.trim_start_matches('/')))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// 备份目标机的网络身份文件
    async fn preserve_identity(&self, target: &str) {
        if self.settings.preserve_paths.is_empty() {
            return;
        }
        match self
            .remote
            .exec_ok(target, &self.preserve_command(), self.settings.connect_timeout * 2)
            .await
        {
            Ok(_) => info!(target, "Backed up target network identity"),
            Err(e) => warn!(target, error = %e, "Failed to back up target network identity"),
        }
    }

    /// 批量层可能覆盖目标上的授权密钥，重新确认免口令登录
    async fn reauthorize(&self, target: &str) -> Result<(), TransferError> {
        if self
            .remote
            .ensure_access(target, self.settings.connect_timeout)
            .await
        {
            return Ok(());
        }
        warn!(target, "Key login lost after bulk sync");
        Err(TransferError::Remote(
            "ssh access lost after bulk sync".to_string(),
        ))
    }

    async fn restore_identity(&self, target: &str) -> Result<(), TransferError> {
        if self.settings.preserve_paths.is_empty() {
            return Ok(());
        }
        self.remote
            .exec_ok(target, &self.restore_command(), self.settings.connect_timeout * 2)
            .await
            .map_err(|e| TransferError::Remote(format!("restore network identity: {}", e)))?;
        info!(target, "Restored target network identity");
        Ok(())
    }

    async fn bulk_sync(&self, target: &str, cancel: &CancellationToken) -> Result<(), TransferError> {
        info!(target, excludes = self.settings.exclusions.len(), "Starting bulk sync");
        let result = CommandRunner::run_with_streaming(
            "rsync",
            "rsync",
            &self.bulk_args(target),
            cancel,
            self.settings.timeout,
        )
        .await
        .map_err(|e| TransferError::from_command("bulk sync", e))?;
        check_rsync(&result, target)
    }

    async fn stream_dir(&self, target: &str, dir: &str, cancel: &CancellationToken) -> Result<(), TransferError> {
        info!(target, dir, "Streaming directory");
        let args = vec![
            "-o".to_string(),
            "pipefail".to_string(),
            "-c".to_string(),
            self.stream_command(target, dir),
        ];
        let label = format!("stream {}", dir);
        let result = CommandRunner::run_with_streaming(&label, "bash", &args, cancel, self.settings.timeout)
            .await
            .map_err(|e| TransferError::from_command(&label, e))?;
        if result.timed_out {
            return Err(TransferError::Timeout(label));
        }
        if !result.status.success() {
            return Err(TransferError::Stream {
                dir: dir.to_string(),
                code: result.code(),
                stderr: result.stderr_summary(),
            });
        }
        Ok(())
    }
}

/// rsync 退出码判定
fn check_rsync(result: &CommandResult, target: &str) -> Result<(), TransferError> {
    if result.timed_out {
        return Err(TransferError::Timeout("bulk sync".to_string()));
    }
    match result.code() {
        Some(0) => {
            info!(target, lines = result.lines, "Bulk sync finished");
            Ok(())
        }
        Some(RSYNC_VANISHED) => {
            warn!(target, "Some source files vanished during bulk sync");
            Ok(())
        }
        code => Err(TransferError::Bulk {
            code,
            stderr: result.stderr_summary(),
        }),
    }
}

#[async_trait]
impl Replicator for TransferEngine {
    async fn clone_to(
        &self,
        target: &str,
        progress: &mut TransferProgress,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        if progress.is_complete(&self.settings.stream_dirs) {
            info!(target, "All transfer layers already complete");
            return Ok(());
        }

        if !progress.bulk_complete {
            self.preserve_identity(target).await;
            progress.bulk_runs += 1;
            self.bulk_sync(target, cancel).await?;
            self.reauthorize(target).await?;
            self.restore_identity(target).await?;
            progress.bulk_complete = true;
        }

        for dir in &self.settings.stream_dirs {
            if progress.streams_complete.contains(dir) {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            if !Path::new(dir).exists() {
                warn!(dir = %dir, "Stream directory missing locally, skipping");
                progress.streams_complete.insert(dir.clone());
                continue;
            }
            progress.stream_runs += 1;
            self.stream_dir(target, dir, cancel).await?;
            progress.streams_complete.insert(dir.clone());
        }

        Ok(())
    }

    async fn verify(&self, target: &str, expected_marker: &str) -> Result<bool, TransferError> {
        if !self.remote.probe(target, self.settings.connect_timeout).await {
            warn!(target, "Target unreachable during verification");
            return Ok(false);
        }

        let command = format!("cat {}", shell_quote(&self.settings.marker_path.to_string_lossy()));
        match self.remote.exec(target, &command, self.settings.verify_timeout).await {
            Ok(output) if output.success() => {
                let matches = output.stdout.trim() == expected_marker;
                if !matches {
                    warn!(target, found = %output.stdout.trim(), "Marker mismatch on target");
                }
                Ok(matches)
            }
            Ok(output) => {
                warn!(target, code = ?output.code, "Marker file missing on target");
                Ok(false)
            }
            Err(e) => {
                warn!(target, error = %e, "Verification command failed");
                Ok(false)
            }
        }
    }

    async fn final_sync(&self, target: &str, cancel: &CancellationToken) -> Result<(), TransferError> {
        for dir in &self.settings.sync_dirs {
            if !dir.exists() {
                continue;
            }
            let local = format!("{}/", dir.to_string_lossy().trim_end_matches('/'));
            let args = vec![
                "-aAXz".to_string(),
                "--partial".to_string(),
                format!("--timeout={}", RSYNC_IO_TIMEOUT_SECS),
                "-e".to_string(),
                self.ssh.transport_command(),
                local.clone(),
                format!("{}:{}", self.ssh.destination(target), local),
            ];
            let result = CommandRunner::run_with_streaming("final-sync", "rsync", &args, cancel, self.settings.timeout)
                .await
                .map_err(|e| TransferError::from_command("final sync", e))?;
            check_rsync(&result, target)?;
            info!(target, dir = %dir.display(), "Final sync of directory finished");
        }
        Ok(())
    }
}
