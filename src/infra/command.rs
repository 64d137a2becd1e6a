//! 命令执行器
//!
//! 提供统一的命令执行接口，支持：
//! - 输出逐行写入 tracing
//! - 超时控制
//! - 取消支持（终止子进程）

use std::collections::VecDeque;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// stderr 尾部保留行数，用于错误信息
const STDERR_TAIL_LINES: usize = 20;

/// 每隔多少行输出一次进度
const PROGRESS_EVERY_LINES: usize = 500;

/// 命令执行器
pub struct CommandRunner;

/// 命令执行错误
#[derive(Debug)]
pub enum CommandError {
    /// 命令启动失败
    SpawnFailed(std::io::Error),
    /// 命令超时
    Timeout,
    /// 命令被取消
    Cancelled,
    /// 等待命令完成失败
    WaitFailed(std::io::Error),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::SpawnFailed(e) => write!(f, "Failed to spawn command: {}", e),
            CommandError::Timeout => write!(f, "Command timed out"),
            CommandError::Cancelled => write!(f, "Command was cancelled"),
            CommandError::WaitFailed(e) => write!(f, "Failed to wait for command: {}", e),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::SpawnFailed(e) | CommandError::WaitFailed(e) => Some(e),
            _ => None,
        }
    }
}

/// 命令执行结果
#[derive(Debug)]
pub struct CommandResult {
    /// 退出状态
    pub status: ExitStatus,
    /// 是否因超时而终止
    pub timed_out: bool,
    /// 输出总行数
    pub lines: usize,
    /// stderr 最后若干行
    pub stderr_tail: Vec<String>,
}

impl CommandResult {
    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }

    pub fn stderr_summary(&self) -> String {
        self.stderr_tail.join("\n")
    }
}

/// 逐行读取输出
async fn pump<R: AsyncRead + Unpin>(
    reader: R,
    label: String,
    stream: &'static str,
    counter: Arc<Mutex<usize>>,
    tail: Option<Arc<Mutex<VecDeque<String>>>>,
) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let count = {
            let mut c = counter.lock().await;
            *c += 1;
            *c
        };
        debug!(command = %label, stream, "{}", line);
        if count % PROGRESS_EVERY_LINES == 0 {
            debug!(command = %label, lines = count, "Command still running");
        }
        if let Some(tail) = &tail {
            let mut t = tail.lock().await;
            if t.len() == STDERR_TAIL_LINES {
                t.pop_front();
            }
            t.push_back(line);
        }
    }
}

impl CommandRunner {
    /// 执行命令并流式输出日志
    ///
    /// # Arguments
    /// * `label` - 日志中的命令标识
    /// * `program` - 要执行的程序
    /// * `args` - 命令行参数
    /// * `cancel` - 取消令牌
    /// * `timeout` - 超时时间
    pub async fn run_with_streaming(
        label: &str,
        program: &str,
        args: &[String],
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<CommandResult, CommandError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(CommandError::SpawnFailed)?;

        let counter = Arc::new(Mutex::new(0usize));
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));

        let stdout_task = child.stdout.take().map(|out| {
            tokio::spawn(pump(out, label.to_string(), "stdout", counter.clone(), None))
        });
        let stderr_task = child.stderr.take().map(|err| {
            tokio::spawn(pump(
                err,
                label.to_string(),
                "stderr",
                counter.clone(),
                Some(tail.clone()),
            ))
        });

        // 等待命令完成，支持超时和取消
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                warn!(command = %label, "Command cancelled, killing process");
                let _ = child.kill().await;
                Err(CommandError::Cancelled)
            }
            _ = tokio::time::sleep(timeout) => {
                error!(command = %label, timeout_secs = timeout.as_secs(), "Command timed out");
                let _ = child.kill().await;
                // 等待进程实际终止
                child.wait().await.map_err(CommandError::WaitFailed).map(|s| (s, true))
            }
            status = child.wait() => {
                status.map_err(CommandError::WaitFailed).map(|s| (s, false))
            }
        };

        // 等待日志读取完成
        if let Some(task) = stdout_task {
            let _ = task.await;
        }
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        let (status, timed_out) = result?;
        let lines = *counter.lock().await;
        let stderr_tail = tail.lock().await.iter().cloned().collect();
        Ok(CommandResult {
            status,
            timed_out,
            lines,
            stderr_tail,
        })
    }

    /// 执行简单命令（无流式输出）
    pub async fn run_simple(
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<std::process::Output, CommandError> {
        Self::run_simple_with_env(program, args, &[], timeout).await
    }

    /// 同 [`run_simple`](Self::run_simple)，附加环境变量
    ///
    /// 口令之类的敏感值经环境变量传入，不出现在进程参数里
    pub async fn run_simple_with_env(
        program: &str,
        args: &[String],
        envs: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<std::process::Output, CommandError> {
        let child = Command::new(program)
            .args(args)
            .envs(envs.iter().copied())
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output();

        tokio::select! {
            result = child => {
                result.map_err(CommandError::SpawnFailed)
            }
            _ = tokio::time::sleep(timeout) => {
                Err(CommandError::Timeout)
            }
        }
    }
}

/// shell 单引号转义
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-=:@,+_".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}
