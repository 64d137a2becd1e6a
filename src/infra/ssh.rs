//! 基于 `ssh` 二进制的远程通道
//!
//! 目标机只接受口令时，先用 `sshpass` + `ssh-copy-id` 装上本机公钥，之后全部走密钥。

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::command::{shell_quote, CommandRunner};
use crate::config::{SshConfig, SshPasswords};
use crate::services::remote::{RemoteChannel, RemoteError, RemoteOutput};

/// 探测时远端回显的标记
const PROBE_TOKEN: &str = "HERMIT_OK";

/// 生成本机密钥的超时
const KEYGEN_TIMEOUT: Duration = Duration::from_secs(60);

/// SSH 通道
#[derive(Clone, Debug)]
pub struct SshChannel {
    user: String,
    key_path: PathBuf,
    connect_timeout_secs: u64,
    passwords: SshPasswords,
}

impl SshChannel {
    pub fn new(config: &SshConfig) -> Self {
        Self {
            user: config.user.clone(),
            key_path: config.key_path.clone(),
            connect_timeout_secs: config.connect_timeout_secs,
            passwords: config.passwords.clone(),
        }
    }

    /// ssh 选项（不含目标）
    ///
    /// 目标机重装后主机密钥会变化，因此不记录 known_hosts
    pub fn options(&self) -> Vec<String> {
        vec![
            "-i".to_string(),
            self.key_path.to_string_lossy().to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
        ]
    }

    /// user@host
    pub fn destination(&self, address: &str) -> String {
        format!("{}@{}", self.user, address)
    }

    /// rsync `-e` 使用的 ssh 命令行
    pub fn transport_command(&self) -> String {
        let mut parts = vec!["ssh".to_string()];
        parts.extend(self.options().iter().map(|o| shell_quote(o)));
        parts.join(" ")
    }

    pub fn public_key_path(&self) -> PathBuf {
        let mut path = OsString::from(self.key_path.as_os_str());
        path.push(".pub");
        PathBuf::from(path)
    }

    fn command_args(&self, address: &str, command: &str) -> Vec<String> {
        let mut args = self.options();
        args.push(self.destination(address));
        args.push(command.to_string());
        args
    }

    /// `sshpass -e ssh-copy-id ...` 的参数，口令经 `SSHPASS` 环境变量传入
    fn copy_id_args(&self, address: &str) -> Vec<String> {
        vec![
            "-e".to_string(),
            "ssh-copy-id".to_string(),
            "-i".to_string(),
            self.public_key_path().to_string_lossy().to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            self.destination(address),
        ]
    }

    /// 本机密钥对不完整时补齐
    async fn ensure_local_key(&self) -> Result<(), RemoteError> {
        let public = self.public_key_path();
        if exists(&public).await {
            return Ok(());
        }
        let key_err = |path: &Path, source| RemoteError::LocalKey {
            path: path.to_path_buf(),
            source,
        };

        if exists(&self.key_path).await {
            // 只缺公钥：从私钥导出
            let args = vec![
                "-y".to_string(),
                "-f".to_string(),
                self.key_path.to_string_lossy().to_string(),
            ];
            let output = CommandRunner::run_simple("ssh-keygen", &args, KEYGEN_TIMEOUT).await?;
            check_status(&output)?;
            tokio::fs::write(&public, &output.stdout)
                .await
                .map_err(|e| key_err(&public, e))?;
        } else {
            if let Some(parent) = self.key_path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| key_err(parent, e))?;
            }
            let args = vec![
                "-q".to_string(),
                "-t".to_string(),
                "rsa".to_string(),
                "-b".to_string(),
                "4096".to_string(),
                "-N".to_string(),
                String::new(),
                "-f".to_string(),
                self.key_path.to_string_lossy().to_string(),
            ];
            let output = CommandRunner::run_simple("ssh-keygen", &args, KEYGEN_TIMEOUT).await?;
            check_status(&output)?;
        }
        info!(key = %self.key_path.display(), "Local SSH key prepared");
        Ok(())
    }

    /// 用口令把本机公钥装到目标机
    async fn install_key(
        &self,
        address: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<(), RemoteError> {
        self.ensure_local_key().await?;
        let args = self.copy_id_args(address);
        let output =
            CommandRunner::run_simple_with_env("sshpass", &args, &[("SSHPASS", password)], timeout)
                .await?;
        check_status(&output)?;
        info!(address, "SSH key installed with password");
        Ok(())
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

fn check_status(output: &std::process::Output) -> Result<(), RemoteError> {
    if output.status.success() {
        Ok(())
    } else {
        Err(RemoteError::Failed {
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[async_trait]
impl RemoteChannel for SshChannel {
    async fn probe(&self, address: &str, timeout: Duration) -> bool {
        let args = self.command_args(address, &format!("echo {}", PROBE_TOKEN));
        match CommandRunner::run_simple("ssh", &args, timeout).await {
            Ok(output) => {
                let ok = output.status.success()
                    && String::from_utf8_lossy(&output.stdout).contains(PROBE_TOKEN);
                debug!(address, reachable = ok, "SSH probe finished");
                ok
            }
            Err(e) => {
                debug!(address, error = %e, "SSH probe failed");
                false
            }
        }
    }

    async fn ensure_access(&self, address: &str, timeout: Duration) -> bool {
        if self.probe(address, timeout).await {
            return true;
        }
        let Some(password) = self.passwords.password_for(address) else {
            return false;
        };
        debug!(address, "Key login refused, installing key with password");
        // ssh-copy-id 要登录两次，留足时间
        if let Err(e) = self.install_key(address, password, timeout * 2).await {
            warn!(address, error = %e, "Failed to install SSH key");
            return false;
        }
        self.probe(address, timeout).await
    }

    async fn exec(
        &self,
        address: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<RemoteOutput, RemoteError> {
        debug!(address, command, "Running remote command");
        let args = self.command_args(address, command);
        let output = CommandRunner::run_simple("ssh", &args, timeout).await?;
        Ok(RemoteOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(key_path: PathBuf, passwords: SshPasswords) -> SshConfig {
        SshConfig {
            user: "root".into(),
            key_path,
            connect_timeout_secs: 15,
            passwords,
        }
    }

    fn channel() -> SshChannel {
        SshChannel::new(&config(
            PathBuf::from("/root/.ssh/hermit_crab_id_rsa"),
            SshPasswords::default(),
        ))
    }

    #[test]
    fn test_command_args() {
        let args = channel().command_args("10.0.0.2", "uptime");
        assert_eq!(args[0], "-i");
        assert!(args.contains(&"ConnectTimeout=15".to_string()));
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert_eq!(args[args.len() - 2], "root@10.0.0.2");
        assert_eq!(args[args.len() - 1], "uptime");
    }

    #[test]
    fn test_transport_command() {
        let cmd = channel().transport_command();
        assert!(cmd.starts_with("ssh -i /root/.ssh/hermit_crab_id_rsa"));
        assert!(cmd.contains("-o StrictHostKeyChecking=no"));
    }

    #[test]
    fn test_copy_id_args_keep_password_out_of_argv() {
        let passwords = SshPasswords::parse(Some("hunter2"), None).unwrap();
        let channel = SshChannel::new(&config(
            PathBuf::from("/root/.ssh/hermit_crab_id_rsa"),
            passwords,
        ));

        let args = channel.copy_id_args("10.0.0.2");
        assert_eq!(args[0], "-e");
        assert_eq!(args[1], "ssh-copy-id");
        assert!(args.contains(&"/root/.ssh/hermit_crab_id_rsa.pub".to_string()));
        assert!(!args.contains(&"BatchMode=yes".to_string()));
        assert_eq!(args.last().unwrap(), "root@10.0.0.2");
        assert!(args.iter().all(|a| !a.contains("hunter2")));
    }

    #[tokio::test]
    async fn test_no_password_means_no_key_install() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("keys/id_rsa");
        let channel = SshChannel::new(&config(key.clone(), SshPasswords::default()));

        // 保留地址不可达；没有口令时不生成本机密钥
        assert!(
            !channel
                .ensure_access("192.0.2.1", Duration::from_secs(2))
                .await
        );
        assert!(!key.exists());
    }

    #[tokio::test]
    async fn test_complete_key_pair_left_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("id_rsa");
        let channel = SshChannel::new(&config(key.clone(), SshPasswords::default()));

        tokio::fs::write(&key, "private").await.unwrap();
        tokio::fs::write(channel.public_key_path(), "ssh-rsa AAAA test")
            .await
            .unwrap();
        channel.ensure_local_key().await.unwrap();
        assert_eq!(
            tokio::fs::read_to_string(channel.public_key_path())
                .await
                .unwrap(),
            "ssh-rsa AAAA test"
        );
    }
}
