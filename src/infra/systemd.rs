//! systemd 管理的周期触发器

use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

use super::command::CommandRunner;
use crate::services::supervisor::{Supervisor, SupervisorError};

const SYSTEMCTL_TIMEOUT: Duration = Duration::from_secs(30);

/// 通过 systemctl 启停守护服务
pub struct SystemdSupervisor {
    unit: String,
}

impl SystemdSupervisor {
    pub fn new(unit: impl Into<String>) -> Self {
        Self { unit: unit.into() }
    }

    async fn systemctl(&self, args: &[&str]) -> Result<std::process::Output, SupervisorError> {
        let mut full: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        full.push(self.unit.clone());
        let command = format!("systemctl {}", full.join(" "));
        CommandRunner::run_simple("systemctl", &full, SYSTEMCTL_TIMEOUT)
            .await
            .map_err(|e| SupervisorError::Command {
                command,
                reason: e.to_string(),
            })
    }

    async fn systemctl_ok(&self, args: &[&str]) -> Result<(), SupervisorError> {
        let output = self.systemctl(args).await?;
        if output.status.success() {
            return Ok(());
        }
        Err(SupervisorError::Failed {
            command: format!("systemctl {} {}", args.join(" "), self.unit),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[async_trait]
impl Supervisor for SystemdSupervisor {
    async fn enable(&self) -> Result<(), SupervisorError> {
        self.systemctl_ok(&["enable", "--now"]).await?;
        info!(unit = %self.unit, "Service enabled");
        Ok(())
    }

    async fn disable(&self) -> Result<(), SupervisorError> {
        self.systemctl_ok(&["disable", "--now"]).await?;
        info!(unit = %self.unit, "Service disabled");
        Ok(())
    }

    async fn is_active(&self) -> Result<bool, SupervisorError> {
        // is-active 以退出码表示状态
        let output = self.systemctl(&["is-active", "--quiet"]).await?;
        Ok(output.status.success())
    }
}
