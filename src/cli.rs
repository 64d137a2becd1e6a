//! 命令行入口
//!
//! 每个子命令都从环境变量加载配置，结果打印到 stdout

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use clap::{ArgGroup, Args, Parser, Subcommand};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::domain::{LeaseClass, LeaseStatus, Node};
use crate::error::{exit_code, AgentError};
use crate::services::daemon::{self, DaemonExit};
use crate::services::guard::InstanceGuard;
use crate::services::orchestrator::{MigrationRequest, OrchestratorError};
use crate::services::registry::RegistryError;
use crate::state::AgentState;

#[derive(Debug, Parser)]
#[command(
    name = "hermit-crab",
    version,
    about = "Keeps a service alive across a chain of short-lived hosts"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// 初始化本机租期
    Init {
        /// 本机对外地址（默认 HERMIT_CURRENT_ADDRESS）
        #[arg(long)]
        address: Option<String>,
        /// 租期起点（RFC 3339 或 YYYY-MM-DD，默认现在）
        #[arg(long, value_parser = parse_timestamp)]
        added_at: Option<DateTime<Utc>>,
    },
    /// 向节点池添加空闲主机
    Add {
        #[arg(long)]
        address: String,
        #[arg(long)]
        domain: Option<String>,
        #[arg(long, default_value = "")]
        notes: String,
        #[arg(long, value_parser = parse_timestamp)]
        added_at: Option<DateTime<Utc>>,
    },
    /// 从节点池删除主机（地址或节点 ID）
    Remove {
        #[arg(long)]
        address: String,
    },
    /// 列出节点池
    List {
        #[arg(long)]
        json: bool,
    },
    /// 本机租期状态
    Status {
        #[arg(long)]
        json: bool,
    },
    /// 评估租期，必要时发送预警
    Check {
        /// 先同步节点池
        #[arg(long)]
        sync: bool,
    },
    /// 执行迁移
    Migrate(MigrateArgs),
    /// 启用周期触发
    Start,
    /// 停用周期触发
    Stop,
    /// 前台运行守护循环
    Daemon,
    /// 在目标机上接管租期（迁移收尾时远程调用）
    #[command(hide = true)]
    Adopt {
        #[arg(long)]
        node_id: String,
    },
}

#[derive(Args)]
#[command(group(ArgGroup::new("selection").args(["target", "auto"])))]
pub struct MigrateArgs {
    /// 指定目标地址或节点 ID
    #[arg(long)]
    pub target: Option<String>,
    /// 自动选择目标（默认）
    #[arg(long)]
    pub auto: bool,
    /// 忽略租期阈值与最小收益
    #[arg(long)]
    pub force: bool,
    /// 目标机 SSH 口令，仅用于安装密钥；优先于 HERMIT_SSH_PASSWORD*
    #[arg(long)]
    pub password: Option<String>,
}

impl std::fmt::Debug for MigrateArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrateArgs")
            .field("target", &self.target)
            .field("auto", &self.auto)
            .field("force", &self.force)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// 解析 RFC 3339 或日期（UTC 零点）
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| Utc.from_utc_datetime(&dt))
        .ok_or_else(|| format!("expected RFC 3339 timestamp or YYYY-MM-DD, got {:?}", value))
}

/// 加载配置并执行命令，返回退出码
pub async fn execute(cli: Cli, cancel: CancellationToken) -> Result<i32, AgentError> {
    let mut config = AgentConfig::from_env()?;
    apply_overrides(&mut config, &cli.command);
    let state = Arc::new(AgentState::from_config(config).await?);
    run_command(state, cli.command, cancel).await
}

/// 命令行参数覆盖环境配置
fn apply_overrides(config: &mut AgentConfig, command: &Command) {
    if let Command::Migrate(MigrateArgs {
        password: Some(password),
        ..
    }) = command
    {
        config.ssh.passwords = std::mem::take(&mut config.ssh.passwords).with_override(password.as_str());
    }
}

/// 在已装配的状态上执行命令
pub async fn run_command(
    state: Arc<AgentState>,
    command: Command,
    cancel: CancellationToken,
) -> Result<i32, AgentError> {
    let now = Utc::now();
    match command {
        Command::Init { address, added_at } => {
            let domain = state.config.require_domain()?.to_string();
            let address = address.or_else(|| state.config.address.clone());
            let lease = state
                .lease
                .init(&domain, added_at.unwrap_or(now), address, now)
                .await?;
            println!(
                "lease initialized for {}: expires {} ({} days)",
                lease.domain,
                lease.expires_at.to_rfc3339(),
                lease.lease_days
            );
        }

        Command::Add {
            address,
            domain,
            notes,
            added_at,
        } => {
            let node = Node::new(
                address,
                domain.unwrap_or_default(),
                added_at.unwrap_or(now),
                chrono::Duration::days(state.config.lease.total_days),
                notes,
            );
            let node = state.registry.add(node, now).await?;
            push_best_effort(&state).await;
            println!("added {} ({}), expires {}", node.id, node.address, node.expires_at.to_rfc3339());
        }

        Command::Remove { address } => {
            let id = match state.registry.find_by_address(&address).await {
                Some(node) => node.id,
                None => address,
            };
            let removed = state.registry.remove(&id, now).await?;
            println!("removed {} ({})", removed.id, removed.address);
        }

        Command::List { json } => {
            let nodes: Vec<Node> = state.registry.list().await.collect();
            if json {
                println!("{}", to_json(&nodes)?);
            } else if nodes.is_empty() {
                println!("node pool is empty");
            } else {
                println!(
                    "{:<28} {:<20} {:<13} {:>9}  {}",
                    "ID", "ADDRESS", "STATUS", "REMAINING", "EXPIRES"
                );
                for node in &nodes {
                    println!("{}", format_node_row(node, now));
                }
            }
        }

        Command::Status { json } => {
            let status = state.lease.status(now).await?;
            if json {
                println!("{}", to_json(&status)?);
            } else {
                print_status(&status);
                let trigger = match state.supervisor.is_active().await {
                    Ok(true) => "active",
                    Ok(false) => "inactive",
                    Err(_) => "unknown",
                };
                println!("periodic trigger: {}", trigger);
            }
        }

        Command::Check { sync } => {
            if sync {
                match state.registry.sync(now).await {
                    Ok(report) => info!(nodes = report.nodes, attempts = report.attempts, "Registry synced"),
                    Err(e) => warn!(error = %e, "Registry sync failed, using local copy"),
                }
            }
            let status = state.lease.status(now).await?;
            print_status(&status);
            if status.classification != LeaseClass::Healthy {
                let event = daemon::lease_warning(&state, &status).await;
                state.notifier.notify(&event).await;
            }
        }

        Command::Migrate(args) => return migrate(&state, args, cancel).await,

        Command::Start => {
            state.supervisor.enable().await?;
            println!("periodic trigger enabled ({})", state.config.daemon.service_unit);
        }

        Command::Stop => {
            state.supervisor.disable().await?;
            println!("periodic trigger disabled ({})", state.config.daemon.service_unit);
        }

        Command::Daemon => {
            let exit = daemon::run(state.clone(), cancel).await?;
            if exit == DaemonExit::Migrated {
                println!("service migrated away; this host is retired");
            }
        }

        Command::Adopt { node_id } => {
            let node = state
                .registry
                .get(&node_id)
                .await
                .ok_or_else(|| RegistryError::NotFound(node_id.clone()))?;
            let lease = state.lease.adopt(&node, now).await?;
            println!(
                "adopted lease of {}: expires {}",
                node_id,
                lease.expires_at.to_rfc3339()
            );
        }
    }
    Ok(exit_code::OK)
}

async fn migrate(state: &AgentState, args: MigrateArgs, cancel: CancellationToken) -> Result<i32, AgentError> {
    let _guard = InstanceGuard::acquire(state.config.pid_file())?;
    let request = MigrationRequest {
        target: args.target,
        force: args.force,
    };

    let result = state.orchestrator().run(request, cancel).await;
    match result {
        Ok(session) => {
            println!(
                "migration {} completed: {} now serves {}",
                session.id,
                session.target_address().unwrap_or_default(),
                state.lease.load().await.map(|l| l.domain).unwrap_or_default()
            );
            *state.last_session.write().await = Some(session);
            Ok(exit_code::OK)
        }
        Err(failure) => {
            *state.last_session.write().await = Some((*failure.session).clone());
            if let OrchestratorError::NotNeeded { remaining_days } = failure.error {
                println!("migration not needed: {} days remaining (use --force to override)", remaining_days);
                return Ok(exit_code::OK);
            }
            Err(failure.into())
        }
    }
}

async fn push_best_effort(state: &AgentState) {
    if let Err(e) = state.registry.sync(Utc::now()).await {
        warn!(error = %e, "Registry push failed, will retry on next sync");
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, AgentError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| AgentError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

fn format_node_row(node: &Node, now: DateTime<Utc>) -> String {
    let remaining = if node.is_expired(now) {
        "expired".to_string()
    } else {
        format!("{}d", node.remaining_days(now))
    };
    format!(
        "{:<28} {:<20} {:<13} {:>9}  {}",
        node.id,
        node.address,
        node.status.as_str(),
        remaining,
        node.expires_at.format("%Y-%m-%d %H:%M")
    )
}

fn print_status(status: &LeaseStatus) {
    println!("domain:          {}", status.domain);
    if let Some(address) = &status.address {
        println!("address:         {}", address);
    }
    println!("expires:         {}", status.expires_at.to_rfc3339());
    println!("remaining:       {} days", status.remaining_days);
    println!("classification:  {}", status.classification.as_str());
    println!("needs migration: {}", if status.needs_migration { "yes" } else { "no" });
    println!("migrations:      {}", status.migrations);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NodeStatus;
    use std::collections::HashMap;

    async fn state(dir: &std::path::Path) -> Arc<AgentState> {
        let mut vars = HashMap::new();
        vars.insert(
            "HERMIT_INSTALL_PATH".to_string(),
            dir.to_string_lossy().to_string(),
        );
        vars.insert("HERMIT_CURRENT_DOMAIN".to_string(), "svc.example.com".to_string());
        vars.insert("HERMIT_EXCLUDE_PATHS".to_string(), "/proc,/sys".to_string());
        let config = AgentConfig::from_vars(&vars).unwrap();
        Arc::new(AgentState::from_config(config).await.unwrap())
    }

    #[test]
    fn test_parse_timestamp() {
        let ts = parse_timestamp("2024-03-01T12:00:00Z").unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-03-01T12:00:00+00:00");
        let day = parse_timestamp("2024-03-01").unwrap();
        assert_eq!(day.to_rfc3339(), "2024-03-01T00:00:00+00:00");
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_migrate_target_and_auto_conflict() {
        assert!(Cli::try_parse_from(["hermit-crab", "migrate", "--target", "10.0.0.2", "--auto"]).is_err());
        let cli = Cli::try_parse_from(["hermit-crab", "migrate", "--target", "10.0.0.2", "--force"]).unwrap();
        match cli.command {
            Command::Migrate(args) => {
                assert_eq!(args.target.as_deref(), Some("10.0.0.2"));
                assert!(args.force);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_migrate_password_overrides_env() {
        let cli = Cli::try_parse_from(["hermit-crab", "migrate", "--auto", "--password", "typed"]).unwrap();
        assert!(!format!("{:?}", cli.command).contains("typed"));

        let dir = tempfile::tempdir().unwrap();
        let mut vars = HashMap::new();
        vars.insert(
            "HERMIT_INSTALL_PATH".to_string(),
            dir.path().to_string_lossy().to_string(),
        );
        vars.insert("HERMIT_EXCLUDE_PATHS".to_string(), "/proc".to_string());
        vars.insert("HERMIT_SSH_PASSWORD_MAP".to_string(), "10.0.0.2:mapped".to_string());
        let mut config = AgentConfig::from_vars(&vars).unwrap();
        assert_eq!(config.ssh.passwords.password_for("10.0.0.2"), Some("mapped"));

        apply_overrides(&mut config, &cli.command);
        assert_eq!(config.ssh.passwords.password_for("10.0.0.2"), Some("typed"));
        assert_eq!(config.ssh.passwords.password_for("10.0.0.3"), Some("typed"));
    }

    #[test]
    fn test_adopt_is_hidden_but_parses() {
        let cli = Cli::try_parse_from(["hermit-crab", "adopt", "--node-id", "node-10-0-0-2"]).unwrap();
        assert!(matches!(cli.command, Command::Adopt { .. }));
    }

    #[tokio::test]
    async fn test_add_remove_and_adopt() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path()).await;
        let cancel = CancellationToken::new();

        let add = Command::Add {
            address: "10.0.0.2".into(),
            domain: None,
            notes: "spare".into(),
            added_at: None,
        };
        assert_eq!(run_command(state.clone(), add, cancel.clone()).await.unwrap(), 0);
        let node = state.registry.find_by_address("10.0.0.2").await.unwrap();
        assert_eq!(node.status, NodeStatus::Idle);
        assert_eq!(node.remaining_days(Utc::now()), 14);

        let adopt = Command::Adopt {
            node_id: node.id.clone(),
        };
        run_command(state.clone(), adopt, cancel.clone()).await.unwrap();
        let lease = state.lease.load().await.unwrap();
        assert_eq!(lease.node_id.as_deref(), Some(node.id.as_str()));
        assert_eq!(lease.expires_at, node.expires_at);

        let remove = Command::Remove {
            address: "10.0.0.2".into(),
        };
        run_command(state.clone(), remove, cancel.clone()).await.unwrap();
        assert!(state.registry.get(&node.id).await.is_none());

        let missing = Command::Remove {
            address: "10.0.0.2".into(),
        };
        let err = run_command(state.clone(), missing, cancel).await.unwrap_err();
        assert!(matches!(err, AgentError::Registry(RegistryError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_migrate_healthy_lease_exits_zero() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path()).await;
        let cancel = CancellationToken::new();

        let init = Command::Init {
            address: Some("10.0.0.1".into()),
            added_at: None,
        };
        run_command(state.clone(), init, cancel.clone()).await.unwrap();

        let migrate = Command::Migrate(MigrateArgs {
            target: None,
            auto: true,
            force: false,
            password: None,
        });
        assert_eq!(run_command(state.clone(), migrate, cancel).await.unwrap(), 0);
        let session = state.last_session.read().await.clone().unwrap();
        assert!(session.phase.is_terminal());
    }

    #[tokio::test]
    async fn test_migrate_empty_pool_is_no_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path()).await;
        let cancel = CancellationToken::new();
        let now = Utc::now();
        state
            .lease
            .init("svc.example.com", now - chrono::Duration::days(12), None, now)
            .await
            .unwrap();

        let migrate = Command::Migrate(MigrateArgs {
            target: None,
            auto: false,
            force: false,
            password: None,
        });
        let err = run_command(state, migrate, cancel).await.unwrap_err();
        assert_eq!(err.exit_code(), exit_code::NO_CANDIDATE);
    }
}
