//! Agent 运行时状态
//!
//! 按配置装配各协作者：节点池与锁走 GitHub 或本地，DNS 走 Cloudflare 或人工，
//! 通知走 Resend 或日志

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::domain::{LeaseClass, LeaseState, MigrationSession, Registry};
use crate::error::AgentError;
use crate::infra::{
    CloudflareDns, GitHubClient, GitHubLockService, GitHubRegistryBackend, ResendNotifier,
    SshChannel, SystemdSupervisor,
};
use crate::services::dns::{DnsUpdater, ManualDns};
use crate::services::lease::LeaseTracker;
use crate::services::lock::{local_holder_id, LockCoordinator, LockService, MemoryLockService};
use crate::services::notify::{LogNotifier, Notifier};
use crate::services::orchestrator::{Collaborators, MigrationOrchestrator, OrchestratorSettings};
use crate::services::persistence::JsonFileStore;
use crate::services::registry::{LocalOnlyBackend, NodeRegistry, RegistryBackend};
use crate::services::remote::RemoteChannel;
use crate::services::supervisor::Supervisor;
use crate::services::transfer::{Replicator, TransferEngine, TransferSettings};

/// Agent 状态
pub struct AgentState {
    pub config: AgentConfig,
    /// 进程启动时间
    pub started_at: DateTime<Utc>,

    // ========== 本地状态 ==========
    pub lease: Arc<LeaseTracker>,
    pub registry: Arc<NodeRegistry>,

    // ========== 协作者 ==========
    pub locks: LockCoordinator,
    pub remote: Arc<dyn RemoteChannel>,
    pub replicator: Arc<dyn Replicator>,
    pub dns: Arc<dyn DnsUpdater>,
    pub notifier: Arc<dyn Notifier>,
    pub supervisor: Arc<dyn Supervisor>,

    // ========== 守护进程观测 ==========
    /// 最近一次迁移会话
    pub last_session: RwLock<Option<MigrationSession>>,
    /// 最近一次检查时间
    pub last_check: RwLock<Option<DateTime<Utc>>>,
    /// 最近一次租期健康等级
    pub last_class: RwLock<Option<LeaseClass>>,
}

impl AgentState {
    /// 按配置装配
    pub async fn from_config(config: AgentConfig) -> Result<Self, AgentError> {
        let lease = Arc::new(LeaseTracker::new(
            Arc::new(JsonFileStore::<LeaseState>::new(config.lease_file())),
            config.lease.total_days,
            config.thresholds(),
        ));

        let (registry_backend, lock_service): (Arc<dyn RegistryBackend>, Arc<dyn LockService>) =
            match &config.github {
                Some(github) => {
                    let client = GitHubClient::new(github)?;
                    info!(repo = %github.repo, file = %github.nodes_file, "Using GitHub registry and locks");
                    (
                        Arc::new(GitHubRegistryBackend::new(client.clone(), github.nodes_file.clone())),
                        Arc::new(GitHubLockService::new(client)),
                    )
                }
                None => {
                    warn!("No shared registry configured, locks only guard this host");
                    (Arc::new(LocalOnlyBackend), Arc::new(MemoryLockService::new()))
                }
            };

        let registry = Arc::new(
            NodeRegistry::open(
                Arc::new(JsonFileStore::<Registry>::new(config.registry_file())),
                registry_backend,
                chrono::Duration::days(config.lease.tombstone_retention_days),
            )
            .await?,
        );

        let dns: Arc<dyn DnsUpdater> = match &config.cloudflare {
            Some(cf) => Arc::new(CloudflareDns::new(cf)?),
            None => Arc::new(ManualDns),
        };

        let notifier: Arc<dyn Notifier> = match &config.notification {
            Some(n) => Arc::new(ResendNotifier::new(n.clone())?),
            None => Arc::new(LogNotifier),
        };

        let ssh = SshChannel::new(&config.ssh);
        let remote: Arc<dyn RemoteChannel> = Arc::new(ssh.clone());
        let replicator: Arc<dyn Replicator> = Arc::new(TransferEngine::new(
            TransferSettings::from_config(&config),
            ssh,
            remote.clone(),
        ));

        let supervisor: Arc<dyn Supervisor> =
            Arc::new(SystemdSupervisor::new(config.daemon.service_unit.clone()));

        info!(
            install_path = %config.install_path.display(),
            domain = ?config.domain,
            registry = registry.backend_name(),
            dns = if config.cloudflare.is_some() { "cloudflare" } else { "manual" },
            notifications = config.notification.is_some(),
            exclusions = config.transfer.exclusions.len(),
            "Loaded configuration"
        );

        Ok(Self {
            started_at: Utc::now(),
            lease,
            registry,
            locks: LockCoordinator::new(lock_service, local_holder_id()),
            remote,
            replicator,
            dns,
            notifier,
            supervisor,
            last_session: RwLock::new(None),
            last_check: RwLock::new(None),
            last_class: RwLock::new(None),
            config,
        })
    }

    /// 构造一次迁移用的编排器
    pub fn orchestrator(&self) -> MigrationOrchestrator {
        MigrationOrchestrator::new(
            OrchestratorSettings::from_config(&self.config),
            Collaborators {
                lease: self.lease.clone(),
                registry: self.registry.clone(),
                locks: self.locks.clone(),
                replicator: self.replicator.clone(),
                remote: self.remote.clone(),
                dns: self.dns.clone(),
                notifier: self.notifier.clone(),
            },
        )
    }
}
