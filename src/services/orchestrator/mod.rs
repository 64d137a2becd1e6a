//! 迁移编排器
//!
//! 按 Selecting → Locking → Cloning → Verifying → CuttingOver → Bootstrapping 推进一次迁移。
//! 切换之前的任何失败都会释放锁并把目标节点退回 idle；切换之后只记录错误、通知人工处理，不回滚。


use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dns::DnsUpdater;
use super::lease::{LeaseError, LeaseTracker};
use super::lock::{LockCoordinator, LockError};
use super::notify::{MigrationEvent, Notifier};
use super::registry::{NodeRegistry, RegistryError};
use super::remote::RemoteChannel;
use super::transfer::{Replicator, TransferError};
use crate::config::constants::DNS_TIMEOUT_SECS;
use crate::config::{AgentConfig, RetireMode};
use crate::domain::{
    InvalidTransition, MigrationPhase, MigrationRecord, MigrationSession, Node, NodeStatus,
};
use crate::infra::command::shell_quote;

/// 重启后首次探测前的等待
const REBOOT_GRACE: Duration = Duration::from_secs(15);
/// 等待目标上线的探测间隔
const ONLINE_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// 远程 adopt/start 命令超时
const REMOTE_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);
/// 克隆重试退避上限倍数（2^6）
const MAX_BACKOFF_SHIFT: u32 = 6;

/// 编排错误
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("migration not needed: {remaining_days} days of lease remain")]
    NotNeeded { remaining_days: i64 },
    #[error("no eligible migration target in the pool")]
    NoCandidate,
    #[error("target {0} is not an idle, unexpired pool node")]
    TargetUnavailable(String),
    #[error("target {0} is unreachable")]
    TargetUnreachable(String),
    #[error("gave up after {0} lock attempts")]
    LockAttemptsExhausted(u32),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("transfer failed after {attempts} attempts: {last}")]
    TransferExhausted { attempts: u32, last: String },
    #[error("transfer failed: {0}")]
    Transfer(TransferError),
    #[error("verification failed on {0}")]
    VerificationFailed(String),
    #[error("dns cutover failed: {0}")]
    Cutover(String),
    #[error("bootstrap incomplete: {0}")]
    Bootstrap(String),
    #[error("migration aborted by operator")]
    Aborted,
    #[error("cannot write migration marker {}: {source}", .path.display())]
    Marker {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Lease(#[from] LeaseError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

/// 带会话快照的失败结果
#[derive(Debug, Error)]
#[error("migration {} failed in {phase}: {error}", .session.id)]
pub struct MigrationFailure {
    /// 出错时所处阶段
    pub phase: MigrationPhase,
    pub session: Box<MigrationSession>,
    #[source]
    pub error: OrchestratorError,
}

/// 迁移请求
#[derive(Clone, Debug, Default)]
pub struct MigrationRequest {
    /// 指定目标（地址或节点 ID）
    pub target: Option<String>,
    /// 忽略租期阈值与最小收益
    pub force: bool,
}

/// 编排参数
#[derive(Clone, Debug)]
pub struct OrchestratorSettings {
    pub lock_ttl_secs: u64,
    /// 长耗时步骤期间的续租周期，须小于 TTL
    pub renew_interval: Duration,
    pub max_lock_attempts: u32,
    pub transfer_attempts: u32,
    pub retry_backoff: Duration,
    pub probe_retries: u32,
    pub probe_backoff: Duration,
    pub connect_timeout: Duration,
    pub dns_timeout: Duration,
    pub minimum_gain_days: i64,
    pub retire_mode: RetireMode,
    pub retired_record: Option<String>,
    pub reboot_target: bool,
    pub startup_wait: Duration,
    pub agent_bin: String,
    pub marker_path: PathBuf,
}

impl OrchestratorSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        let migration = &config.migration;
        Self {
            lock_ttl_secs: migration.lock_ttl_secs,
            renew_interval: renew_interval_for(migration.lock_ttl_secs),
            max_lock_attempts: migration.max_lock_attempts.max(1),
            transfer_attempts: migration.max_retries.max(1),
            retry_backoff: Duration::from_secs(migration.retry_interval_secs),
            probe_retries: migration.probe_retries,
            probe_backoff: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(config.ssh.connect_timeout_secs),
            dns_timeout: Duration::from_secs(DNS_TIMEOUT_SECS),
            minimum_gain_days: config.lease.minimum_gain_days,
            retire_mode: migration.retire_mode,
            retired_record: config
                .cloudflare
                .as_ref()
                .and_then(|cf| cf.retired_record.clone()),
            reboot_target: !migration.skip_reboot,
            startup_wait: Duration::from_secs(migration.startup_wait_secs),
            agent_bin: migration.agent_bin.clone(),
            marker_path: config.marker_file(),
        }
    }
}

/// 编排器依赖的协作者
pub struct Collaborators {
    pub lease: Arc<LeaseTracker>,
    pub registry: Arc<NodeRegistry>,
    pub locks: LockCoordinator,
    pub replicator: Arc<dyn Replicator>,
    pub remote: Arc<dyn RemoteChannel>,
    pub dns: Arc<dyn DnsUpdater>,
    pub notifier: Arc<dyn Notifier>,
}

/// 候选节点排序
///
/// 过滤：idle、未过期、未排除、不是源主机、剩余天数达到下限（若给出）。
/// 排序：剩余租期降序，相同时按 ID 升序。
pub fn rank_candidates(
    nodes: impl IntoIterator<Item = Node>,
    now: DateTime<Utc>,
    excluded: &BTreeSet<String>,
    source_id: Option<&str>,
    source_address: Option<&str>,
    min_remaining_days: Option<i64>,
) -> Vec<Node> {
    let mut candidates: Vec<Node> = nodes
        .into_iter()
        .filter(|n| n.status == NodeStatus::Idle)
        .filter(|n| !n.is_expired(now))
        .filter(|n| !excluded.contains(&n.id))
        .filter(|n| Some(n.id.as_str()) != source_id)
        .filter(|n| Some(n.address.as_str()) != source_address)
        .filter(|n| min_remaining_days.map_or(true, |min| n.remaining_days(now) >= min))
        .collect();

    candidates.sort_by(|a, b| {
        b.remaining(now)
            .cmp(&a.remaining(now))
            .then_with(|| a.id.cmp(&b.id))
    });
    candidates
}

/// 续租周期：TTL 的三分之一
pub fn renew_interval_for(lock_ttl_secs: u64) -> Duration {
    Duration::from_secs(lock_ttl_secs) / 3
}

fn check_cancel(cancel: &CancellationToken) -> Result<(), OrchestratorError> {
    if cancel.is_cancelled() {
        Err(OrchestratorError::Aborted)
    } else {
        Ok(())
    }
}

/// 迁移编排器
pub struct MigrationOrchestrator {
    settings: OrchestratorSettings,
    lease: Arc<LeaseTracker>,
    registry: Arc<NodeRegistry>,
    locks: LockCoordinator,
    replicator: Arc<dyn Replicator>,
    remote: Arc<dyn RemoteChannel>,
    dns: Arc<dyn DnsUpdater>,
    notifier: Arc<dyn Notifier>,
}

impl MigrationOrchestrator {
    pub fn new(settings: OrchestratorSettings, collaborators: Collaborators) -> Self {
        let Collaborators {
            lease,
            registry,
            locks,
            replicator,
            remote,
            dns,
            notifier,
        } = collaborators;
        Self {
            settings,
            lease,
            registry,
            locks,
            replicator,
            remote,
            dns,
            notifier,
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// 执行一次迁移
    pub async fn run(
        &self,
        request: MigrationRequest,
        cancel: CancellationToken,
    ) -> Result<MigrationSession, MigrationFailure> {
        let now = Utc::now();
        let lease = match self.lease.load().await {
            Ok(lease) => lease,
            Err(e) => {
                let mut session = MigrationSession::new(None, None, now);
                let phase = session.phase;
                session.finish_with_error(e.to_string(), false, now);
                return Err(MigrationFailure {
                    phase,
                    session: Box::new(session),
                    error: e.into(),
                });
            }
        };

        let mut session = MigrationSession::new(lease.node_id.clone(), lease.address.clone(), now);
        let source_remaining = lease.remaining_days(now);
        info!(
            session = %session.id,
            source = %source_label(&session),
            domain = %lease.domain,
            remaining_days = source_remaining,
            target = ?request.target,
            force = request.force,
            "Migration started"
        );

        match self
            .drive(&mut session, &request, &lease.domain, source_remaining, &cancel)
            .await
        {
            Ok(()) => {
                info!(
                    session = %session.id,
                    target = session.target_address().unwrap_or_default(),
                    "Migration completed"
                );
                Ok(session)
            }
            Err(error) => {
                let phase = session.phase;
                self.handle_failure(&mut session, &error, source_remaining).await;
                Err(MigrationFailure {
                    phase,
                    session: Box::new(session),
                    error,
                })
            }
        }
    }

    async fn drive(
        &self,
        session: &mut MigrationSession,
        request: &MigrationRequest,
        domain: &str,
        source_remaining: i64,
        cancel: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        session.enter(MigrationPhase::Selecting, Utc::now())?;
        if !request.force && !self.lease.thresholds().needs_migration(source_remaining) {
            return Err(OrchestratorError::NotNeeded {
                remaining_days: source_remaining,
            });
        }

        let target = self.select_and_lock(session, request, source_remaining, cancel).await?;
        session.target = Some(target.clone());

        // 锁持有期间目标标记为 transferring
        self.registry
            .set_status(&target.id, NodeStatus::Transferring, Utc::now())
            .await?;
        self.push_registry("lock").await;
        self.notifier
            .notify(&MigrationEvent::Started {
                source: source_label(session),
                target: target.address.clone(),
                remaining_days: source_remaining,
            })
            .await;

        session.enter(MigrationPhase::Cloning, Utc::now())?;
        self.write_marker(session).await?;
        self.clone_with_retries(session, cancel).await?;

        session.enter(MigrationPhase::Verifying, Utc::now())?;
        if !self.verify_holding(session, cancel).await? {
            warn!(session = %session.id, target = %target.address, "Verification failed, recloning once");
            session.reclones += 1;
            session.enter(MigrationPhase::Cloning, Utc::now())?;
            session.progress.reset();
            self.clone_with_retries(session, cancel).await?;

            session.enter(MigrationPhase::Verifying, Utc::now())?;
            if !self.verify_holding(session, cancel).await? {
                return Err(OrchestratorError::VerificationFailed(target.address.clone()));
            }
        }
        session.verified = true;

        // 切换前最后一次可取消点
        check_cancel(cancel)?;
        self.locks.renew(&target.id, self.settings.lock_ttl_secs).await?;

        session.enter(MigrationPhase::CuttingOver, Utc::now())?;
        self.cutover(session, domain).await?;

        session.enter(MigrationPhase::Bootstrapping, Utc::now())?;
        self.bootstrap(session, domain, source_remaining).await?;

        session.enter(MigrationPhase::Completed, Utc::now())?;
        self.notifier
            .notify(&MigrationEvent::Succeeded {
                source: source_label(session),
                target: target.address.clone(),
                domain: domain.to_string(),
                duration_secs: (Utc::now() - session.started_at).num_seconds(),
            })
            .await;
        Ok(())
    }

    /// Selecting + Locking，锁竞争时排除该节点重新选择
    async fn select_and_lock(
        &self,
        session: &mut MigrationSession,
        request: &MigrationRequest,
        source_remaining: i64,
        cancel: &CancellationToken,
    ) -> Result<Node, OrchestratorError> {
        let min_remaining = if request.force || request.target.is_some() {
            None
        } else {
            Some(source_remaining + self.settings.minimum_gain_days)
        };

        let mut attempts = 0;
        loop {
            check_cancel(cancel)?;
            let candidate = self.select(session, request, min_remaining).await?;

            session.enter(MigrationPhase::Locking, Utc::now())?;
            attempts += 1;
            match self.locks.acquire(&candidate.id, self.settings.lock_ttl_secs).await {
                Ok(lock) => {
                    session.lock = Some(lock);
                    return Ok(candidate);
                }
                Err(LockError::Contention { target_id, holder_id }) => {
                    warn!(
                        session = %session.id,
                        target_id = %target_id,
                        holder = %holder_id,
                        attempt = attempts,
                        "Target locked by another migration"
                    );
                    session.exclude(&candidate.id);
                    if request.target.is_some() {
                        return Err(LockError::Contention { target_id, holder_id }.into());
                    }
                    if attempts >= self.settings.max_lock_attempts {
                        return Err(OrchestratorError::LockAttemptsExhausted(attempts));
                    }
                    session.enter(MigrationPhase::Selecting, Utc::now())?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// 选择目标：排序后并发探测，取排名最靠前的可达节点
    async fn select(
        &self,
        session: &mut MigrationSession,
        request: &MigrationRequest,
        min_remaining: Option<i64>,
    ) -> Result<Node, OrchestratorError> {
        // 先拉取其他主机的状态变更
        self.push_registry("select").await;
        let now = Utc::now();
        let nodes = self.registry.list().await;

        let candidates = match &request.target {
            Some(wanted) => {
                let node = nodes
                    .into_iter()
                    .find(|n| n.address == *wanted || n.id == *wanted)
                    .ok_or_else(|| OrchestratorError::TargetUnavailable(wanted.clone()))?;
                let eligible = rank_candidates(
                    [node],
                    now,
                    &session.excluded,
                    session.source_id.as_deref(),
                    session.source_address.as_deref(),
                    None,
                );
                if eligible.is_empty() {
                    return Err(OrchestratorError::TargetUnavailable(wanted.clone()));
                }
                eligible
            }
            None => rank_candidates(
                nodes,
                now,
                &session.excluded,
                session.source_id.as_deref(),
                session.source_address.as_deref(),
                min_remaining,
            ),
        };

        if candidates.is_empty() {
            return Err(OrchestratorError::NoCandidate);
        }
        debug!(
            session = %session.id,
            candidates = ?candidates.iter().map(|n| n.id.as_str()).collect::<Vec<_>>(),
            "Ranked migration candidates"
        );

        let probes = candidates.iter().map(|n| self.probe_with_retry(&n.address));
        let reachable = futures::future::join_all(probes).await;

        for (node, ok) in candidates.into_iter().zip(reachable) {
            if ok {
                info!(
                    session = %session.id,
                    target = %node.address,
                    remaining_days = node.remaining_days(now),
                    "Migration target selected"
                );
                return Ok(node);
            }
            warn!(session = %session.id, target = %node.address, "Candidate unreachable, excluding");
            session.exclude(&node.id);
        }

        match &request.target {
            Some(wanted) => Err(OrchestratorError::TargetUnreachable(wanted.clone())),
            None => Err(OrchestratorError::NoCandidate),
        }
    }

    async fn probe_with_retry(&self, address: &str) -> bool {
        let attempts = self.settings.probe_retries + 1;
        for attempt in 1..=attempts {
            if self.remote.ensure_access(address, self.settings.connect_timeout).await {
                return true;
            }
            if attempt < attempts {
                tokio::time::sleep(self.settings.probe_backoff * attempt).await;
            }
        }
        false
    }

    /// 本地写入会话标记，克隆后在目标上比对
    async fn write_marker(&self, session: &MigrationSession) -> Result<(), OrchestratorError> {
        let path = &self.settings.marker_path;
        let marker_err = |source| OrchestratorError::Marker {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(marker_err)?;
        }
        tokio::fs::write(path, session.id.to_string())
            .await
            .map_err(marker_err)
    }

    async fn clone_with_retries(
        &self,
        session: &mut MigrationSession,
        cancel: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        let (target_id, address) = match &session.target {
            Some(t) => (t.id.clone(), t.address.clone()),
            None => return Err(OrchestratorError::NoCandidate),
        };
        let attempts = self.settings.transfer_attempts.max(1);

        for attempt in 1..=attempts {
            check_cancel(cancel)?;
            // 每次尝试前续租，锁丢失立即终止
            self.locks.renew(&target_id, self.settings.lock_ttl_secs).await?;
            session.clone_attempts += 1;

            info!(session = %session.id, target = %address, attempt, "Cloning to target");
            let replicator = &self.replicator;
            let progress = &mut session.progress;
            let address_ref = address.as_str();
            let result = self
                .while_holding(&target_id, cancel, move |token| async move {
                    replicator.clone_to(address_ref, progress, &token).await
                })
                .await?;

            match result {
                Ok(()) => return Ok(()),
                Err(TransferError::Cancelled) => return Err(OrchestratorError::Aborted),
                Err(e) if !e.is_transient() => return Err(OrchestratorError::Transfer(e)),
                Err(e) if attempt < attempts => {
                    let delay = self
                        .settings
                        .retry_backoff
                        .saturating_mul(1 << (attempt - 1).min(MAX_BACKOFF_SHIFT));
                    warn!(
                        session = %session.id,
                        attempt,
                        error = %e,
                        retry_in_secs = delay.as_secs(),
                        "Transfer attempt failed"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(OrchestratorError::Aborted),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    return Err(OrchestratorError::TransferExhausted {
                        attempts,
                        last: e.to_string(),
                    })
                }
            }
        }

        Err(OrchestratorError::TransferExhausted {
            attempts,
            last: "no attempt made".to_string(),
        })
    }

    async fn verify_holding(
        &self,
        session: &MigrationSession,
        cancel: &CancellationToken,
    ) -> Result<bool, OrchestratorError> {
        let target_id = session.target.as_ref().map(|t| t.id.clone()).unwrap_or_default();
        self.while_holding(&target_id, cancel, |_| self.verify(session)).await
    }

    /// 在执行 `work` 的同时按周期续租目标锁
    ///
    /// 续租返回 `NotHolder` 时取消 `work`（通过子令牌），等待其退出后返回锁错误。
    /// 其他续租错误只记录，下一周期重试。
    async fn while_holding<T, F, Fut>(
        &self,
        target_id: &str,
        cancel: &CancellationToken,
        work: F,
    ) -> Result<T, OrchestratorError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = cancel.child_token();
        let work = work(guard.clone());
        tokio::pin!(work);

        // interval 不接受零周期
        let period = self.settings.renew_interval.max(Duration::from_millis(10));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                out = &mut work => return Ok(out),
                _ = heartbeat.tick() => {
                    match self.locks.renew(target_id, self.settings.lock_ttl_secs).await {
                        Ok(lock) => debug!(target_id, expires_at = ?lock.expires_at(), "Target lock renewed"),
                        Err(e @ LockError::NotHolder { .. }) => {
                            error!(target_id, error = %e, "Target lock lost, stopping current step");
                            guard.cancel();
                            let _ = (&mut work).await;
                            return Err(e.into());
                        }
                        Err(e) => warn!(target_id, error = %e, "Lock renewal failed, retrying next period"),
                    }
                }
            }
        }
    }

    async fn verify(&self, session: &MigrationSession) -> bool {
        let Some(address) = session.target_address() else {
            return false;
        };
        match self.replicator.verify(address, &session.id.to_string()).await {
            Ok(ok) => ok,
            Err(e) => {
                warn!(session = %session.id, target = %address, error = %e, "Verification errored");
                false
            }
        }
    }

    /// 域名指向目标；可选地把退役记录指向源主机
    async fn cutover(&self, session: &mut MigrationSession, domain: &str) -> Result<(), OrchestratorError> {
        let address = session
            .target_address()
            .map(str::to_string)
            .ok_or(OrchestratorError::NoCandidate)?;

        match tokio::time::timeout(self.settings.dns_timeout, self.dns.upsert(domain, &address)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(OrchestratorError::Cutover(e.to_string())),
            Err(_) => {
                return Err(OrchestratorError::Cutover(format!(
                    "timed out after {}s",
                    self.settings.dns_timeout.as_secs()
                )))
            }
        }
        session.cut_over = true;
        info!(session = %session.id, record = domain, address = %address, "DNS cut over to target");

        if let (Some(record), Some(source)) = (&self.settings.retired_record, &session.source_address) {
            if let Err(e) = self.dns.upsert(record, source).await {
                warn!(record = %record, error = %e, "Failed to point retired record at source");
            }
        }
        Ok(())
    }

    /// 切换后的收尾；逐步执行，出错累积，不中断后续步骤
    async fn bootstrap(
        &self,
        session: &mut MigrationSession,
        domain: &str,
        source_remaining: i64,
    ) -> Result<(), OrchestratorError> {
        let target = session.target.clone().ok_or(OrchestratorError::NoCandidate)?;
        let mut problems: Vec<String> = Vec::new();

        if let Err(e) = self.retire_in_registry(session, &target, domain).await {
            problems.push(format!("registry: {}", e));
        }

        let now = Utc::now();
        let record = MigrationRecord {
            session_id: session.id,
            source_address: session.source_address.clone(),
            target_id: target.id.clone(),
            target_address: target.address.clone(),
            started_at: session.started_at,
            finished_at: now,
            remaining_days: source_remaining,
        };
        if let Err(e) = self.lease.record_migration(record).await {
            problems.push(format!("history: {}", e));
        }

        // 已切换，不再响应取消；续租失败仍会中止收尾中的传输
        let detached = CancellationToken::new();
        let mut lock_lost = false;
        match self
            .while_holding(&target.id, &detached, |token| self.hand_off(&target, token))
            .await
        {
            Ok(found) => problems.extend(found),
            Err(e) => {
                lock_lost = true;
                problems.push(format!("lock: {}", e));
            }
        }

        if lock_lost {
            session.lock = None;
        } else {
            match self.locks.release(&target.id).await {
                Ok(()) => session.lock = None,
                Err(e) => problems.push(format!("lock release: {}", e)),
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::Bootstrap(problems.join("; ")))
        }
    }

    /// 最终同步、远程 adopt/start、可选重启；返回各步问题
    async fn hand_off(&self, target: &Node, token: CancellationToken) -> Vec<String> {
        let mut problems = Vec::new();

        if let Err(e) = self.replicator.final_sync(&target.address, &token).await {
            problems.push(format!("final sync: {}", e));
        }

        let bin = shell_quote(&self.settings.agent_bin);
        let adopt = format!("{} adopt --node-id {}", bin, shell_quote(&target.id));
        if let Err(e) = self
            .remote
            .exec_ok(&target.address, &adopt, REMOTE_COMMAND_TIMEOUT)
            .await
        {
            problems.push(format!("adopt: {}", e));
        }

        let start = format!("{} start", bin);
        if let Err(e) = self
            .remote
            .exec_ok(&target.address, &start, REMOTE_COMMAND_TIMEOUT)
            .await
        {
            problems.push(format!("start: {}", e));
        }

        if self.settings.reboot_target {
            if let Err(e) = self.reboot_and_wait(&target.address).await {
                problems.push(e);
            }
        }
        problems
    }

    /// 目标设为 active，源节点退役，然后推送
    async fn retire_in_registry(
        &self,
        session: &MigrationSession,
        target: &Node,
        domain: &str,
    ) -> Result<(), RegistryError> {
        let now = Utc::now();
        self.registry.activate(&target.id, domain, now).await?;

        if let Some(source_id) = &session.source_id {
            if self.registry.get(source_id).await.is_some() {
                match self.settings.retire_mode {
                    RetireMode::Remove => {
                        self.registry.remove(source_id, now).await?;
                    }
                    RetireMode::Dead => {
                        self.registry.set_status(source_id, NodeStatus::Dead, now).await?;
                    }
                }
            }
        }

        self.registry.sync(now).await?;
        Ok(())
    }

    async fn reboot_and_wait(&self, address: &str) -> Result<(), String> {
        info!(target = %address, "Rebooting target");
        // 连接随重启断开，返回结果不可靠
        let _ = self
            .remote
            .exec(
                address,
                "nohup sh -c 'sleep 2 && reboot' >/dev/null 2>&1 &",
                self.settings.connect_timeout,
            )
            .await;

        tokio::time::sleep(REBOOT_GRACE.min(self.settings.startup_wait)).await;
        let deadline = tokio::time::Instant::now() + self.settings.startup_wait;
        loop {
            if self.remote.probe(address, self.settings.connect_timeout).await {
                info!(target = %address, "Target back online");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(format!(
                    "target did not come back within {}s",
                    self.settings.startup_wait.as_secs()
                ));
            }
            tokio::time::sleep(ONLINE_POLL_INTERVAL).await;
        }
    }

    async fn push_registry(&self, step: &str) {
        if let Err(e) = self.registry.sync(Utc::now()).await {
            warn!(step, error = %e, "Registry push failed, will retry on next sync");
        }
    }

    async fn return_to_idle(&self, target_id: &str, now: DateTime<Utc>) {
        match self.registry.set_status(target_id, NodeStatus::Idle, now).await {
            Ok(_) => self.push_registry("rollback").await,
            Err(e) => warn!(target_id = %target_id, error = %e, "Failed to return target to idle"),
        }
    }

    async fn handle_failure(
        &self,
        session: &mut MigrationSession,
        error: &OrchestratorError,
        source_remaining: i64,
    ) {
        let now = Utc::now();
        let failed_phase = session.phase;
        let source = source_label(session);

        // 锁已失去：被他人接管时目标状态归新持有者；无人持有时仍退回 idle
        let lock_lost = matches!(error, OrchestratorError::Lock(LockError::NotHolder { .. }));
        if lock_lost && !session.cut_over {
            if let Some(lock) = session.lock.take() {
                match self.locks.holder(&lock.target_id).await {
                    Ok(None) => self.return_to_idle(&lock.target_id, now).await,
                    Ok(Some(holder)) => warn!(
                        target_id = %lock.target_id,
                        holder = %holder,
                        "Target lock taken over, leaving target state to the new holder"
                    ),
                    Err(e) => warn!(target_id = %lock.target_id, error = %e, "Cannot read target lock, leaving target state"),
                }
            }
        }

        if let Some(lock) = session.lock.take() {
            if !session.cut_over {
                self.return_to_idle(&lock.target_id, now).await;
            }
            if let Err(e) = self.locks.release(&lock.target_id).await {
                warn!(target_id = %lock.target_id, error = %e, "Failed to release target lock");
            }
        }

        let aborted = matches!(error, OrchestratorError::Aborted);
        session.finish_with_error(error.to_string(), aborted, now);

        let target = session.target_address().map(str::to_string);
        if session.cut_over {
            error!(
                session = %session.id,
                phase = %failed_phase,
                error = %error,
                "Migration failed after cutover, operator intervention required"
            );
            self.notifier
                .notify(&MigrationEvent::NeedsOperator {
                    source,
                    target: target.unwrap_or_default(),
                    error: error.to_string(),
                })
                .await;
            return;
        }

        match error {
            OrchestratorError::NotNeeded { .. } => {
                info!(remaining_days = source_remaining, "Lease healthy, no migration needed");
            }
            OrchestratorError::Aborted => {
                warn!(session = %session.id, phase = %failed_phase, "Migration aborted");
            }
            OrchestratorError::NoCandidate => {
                error!(session = %session.id, remaining_days = source_remaining, "No migration candidate available");
                self.notifier
                    .notify(&MigrationEvent::NoCandidate {
                        source,
                        remaining_days: source_remaining,
                    })
                    .await;
            }
            _ => {
                error!(session = %session.id, phase = %failed_phase, error = %error, "Migration failed");
                self.notifier
                    .notify(&MigrationEvent::Failed {
                        source,
                        target,
                        phase: failed_phase.to_string(),
                        error: error.to_string(),
                    })
                    .await;
            }
        }
    }
}

fn source_label(session: &MigrationSession) -> String {
    session
        .source_address
        .clone()
        .or_else(|| session.source_id.clone())
        .unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        })
}
