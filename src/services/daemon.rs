//! 守护循环
//!
//! 每个检查周期：同步节点池 → 评估租期 → 需要时迁移。
//! 迁移成功后源主机停用自身的周期触发并退出循环。

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::guard::{GuardError, InstanceGuard};
use super::notify::MigrationEvent;
use super::orchestrator::{MigrationRequest, OrchestratorError};
use crate::domain::{LeaseClass, LeaseStatus, NodeStatus};
use crate::error::AgentError;
use crate::state::AgentState;

/// 守护循环结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonExit {
    /// 收到停止信号
    Stopped,
    /// 服务已迁出本机
    Migrated,
}

/// 单次检查结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Healthy,
    /// 另一个本机编排器正在运行
    Busy,
    Migrated,
}

/// 运行守护循环
pub async fn run(state: Arc<AgentState>, cancel: CancellationToken) -> Result<DaemonExit, AgentError> {
    let interval_secs = state.config.lease.check_interval_secs.max(1);
    info!(
        interval_secs,
        registry = state.registry.backend_name(),
        status_port = ?state.config.daemon.status_port,
        "Starting daemon loop"
    );

    let server = match state.config.daemon.status_port {
        Some(port) => Some(spawn_status_server(state.clone(), port, cancel.child_token()).await?),
        None => None,
    };

    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    let exit = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break DaemonExit::Stopped,
            _ = interval.tick() => {}
        }

        match tick(&state, &cancel).await {
            Ok(TickOutcome::Migrated) => {
                info!("Service migrated away, retiring this host");
                if let Err(e) = state.supervisor.disable().await {
                    warn!(error = %e, "Failed to disable periodic trigger");
                }
                break DaemonExit::Migrated;
            }
            Ok(outcome) => debug!(?outcome, "Check finished"),
            // 失败等待下个周期
            Err(e) => warn!(error = %e, "Check failed, retrying next interval"),
        }
    };

    cancel.cancel();
    if let Some(handle) = server {
        let _ = handle.await;
    }
    info!(?exit, "Daemon loop stopped");
    Ok(exit)
}

/// 单次检查
pub async fn tick(state: &AgentState, cancel: &CancellationToken) -> Result<TickOutcome, AgentError> {
    let now = Utc::now();
    *state.last_check.write().await = Some(now);

    if let Err(e) = state.registry.sync(now).await {
        warn!(error = %e, "Registry sync failed, using local copy");
    }

    let status = state.lease.status(now).await?;
    info!(
        remaining_days = status.remaining_days,
        classification = ?status.classification,
        needs_migration = status.needs_migration,
        "Lease checked"
    );
    report_class_change(state, &status).await;

    if !status.needs_migration {
        return Ok(TickOutcome::Healthy);
    }

    let _guard = match InstanceGuard::acquire(state.config.pid_file()) {
        Ok(guard) => guard,
        Err(GuardError::Busy { pid, .. }) => {
            info!(pid, "Another migration is running on this host");
            return Ok(TickOutcome::Busy);
        }
        Err(e) => return Err(e.into()),
    };

    let orchestrator = state.orchestrator();
    let result = orchestrator
        .run(MigrationRequest::default(), cancel.child_token())
        .await;

    match result {
        Ok(session) => {
            *state.last_session.write().await = Some(session);
            Ok(TickOutcome::Migrated)
        }
        Err(failure) => {
            *state.last_session.write().await = Some((*failure.session).clone());
            match failure.error {
                OrchestratorError::NotNeeded { .. } | OrchestratorError::Aborted => Ok(TickOutcome::Healthy),
                _ => Err(failure.into()),
            }
        }
    }
}

/// 健康等级变化时发送一次预警
async fn report_class_change(state: &AgentState, status: &LeaseStatus) {
    let previous = state.last_class.write().await.replace(status.classification);
    if previous == Some(status.classification) || status.classification == LeaseClass::Healthy {
        return;
    }

    let event = lease_warning(state, status).await;
    state.notifier.notify(&event).await;
}

/// 构造租期预警事件
pub async fn lease_warning(state: &AgentState, status: &LeaseStatus) -> MigrationEvent {
    let now = Utc::now();
    let idle_candidates = state
        .registry
        .list()
        .await
        .filter(|n| n.status == NodeStatus::Idle && !n.is_expired(now))
        .count();

    MigrationEvent::LeaseWarning {
        source: status
            .address
            .clone()
            .or_else(|| status.node_id.clone())
            .unwrap_or_else(|| status.domain.clone()),
        remaining_days: status.remaining_days,
        classification: status.classification.as_str().to_string(),
        idle_candidates,
    }
}

async fn spawn_status_server(
    state: Arc<AgentState>,
    port: u16,
    shutdown: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>, AgentError> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "Status endpoint listening");

    let app = crate::api::router(state);
    Ok(tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await;
        if let Err(e) = result {
            warn!(error = %e, "Status endpoint stopped with error");
        }
    }))
}
