//! 迁移事件通知
//!
//! 通知尽力而为，失败只记日志，不影响调用方

use async_trait::async_trait;
use tracing::{error, info, warn};

/// 通知事件
#[derive(Clone, Debug)]
pub enum MigrationEvent {
    Started {
        source: String,
        target: String,
        remaining_days: i64,
    },
    Succeeded {
        source: String,
        target: String,
        domain: String,
        duration_secs: i64,
    },
    Failed {
        source: String,
        target: Option<String>,
        phase: String,
        error: String,
    },
    /// 候选池耗尽
    NoCandidate {
        source: String,
        remaining_days: i64,
    },
    LeaseWarning {
        source: String,
        remaining_days: i64,
        classification: String,
        idle_candidates: usize,
    },
    /// 切换后收尾出错，需要人工处理
    NeedsOperator {
        source: String,
        target: String,
        error: String,
    },
}

impl MigrationEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            MigrationEvent::Started { .. } => "started",
            MigrationEvent::Succeeded { .. } => "succeeded",
            MigrationEvent::Failed { .. } => "failed",
            MigrationEvent::NoCandidate { .. } => "no_candidate",
            MigrationEvent::LeaseWarning { .. } => "lease_warning",
            MigrationEvent::NeedsOperator { .. } => "needs_operator",
        }
    }

    pub fn subject(&self) -> String {
        match self {
            MigrationEvent::Started { source, target, .. } => {
                format!("[hermit-crab] migration started: {} -> {}", source, target)
            }
            MigrationEvent::Succeeded { source, target, .. } => {
                format!("[hermit-crab] migration succeeded: {} -> {}", source, target)
            }
            MigrationEvent::Failed { source, phase, .. } => {
                format!("[hermit-crab] migration FAILED on {} during {}", source, phase)
            }
            MigrationEvent::NoCandidate { source, .. } => {
                format!("[hermit-crab] URGENT: no migration target for {}", source)
            }
            MigrationEvent::LeaseWarning {
                source,
                remaining_days,
                ..
            } => format!("[hermit-crab] lease warning: {} has {} days left", source, remaining_days),
            MigrationEvent::NeedsOperator { target, .. } => {
                format!("[hermit-crab] URGENT: post-cutover failure on {}", target)
            }
        }
    }

    pub fn body(&self) -> String {
        match self {
            MigrationEvent::Started {
                source,
                target,
                remaining_days,
            } => format!(
                "Migrating from {} to {}.\nSource lease remaining: {} days.",
                source, target, remaining_days
            ),
            MigrationEvent::Succeeded {
                source,
                target,
                domain,
                duration_secs,
            } => format!(
                "Service {} now runs on {} (previous host {}).\nDuration: {}s.",
                domain, target, source, duration_secs
            ),
            MigrationEvent::Failed {
                source,
                target,
                phase,
                error,
            } => format!(
                "Source: {}\nTarget: {}\nPhase: {}\nError: {}",
                source,
                target.as_deref().unwrap_or("-"),
                phase,
                error
            ),
            MigrationEvent::NoCandidate {
                source,
                remaining_days,
            } => format!(
                "No idle, reachable host in the pool for {}.\nSource lease remaining: {} days.\nAdd hosts with `hermit-crab add --address ...`.",
                source, remaining_days
            ),
            MigrationEvent::LeaseWarning {
                source,
                remaining_days,
                classification,
                idle_candidates,
            } => format!(
                "Host {} lease: {} days remaining ({}).\nIdle candidates in pool: {}.",
                source, remaining_days, classification, idle_candidates
            ),
            MigrationEvent::NeedsOperator {
                source,
                target,
                error,
            } => format!(
                "DNS already points at {}; hand-off from {} did not finish.\nError: {}\nThe target needs manual attention.",
                target, source, error
            ),
        }
    }

    fn is_urgent(&self) -> bool {
        matches!(
            self,
            MigrationEvent::Failed { .. }
                | MigrationEvent::NoCandidate { .. }
                | MigrationEvent::NeedsOperator { .. }
        )
    }
}

/// 通知接口
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &MigrationEvent);
}

/// 仅写日志的通知器（未配置通知时使用）
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &MigrationEvent) {
        let subject = event.subject();
        if event.is_urgent() {
            error!(event = event.kind(), "{}", subject);
        } else if matches!(event, MigrationEvent::LeaseWarning { .. }) {
            warn!(event = event.kind(), "{}", subject);
        } else {
            info!(event = event.kind(), "{}", subject);
        }
    }
}
