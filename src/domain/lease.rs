//! 租期状态模型

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::node::floor_days;

/// 本机租期状态（持久化到本地）
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaseState {
    /// 本机在节点池中的 ID（若已知）
    pub node_id: Option<String>,
    pub address: Option<String>,
    /// 对外服务的域名
    pub domain: String,
    pub added_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub lease_days: i64,
    pub initialized_at: DateTime<Utc>,
    /// 迁移链历史，随服务一起传递到下一台主机
    #[serde(default)]
    pub migration_history: Vec<MigrationRecord>,
}

impl LeaseState {
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at - now
    }

    pub fn remaining_days(&self, now: DateTime<Utc>) -> i64 {
        floor_days(self.remaining(now))
    }
}

/// 一次迁移的历史记录
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationRecord {
    pub session_id: Uuid,
    /// 迁出主机
    #[serde(default)]
    pub source_address: Option<String>,
    pub target_id: String,
    pub target_address: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// 迁移开始时源主机剩余天数
    pub remaining_days: i64,
}

/// 租期健康分级
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum LeaseClass {
    Expired,
    Critical,
    Warning,
    Healthy,
}

impl LeaseClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseClass::Expired => "expired",
            LeaseClass::Critical => "critical",
            LeaseClass::Warning => "warning",
            LeaseClass::Healthy => "healthy",
        }
    }
}

impl std::fmt::Display for LeaseClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 分级阈值（天）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaseThresholds {
    pub warning_days: i64,
    pub critical_days: i64,
    /// remaining_days <= migrate_days 时需要迁移
    pub migrate_days: i64,
}

impl Default for LeaseThresholds {
    fn default() -> Self {
        Self {
            warning_days: 10,
            critical_days: 5,
            migrate_days: 5,
        }
    }
}

impl LeaseThresholds {
    /// 按剩余时长分级
    pub fn classify(&self, remaining: Duration) -> LeaseClass {
        if remaining < Duration::zero() {
            return LeaseClass::Expired;
        }
        let days = floor_days(remaining);
        if days < self.critical_days {
            LeaseClass::Critical
        } else if days < self.warning_days {
            LeaseClass::Warning
        } else {
            LeaseClass::Healthy
        }
    }

    pub fn needs_migration(&self, remaining_days: i64) -> bool {
        remaining_days <= self.migrate_days
    }
}

/// 租期状态快照
#[derive(Clone, Debug, Serialize)]
pub struct LeaseStatus {
    pub domain: String,
    pub node_id: Option<String>,
    pub address: Option<String>,
    pub added_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub lease_days: i64,
    pub remaining_days: i64,
    pub remaining_seconds: i64,
    pub classification: LeaseClass,
    pub needs_migration: bool,
    pub migrations: usize,
}

impl LeaseStatus {
    pub fn from_state(state: &LeaseState, thresholds: &LeaseThresholds, now: DateTime<Utc>) -> Self {
        let remaining = state.remaining(now);
        let remaining_days = floor_days(remaining);
        Self {
            domain: state.domain.clone(),
            node_id: state.node_id.clone(),
            address: state.address.clone(),
            added_at: state.added_at,
            expires_at: state.expires_at,
            lease_days: state.lease_days,
            remaining_days,
            remaining_seconds: remaining.num_seconds(),
            classification: thresholds.classify(remaining),
            needs_migration: thresholds.needs_migration(remaining_days),
            migrations: state.migration_history.len(),
        }
    }
}
