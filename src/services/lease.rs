//! 租期跟踪
//!
//! 管理本机的租期窗口，计算健康等级与迁移紧迫度。只读本地状态，从不访问网络。

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use super::persistence::{PersistError, Store};
use crate::domain::{LeaseState, LeaseStatus, LeaseThresholds, MigrationRecord, Node};

/// 租期错误
#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("lease already initialized (expires {expires_at})")]
    AlreadyInitialized { expires_at: DateTime<Utc> },
    #[error("lease not initialized; run `hermit-crab init` first")]
    NotInitialized,
    #[error(transparent)]
    Store(#[from] PersistError),
}

/// 租期跟踪器
pub struct LeaseTracker {
    store: Arc<dyn Store<LeaseState>>,
    lease_days: i64,
    thresholds: LeaseThresholds,
}

impl LeaseTracker {
    pub fn new(store: Arc<dyn Store<LeaseState>>, lease_days: i64, thresholds: LeaseThresholds) -> Self {
        Self {
            store,
            lease_days,
            thresholds,
        }
    }

    pub fn thresholds(&self) -> &LeaseThresholds {
        &self.thresholds
    }

    /// 初始化本机租期
    pub async fn init(
        &self,
        domain: &str,
        added_at: DateTime<Utc>,
        address: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<LeaseState, LeaseError> {
        if let Some(existing) = self.store.load().await? {
            return Err(LeaseError::AlreadyInitialized {
                expires_at: existing.expires_at,
            });
        }

        let state = LeaseState {
            node_id: address.as_deref().map(crate::domain::node_id_for),
            address,
            domain: domain.to_string(),
            added_at,
            expires_at: added_at + Duration::days(self.lease_days),
            lease_days: self.lease_days,
            initialized_at: now,
            migration_history: Vec::new(),
        };
        self.store.save(&state).await?;

        info!(
            domain = %state.domain,
            added_at = %state.added_at,
            expires_at = %state.expires_at,
            "Lease initialized"
        );
        Ok(state)
    }

    /// 在新克隆的目标机上接管租期
    ///
    /// 继承来的租期替换为目标节点自身的窗口，迁移历史保留
    pub async fn adopt(&self, node: &Node, now: DateTime<Utc>) -> Result<LeaseState, LeaseError> {
        let inherited = self.store.load().await?;
        let (history, domain) = match inherited {
            Some(old) => (old.migration_history, old.domain),
            None => (Vec::new(), node.domain.clone()),
        };

        let state = LeaseState {
            node_id: Some(node.id.clone()),
            address: Some(node.address.clone()),
            domain: if domain.is_empty() { node.domain.clone() } else { domain },
            added_at: node.added_at,
            expires_at: node.expires_at,
            lease_days: (node.expires_at - node.added_at).num_days(),
            initialized_at: now,
            migration_history: history,
        };
        self.store.save(&state).await?;

        info!(
            node_id = %node.id,
            expires_at = %state.expires_at,
            history = state.migration_history.len(),
            "Lease adopted from registry node"
        );
        Ok(state)
    }

    pub async fn load(&self) -> Result<LeaseState, LeaseError> {
        self.store.load().await?.ok_or(LeaseError::NotInitialized)
    }

    pub async fn status(&self, now: DateTime<Utc>) -> Result<LeaseStatus, LeaseError> {
        let state = self.load().await?;
        Ok(LeaseStatus::from_state(&state, &self.thresholds, now))
    }

    pub async fn needs_migration(&self, now: DateTime<Utc>) -> Result<bool, LeaseError> {
        let state = self.load().await?;
        Ok(self.thresholds.needs_migration(state.remaining_days(now)))
    }

    /// 追加迁移历史
    pub async fn record_migration(&self, record: MigrationRecord) -> Result<(), LeaseError> {
        let mut state = self.load().await?;
        info!(
            session = %record.session_id,
            target = %record.target_address,
            "Recording migration in lease history"
        );
        state.migration_history.push(record);
        self.store.save(&state).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::persistence::{JsonFileStore, MemoryStore};
    use chrono::TimeZone;
    use uuid::Uuid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn tracker() -> LeaseTracker {
        LeaseTracker::new(
            Arc::new(MemoryStore::default()),
            15,
            LeaseThresholds::default(),
        )
    }

    #[tokio::test]
    async fn test_lease_scenario_day_9_and_11() {
        let lease = tracker();
        lease.init("svc.example.com", t0(), None, t0()).await.unwrap();

        // 第 9 天剩余 6 天，不需要迁移
        assert!(!lease.needs_migration(t0() + Duration::days(9)).await.unwrap());
        // 第 11 天剩余 4 天，需要迁移
        assert!(lease.needs_migration(t0() + Duration::days(11)).await.unwrap());

        let status = lease.status(t0() + Duration::days(9)).await.unwrap();
        assert_eq!(status.remaining_days, 6);
        assert_eq!(status.expires_at, t0() + Duration::days(15));
        assert_eq!(status.remaining_seconds, Duration::days(6).num_seconds());
    }

    #[tokio::test]
    async fn test_init_twice_fails() {
        let lease = tracker();
        lease.init("svc.example.com", t0(), None, t0()).await.unwrap();
        let err = lease.init("svc.example.com", t0(), None, t0()).await.unwrap_err();
        assert!(matches!(err, LeaseError::AlreadyInitialized { .. }));
    }

    #[tokio::test]
    async fn test_status_requires_init() {
        let lease = tracker();
        assert!(matches!(lease.status(t0()).await, Err(LeaseError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_adopt_replaces_window_keeps_history() {
        let lease = tracker();
        lease
            .init("svc.example.com", t0(), Some("10.0.0.1".into()), t0())
            .await
            .unwrap();
        lease
            .record_migration(MigrationRecord {
                session_id: Uuid::new_v4(),
                source_address: Some("10.0.0.1".into()),
                target_id: "node-10-0-0-2".into(),
                target_address: "10.0.0.2".into(),
                started_at: t0(),
                finished_at: t0(),
                remaining_days: 4,
            })
            .await
            .unwrap();

        let target = Node::new("10.0.0.2", "pool", t0() + Duration::days(8), Duration::days(15), "");
        let adopted = lease.adopt(&target, t0() + Duration::days(11)).await.unwrap();

        assert_eq!(adopted.node_id.as_deref(), Some("node-10-0-0-2"));
        assert_eq!(adopted.domain, "svc.example.com");
        assert_eq!(adopted.expires_at, t0() + Duration::days(23));
        assert_eq!(adopted.lease_days, 15);
        assert_eq!(adopted.migration_history.len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_state_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lease.json");
        std::fs::write(&path, "garbage").unwrap();
        let lease = LeaseTracker::new(
            Arc::new(JsonFileStore::new(&path)),
            15,
            LeaseThresholds::default(),
        );
        assert!(matches!(
            lease.status(t0()).await,
            Err(LeaseError::Store(PersistError::Corrupt { .. }))
        ));
    }
}
