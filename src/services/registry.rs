//! 节点池服务
//!
//! 本地副本 + 共享远端副本。同步流程：拉取 → 按节点合并 → 本地落盘 → 与远端不同则推送。
//! 推送使用远端版本标记做比较交换，冲突时重新拉取合并。

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::persistence::{PersistError, Store};
use crate::config::constants::SYNC_ATTEMPTS;
use crate::domain::{Node, NodeStatus, Registry, RegistryEntryError};

/// 节点池错误
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("node already registered: {0}")]
    DuplicateId(String),
    #[error("node not found: {0}")]
    NotFound(String),
    /// 远端在拉取后被其他主机修改
    #[error("remote registry changed concurrently")]
    Conflict,
    #[error("registry backend error: {0}")]
    Backend(String),
    #[error(transparent)]
    Store(#[from] PersistError),
}

impl From<RegistryEntryError> for RegistryError {
    fn from(e: RegistryEntryError) -> Self {
        match e {
            RegistryEntryError::DuplicateId(id) => RegistryError::DuplicateId(id),
            RegistryEntryError::NotFound(id) => RegistryError::NotFound(id),
        }
    }
}

/// 远端节点池快照
#[derive(Clone, Debug)]
pub struct RemoteRegistry {
    pub registry: Registry,
    /// 远端版本标记（如 git blob sha），推送时用于比较交换
    pub revision: Option<String>,
}

/// 共享节点池后端
#[async_trait]
pub trait RegistryBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// 是否存在其他主机可见的远端副本
    fn is_shared(&self) -> bool {
        true
    }

    /// 拉取远端副本，不存在时返回 None
    async fn pull(&self) -> Result<Option<RemoteRegistry>, RegistryError>;

    /// 推送；`base` 与远端当前版本不一致时返回 `Conflict`
    async fn push(&self, registry: &Registry, base: Option<&str>) -> Result<(), RegistryError>;
}

/// 未配置共享后端时使用：只维护本地副本
pub struct LocalOnlyBackend;

#[async_trait]
impl RegistryBackend for LocalOnlyBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn is_shared(&self) -> bool {
        false
    }

    async fn pull(&self) -> Result<Option<RemoteRegistry>, RegistryError> {
        Ok(None)
    }

    async fn push(&self, _registry: &Registry, _base: Option<&str>) -> Result<(), RegistryError> {
        Ok(())
    }
}

/// 内存后端，带版本号比较交换，用于测试与单进程场景
#[derive(Default)]
pub struct MemoryRegistryBackend {
    state: Mutex<(Option<Registry>, u64)>,
}

impl MemoryRegistryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Option<Registry> {
        self.state.lock().await.0.clone()
    }
}

#[async_trait]
impl RegistryBackend for MemoryRegistryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn pull(&self) -> Result<Option<RemoteRegistry>, RegistryError> {
        let state = self.state.lock().await;
        Ok(state.0.clone().map(|registry| RemoteRegistry {
            registry,
            revision: Some(state.1.to_string()),
        }))
    }

    async fn push(&self, registry: &Registry, base: Option<&str>) -> Result<(), RegistryError> {
        let mut state = self.state.lock().await;
        let current = state.0.as_ref().map(|_| state.1.to_string());
        if current.as_deref() != base {
            return Err(RegistryError::Conflict);
        }
        state.0 = Some(registry.clone());
        state.1 += 1;
        Ok(())
    }
}

/// 同步结果
#[derive(Clone, Debug, Default)]
pub struct SyncReport {
    pub pulled: bool,
    pub pushed: bool,
    pub nodes: usize,
    pub attempts: u32,
}

/// 节点池
pub struct NodeRegistry {
    store: Arc<dyn Store<Registry>>,
    backend: Arc<dyn RegistryBackend>,
    state: RwLock<Registry>,
    tombstone_retention: Duration,
}

impl NodeRegistry {
    /// 打开本地副本
    pub async fn open(
        store: Arc<dyn Store<Registry>>,
        backend: Arc<dyn RegistryBackend>,
        tombstone_retention: Duration,
    ) -> Result<Self, RegistryError> {
        let registry = store.load().await?.unwrap_or_default();
        debug!(nodes = registry.len(), backend = backend.name(), "Opened node registry");
        Ok(Self {
            store,
            backend,
            state: RwLock::new(registry),
            tombstone_retention,
        })
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// 添加节点（仅本地，随后由 sync 推送）
    pub async fn add(&self, node: Node, now: DateTime<Utc>) -> Result<Node, RegistryError> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        next.insert(node.clone(), now)?;
        self.store.save(&next).await?;
        *state = next;

        info!(id = %node.id, address = %node.address, expires_at = %node.expires_at, "Node added");
        Ok(state.get(&node.id).cloned().unwrap_or(node))
    }

    /// 删除节点并推送
    ///
    /// 推送失败不影响本地删除，墓碑会在下次同步时传播
    pub async fn remove(&self, id: &str, now: DateTime<Utc>) -> Result<Node, RegistryError> {
        let removed = {
            let mut state = self.state.write().await;
            let mut next = state.clone();
            let removed = next.remove(id, now)?;
            self.store.save(&next).await?;
            *state = next;
            removed
        };
        info!(id = %removed.id, address = %removed.address, "Node removed");

        if let Err(e) = self.sync(now).await {
            warn!(id = %removed.id, error = %e, "Push after removal failed, will retry on next sync");
        }
        Ok(removed)
    }

    /// 状态变更（仅编排器使用）
    pub async fn set_status(
        &self,
        id: &str,
        status: NodeStatus,
        now: DateTime<Utc>,
    ) -> Result<Node, RegistryError> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        let node = next.set_status(id, status, now)?.clone();
        self.store.save(&next).await?;
        *state = next;

        debug!(id, status = %status, "Node status updated");
        Ok(node)
    }

    /// 将目标节点设为服务承载节点，同域名旧节点降级
    pub async fn activate(
        &self,
        id: &str,
        domain: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, RegistryError> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        let demoted = next.activate(id, domain, now)?;
        self.store.save(&next).await?;
        *state = next;

        info!(id, domain, demoted = ?demoted, "Node activated");
        Ok(demoted)
    }

    pub async fn get(&self, id: &str) -> Option<Node> {
        self.state.read().await.get(id).cloned()
    }

    pub async fn find_by_address(&self, address: &str) -> Option<Node> {
        self.state.read().await.find_by_address(address).cloned()
    }

    /// 当前快照的有序节点序列，可 clone 后重复遍历
    pub async fn list(&self) -> std::vec::IntoIter<Node> {
        let state = self.state.read().await;
        state.list().cloned().collect::<Vec<_>>().into_iter()
    }

    pub async fn snapshot(&self) -> Registry {
        self.state.read().await.clone()
    }

    /// 与共享后端同步
    ///
    /// 幂等；多主机并发执行时由按节点合并收敛
    pub async fn sync(&self, now: DateTime<Utc>) -> Result<SyncReport, RegistryError> {
        let mut report = SyncReport::default();
        let cutoff = now - self.tombstone_retention;

        for attempt in 1..=SYNC_ATTEMPTS {
            report.attempts = attempt;
            let remote = self.backend.pull().await?;
            report.pulled = remote.is_some();

            let mut state = self.state.write().await;
            let local_digest = state.content_digest();
            let mut merged = match &remote {
                Some(r) => state.merge(&r.registry),
                None => state.clone(),
            };
            let pruned = merged.prune_tombstones(cutoff);
            if pruned > 0 {
                debug!(pruned, "Pruned expired tombstones");
            }

            let merged_digest = merged.content_digest();
            let changed_locally = merged_digest != local_digest;
            // 远端不存在时：共享后端需要创建远端副本，本地后端只看本地是否变化
            let differs = match &remote {
                Some(r) => r.registry.content_digest() != merged_digest,
                None => self.backend.is_shared() || changed_locally,
            };
            if differs {
                merged.touch(now);
            }

            if differs || changed_locally {
                self.store.save(&merged).await?;
                *state = merged.clone();
            }
            drop(state);
            report.nodes = merged.len();

            if !differs {
                debug!(backend = self.backend.name(), "Registry already in sync");
                return Ok(report);
            }
            if !self.backend.is_shared() {
                debug!(pruned, "Local registry updated");
                return Ok(report);
            }

            let base = remote.as_ref().and_then(|r| r.revision.as_deref());
            match self.backend.push(&merged, base).await {
                Ok(()) => {
                    report.pushed = true;
                    info!(
                        backend = self.backend.name(),
                        nodes = report.nodes,
                        version = merged.version,
                        "Registry pushed"
                    );
                    return Ok(report);
                }
                Err(RegistryError::Conflict) => {
                    warn!(attempt, "Registry push conflicted, re-pulling");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Err(RegistryError::Conflict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::persistence::{JsonFileStore, MemoryStore};
    use chrono::TimeZone;

    fn t(day: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + Duration::days(day)
    }

    fn node(address: &str) -> Node {
        Node::new(address, "pool", t(0), Duration::days(15), "")
    }

    async fn open(backend: Arc<dyn RegistryBackend>) -> NodeRegistry {
        NodeRegistry::open(Arc::new(MemoryStore::default()), backend, Duration::days(30))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_add_duplicate_address_rejected() {
        let reg = open(Arc::new(LocalOnlyBackend)).await;
        reg.add(node("10.0.0.1"), t(0)).await.unwrap();
        let err = reg.add(node("10.0.0.1"), t(1)).await.unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateId(_)));
    }

    #[tokio::test]
    async fn test_remove_missing_is_not_found() {
        let reg = open(Arc::new(LocalOnlyBackend)).await;
        assert!(matches!(
            reg.remove("node-x", t(0)).await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_local_copy_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");
        {
            let reg = NodeRegistry::open(
                Arc::new(JsonFileStore::new(&path)),
                Arc::new(LocalOnlyBackend),
                Duration::days(30),
            )
            .await
            .unwrap();
            reg.add(node("10.0.0.1"), t(0)).await.unwrap();
        }
        let reopened = NodeRegistry::open(
            Arc::new(JsonFileStore::new(&path)),
            Arc::new(LocalOnlyBackend),
            Duration::days(30),
        )
        .await
        .unwrap();
        assert!(reopened.get("node-10-0-0-1").await.is_some());
    }

    #[tokio::test]
    async fn test_sync_converges_between_hosts() {
        let backend = Arc::new(MemoryRegistryBackend::new());
        let a = open(backend.clone()).await;
        let b = open(backend.clone()).await;

        a.add(node("10.0.0.1"), t(0)).await.unwrap();
        b.add(node("10.0.0.2"), t(0)).await.unwrap();

        assert!(a.sync(t(1)).await.unwrap().pushed);
        assert!(b.sync(t(1)).await.unwrap().pushed);
        a.sync(t(1)).await.unwrap();

        let ids_a: Vec<String> = a.list().await.map(|n| n.id).collect();
        let ids_b: Vec<String> = b.list().await.map(|n| n.id).collect();
        assert_eq!(ids_a, vec!["node-10-0-0-1", "node-10-0-0-2"]);
        assert_eq!(ids_a, ids_b);

        // 已一致时再次同步不推送
        let again = a.sync(t(2)).await.unwrap();
        assert!(!again.pushed);
    }

    #[tokio::test]
    async fn test_concurrent_sync_keeps_both_updates() {
        let backend = Arc::new(MemoryRegistryBackend::new());
        let seed = open(backend.clone()).await;
        seed.add(node("10.0.0.1"), t(0)).await.unwrap();
        seed.add(node("10.0.0.2"), t(0)).await.unwrap();
        seed.sync(t(0)).await.unwrap();

        let a = open(backend.clone()).await;
        let b = open(backend.clone()).await;
        a.sync(t(0)).await.unwrap();
        b.sync(t(0)).await.unwrap();

        a.set_status("node-10-0-0-1", NodeStatus::Transferring, t(1)).await.unwrap();
        b.remove("node-10-0-0-2", t(1)).await.unwrap();

        let (ra, rb) = tokio::join!(a.sync(t(1)), b.sync(t(1)));
        ra.unwrap();
        rb.unwrap();
        a.sync(t(1)).await.unwrap();
        b.sync(t(1)).await.unwrap();

        let remote = backend.snapshot().await.unwrap();
        assert_eq!(
            remote.get("node-10-0-0-1").unwrap().status,
            NodeStatus::Transferring
        );
        assert!(remote.get("node-10-0-0-2").is_none());
        assert_eq!(a.snapshot().await.content_digest(), remote.content_digest());
        assert_eq!(b.snapshot().await.content_digest(), remote.content_digest());
    }

    #[tokio::test]
    async fn test_local_only_sync_is_quiet_when_unchanged() {
        let reg = open(Arc::new(LocalOnlyBackend)).await;
        reg.add(node("10.0.0.1"), t(0)).await.unwrap();
        let version = reg.snapshot().await.version;

        for day in 1..4 {
            let report = reg.sync(t(day)).await.unwrap();
            assert!(!report.pushed);
            assert!(!report.pulled);
            assert_eq!(report.nodes, 1);
        }
        assert_eq!(reg.snapshot().await.version, version);

        // 墓碑过期清理属于本地变化，版本前进但不推送
        reg.remove("node-10-0-0-1", t(5)).await.unwrap();
        let before = reg.snapshot().await.version;
        let report = reg.sync(t(40)).await.unwrap();
        assert!(!report.pushed);
        assert_eq!(reg.snapshot().await.version, before + 1);
    }

    #[tokio::test]
    async fn test_stale_push_conflicts() {
        let backend = MemoryRegistryBackend::new();
        let reg = Registry::new();
        backend.push(&reg, None).await.unwrap();
        assert!(matches!(
            backend.push(&reg, None).await,
            Err(RegistryError::Conflict)
        ));
        assert!(backend.push(&reg, Some("1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_list_is_restartable() {
        let reg = open(Arc::new(LocalOnlyBackend)).await;
        reg.add(node("10.0.0.2"), t(0)).await.unwrap();
        reg.add(node("10.0.0.1"), t(0)).await.unwrap();
        let iter = reg.list().await;
        let first: Vec<String> = iter.clone().map(|n| n.address).collect();
        let second: Vec<String> = iter.map(|n| n.address).collect();
        assert_eq!(first, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(first, second);
    }
}
