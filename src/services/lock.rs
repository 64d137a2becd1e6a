//! 目标主机锁协调
//!
//! 获取锁时只允许不存在未过期锁的情况；过期锁视为已释放。
//! 获取失败不对同一目标重试，由编排器重新选择候选。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::constants::MAX_LOCK_TTL_SECS;
use crate::domain::Lock;

/// 锁错误
#[derive(Debug, Error)]
pub enum LockError {
    #[error("target {target_id} is locked by {holder_id}")]
    Contention { target_id: String, holder_id: String },
    #[error("lock on {target_id} is not held by {holder_id}")]
    NotHolder { target_id: String, holder_id: String },
    #[error("lock ttl of {0}s is out of range")]
    InvalidTtl(u64),
    #[error("lock backend error: {0}")]
    Backend(String),
}

/// 新建或续租前校验 TTL：必须为正且不超过上限
pub fn checked_ttl(ttl_secs: u64) -> Result<u64, LockError> {
    if ttl_secs == 0 || ttl_secs > MAX_LOCK_TTL_SECS {
        return Err(LockError::InvalidTtl(ttl_secs));
    }
    Ok(ttl_secs)
}

/// 锁服务接口
///
/// 时间由调用方传入，便于测试控制过期
#[async_trait]
pub trait LockService: Send + Sync {
    async fn acquire(
        &self,
        target_id: &str,
        holder_id: &str,
        ttl_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<Lock, LockError>;

    /// 只有持有者可以释放；锁不存在或已过期时为空操作
    async fn release(&self, target_id: &str, holder_id: &str, now: DateTime<Utc>) -> Result<(), LockError>;

    /// 续期，调用方已失去锁时返回 `NotHolder`
    async fn renew(
        &self,
        target_id: &str,
        holder_id: &str,
        ttl_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<Lock, LockError>;

    /// 当前未过期的锁
    async fn current(&self, target_id: &str, now: DateTime<Utc>) -> Result<Option<Lock>, LockError>;
}

/// 进程内锁服务
#[derive(Default)]
pub struct MemoryLockService {
    locks: Mutex<HashMap<String, Lock>>,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn acquire(
        &self,
        target_id: &str,
        holder_id: &str,
        ttl_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<Lock, LockError> {
        let ttl_secs = checked_ttl(ttl_secs)?;
        let mut locks = self.locks.lock().await;
        if let Some(existing) = locks.get(target_id).filter(|l| !l.is_expired(now)) {
            return Err(LockError::Contention {
                target_id: target_id.to_string(),
                holder_id: existing.holder_id.clone(),
            });
        }
        let lock = Lock::new(target_id, holder_id, ttl_secs, now);
        locks.insert(target_id.to_string(), lock.clone());
        debug!(target_id, holder_id, ttl_secs, "Lock acquired");
        Ok(lock)
    }

    async fn release(&self, target_id: &str, holder_id: &str, now: DateTime<Utc>) -> Result<(), LockError> {
        let mut locks = self.locks.lock().await;
        let existing = locks
            .get(target_id)
            .map(|l| (l.is_expired(now), l.is_held_by(holder_id)));
        match existing {
            None => Ok(()),
            Some((true, _)) => {
                locks.remove(target_id);
                Ok(())
            }
            Some((false, false)) => Err(LockError::NotHolder {
                target_id: target_id.to_string(),
                holder_id: holder_id.to_string(),
            }),
            Some((false, true)) => {
                locks.remove(target_id);
                debug!(target_id, holder_id, "Lock released");
                Ok(())
            }
        }
    }

    async fn renew(
        &self,
        target_id: &str,
        holder_id: &str,
        ttl_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<Lock, LockError> {
        let ttl_secs = checked_ttl(ttl_secs)?;
        let mut locks = self.locks.lock().await;
        match locks.get_mut(target_id) {
            Some(l) if l.is_held_by(holder_id) && !l.is_expired(now) => {
                l.acquired_at = now;
                l.ttl_secs = ttl_secs;
                Ok(l.clone())
            }
            _ => Err(LockError::NotHolder {
                target_id: target_id.to_string(),
                holder_id: holder_id.to_string(),
            }),
        }
    }

    async fn current(&self, target_id: &str, now: DateTime<Utc>) -> Result<Option<Lock>, LockError> {
        let locks = self.locks.lock().await;
        Ok(locks.get(target_id).filter(|l| !l.is_expired(now)).cloned())
    }
}

/// 锁协调器：绑定本机持有者 ID
#[derive(Clone)]
pub struct LockCoordinator {
    service: Arc<dyn LockService>,
    holder_id: String,
}

impl LockCoordinator {
    pub fn new(service: Arc<dyn LockService>, holder_id: impl Into<String>) -> Self {
        Self {
            service,
            holder_id: holder_id.into(),
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub async fn acquire(&self, target_id: &str, ttl_secs: u64) -> Result<Lock, LockError> {
        let lock = self
            .service
            .acquire(target_id, &self.holder_id, ttl_secs, Utc::now())
            .await?;
        info!(target_id, holder = %self.holder_id, expires_at = ?lock.expires_at(), "Target locked");
        Ok(lock)
    }

    pub async fn release(&self, target_id: &str) -> Result<(), LockError> {
        self.service.release(target_id, &self.holder_id, Utc::now()).await?;
        info!(target_id, holder = %self.holder_id, "Target lock released");
        Ok(())
    }

    pub async fn renew(&self, target_id: &str, ttl_secs: u64) -> Result<Lock, LockError> {
        self.service
            .renew(target_id, &self.holder_id, ttl_secs, Utc::now())
            .await
    }

    /// 当前持有者（未过期的锁）
    pub async fn holder(&self, target_id: &str) -> Result<Option<String>, LockError> {
        Ok(self
            .service
            .current(target_id, Utc::now())
            .await?
            .map(|l| l.holder_id))
    }
}

/// 本机锁持有者 ID：主机名 + 进程号
pub fn local_holder_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{}-{}", host, std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_concurrent_acquire_single_winner() {
        let service = Arc::new(MemoryLockService::new());
        let now = Utc::now();

        let mut handles = Vec::new();
        for i in 0..16 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                service
                    .acquire("node-a", &format!("host-{}", i), 60, now)
                    .await
                    .is_ok()
            }));
        }

        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken() {
        let service = MemoryLockService::new();
        let now = Utc::now();
        service.acquire("node-a", "host-1", 60, now).await.unwrap();

        let err = service
            .acquire("node-a", "host-2", 60, now + Duration::seconds(30))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Contention { ref holder_id, .. } if holder_id == "host-1"));

        let lock = service
            .acquire("node-a", "host-2", 60, now + Duration::seconds(61))
            .await
            .unwrap();
        assert_eq!(lock.holder_id, "host-2");
    }

    #[tokio::test]
    async fn test_release_only_by_holder() {
        let service = MemoryLockService::new();
        let now = Utc::now();
        service.acquire("node-a", "host-1", 60, now).await.unwrap();

        assert!(matches!(
            service.release("node-a", "host-2", now).await,
            Err(LockError::NotHolder { .. })
        ));
        service.release("node-a", "host-1", now).await.unwrap();
        // 再次释放为空操作
        service.release("node-a", "host-1", now).await.unwrap();
        assert!(service.current("node-a", now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_out_of_range_ttl_rejected() {
        let service = MemoryLockService::new();
        let now = Utc::now();
        for ttl in [0, u64::MAX, MAX_LOCK_TTL_SECS + 1] {
            assert!(matches!(
                service.acquire("node-a", "host-1", ttl, now).await,
                Err(LockError::InvalidTtl(t)) if t == ttl
            ));
        }
        // 被拒绝的请求不能留下一把已过期的锁
        assert!(service.current("node-a", now).await.unwrap().is_none());

        service.acquire("node-a", "host-1", 60, now).await.unwrap();
        assert!(matches!(
            service.acquire("node-a", "host-2", 60, now).await,
            Err(LockError::Contention { .. })
        ));
        assert!(matches!(
            service.renew("node-a", "host-1", u64::MAX, now).await,
            Err(LockError::InvalidTtl(_))
        ));
        // 续租失败不影响原锁
        assert!(service.current("node-a", now).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_renew_after_loss_fails() {
        let service = MemoryLockService::new();
        let now = Utc::now();
        service.acquire("node-a", "host-1", 60, now).await.unwrap();

        let renewed = service
            .renew("node-a", "host-1", 60, now + Duration::seconds(50))
            .await
            .unwrap();
        assert_eq!(renewed.acquired_at, now + Duration::seconds(50));

        // 过期后被他人获取
        let later = now + Duration::seconds(200);
        service.acquire("node-a", "host-2", 60, later).await.unwrap();
        assert!(matches!(
            service.renew("node-a", "host-1", 60, later).await,
            Err(LockError::NotHolder { .. })
        ));
    }
}
