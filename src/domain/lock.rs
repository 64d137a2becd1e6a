//! 目标主机锁

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 对目标节点的独占声明
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lock {
    pub target_id: String,
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl Lock {
    pub fn new(target_id: &str, holder_id: &str, ttl_secs: u64, now: DateTime<Utc>) -> Self {
        Self {
            target_id: target_id.to_string(),
            holder_id: holder_id.to_string(),
            acquired_at: now,
            ttl_secs,
        }
    }

    /// TTL 超出 chrono 可表示范围时为 None
    pub fn ttl(&self) -> Option<Duration> {
        i64::try_from(self.ttl_secs).ok().and_then(Duration::try_seconds)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.ttl().and_then(|ttl| self.acquired_at.checked_add_signed(ttl))
    }

    /// now - acquired_at > ttl 即视为已释放，与持有者是否存活无关
    ///
    /// 无法表示的 TTL 只可能来自损坏的记录，按无法解析的记录处理（视为已释放）
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at() {
            Some(expires_at) => now > expires_at,
            None => true,
        }
    }

    pub fn is_held_by(&self, holder_id: &str) -> bool {
        self.holder_id == holder_id
    }
}
