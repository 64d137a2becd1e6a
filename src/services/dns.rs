//! DNS 更新接口

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

/// DNS 错误
#[derive(Debug, Error)]
pub enum DnsError {
    #[error("dns request failed: {0}")]
    Request(String),
    #[error("dns provider rejected update: {0}")]
    Rejected(String),
    #[error("invalid address for dns record: {0}")]
    InvalidAddress(String),
}

/// DNS 记录更新
///
/// `upsert` 幂等：记录已指向该地址时不写入
#[async_trait]
pub trait DnsUpdater: Send + Sync {
    async fn upsert(&self, record_name: &str, address: &str) -> Result<(), DnsError>;
}

/// 未配置 DNS 时使用：只记录日志，由运维自行切换
pub struct ManualDns;

#[async_trait]
impl DnsUpdater for ManualDns {
    async fn upsert(&self, record_name: &str, address: &str) -> Result<(), DnsError> {
        warn!(
            record = record_name,
            address, "DNS backend disabled, point the record at the new host manually"
        );
        Ok(())
    }
}
