//! Cloudflare DNS 更新
//!
//! 查询记录：不存在则创建，内容相同则跳过，否则覆盖

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{constants::DNS_TIMEOUT_SECS, CloudflareConfig};
use crate::services::dns::{DnsError, DnsUpdater};

const API_BASE: &str = "https://api.cloudflare.com/client/v4";

#[derive(Deserialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
}

#[derive(Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize, Debug)]
struct DnsRecord {
    id: String,
    content: String,
}

#[derive(Serialize)]
struct RecordBody<'a> {
    #[serde(rename = "type")]
    record_type: &'a str,
    name: &'a str,
    content: &'a str,
    ttl: u32,
    proxied: bool,
}

/// 按地址族选择记录类型
pub fn record_type_for(address: &str) -> Result<&'static str, DnsError> {
    match address.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => Ok("A"),
        Ok(IpAddr::V6(_)) => Ok("AAAA"),
        Err(_) => Err(DnsError::InvalidAddress(address.to_string())),
    }
}

/// Cloudflare DNS 客户端
pub struct CloudflareDns {
    client: Client,
    zone_id: String,
    token: String,
    ttl: u32,
}

impl CloudflareDns {
    pub fn new(config: &CloudflareConfig) -> Result<Self, DnsError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DNS_TIMEOUT_SECS))
            .build()
            .map_err(|e| DnsError::Request(e.to_string()))?;
        Ok(Self {
            client,
            zone_id: config.zone_id.clone(),
            token: config.token.clone(),
            ttl: config.ttl,
        })
    }

    fn records_url(&self) -> String {
        format!("{}/zones/{}/dns_records", API_BASE, self.zone_id)
    }

    async fn find(&self, record_type: &str, name: &str) -> Result<Option<DnsRecord>, DnsError> {
        let resp = self
            .client
            .get(self.records_url())
            .bearer_auth(&self.token)
            .query(&[("type", record_type), ("name", name)])
            .send()
            .await
            .map_err(|e| DnsError::Request(e.to_string()))?;
        let body: ApiResponse<Vec<DnsRecord>> = resp
            .json()
            .await
            .map_err(|e| DnsError::Request(e.to_string()))?;
        check(&body)?;
        Ok(body.result.and_then(|records| records.into_iter().next()))
    }

    async fn write(&self, existing: Option<&DnsRecord>, body: &RecordBody<'_>) -> Result<(), DnsError> {
        let req = match existing {
            Some(record) => self
                .client
                .put(format!("{}/{}", self.records_url(), record.id)),
            None => self.client.post(self.records_url()),
        };
        let resp = req
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .map_err(|e| DnsError::Request(e.to_string()))?;
        let body: ApiResponse<serde_json::Value> = resp
            .json()
            .await
            .map_err(|e| DnsError::Request(e.to_string()))?;
        check(&body)
    }
}

fn check<T>(body: &ApiResponse<T>) -> Result<(), DnsError> {
    if body.success {
        return Ok(());
    }
    let detail = body
        .errors
        .iter()
        .map(|e| format!("{}: {}", e.code, e.message))
        .collect::<Vec<_>>()
        .join("; ");
    Err(DnsError::Rejected(detail))
}

#[async_trait]
impl DnsUpdater for CloudflareDns {
    async fn upsert(&self, record_name: &str, address: &str) -> Result<(), DnsError> {
        let record_type = record_type_for(address)?;
        let existing = self.find(record_type, record_name).await?;

        if let Some(record) = &existing {
            if record.content == address {
                debug!(record = record_name, address, "DNS record already up to date");
                return Ok(());
            }
        }

        let body = RecordBody {
            record_type,
            name: record_name,
            content: address,
            ttl: self.ttl,
            proxied: false,
        };
        self.write(existing.as_ref(), &body).await?;

        info!(
            record = record_name,
            address,
            previous = existing.as_ref().map(|r| r.content.as_str()).unwrap_or("-"),
            "DNS record updated"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_type_for_address() {
        assert_eq!(record_type_for("203.0.113.7").unwrap(), "A");
        assert_eq!(record_type_for("2001:db8::7").unwrap(), "AAAA");
        assert!(matches!(
            record_type_for("host.example.com"),
            Err(DnsError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_api_error_is_rejected() {
        let body: ApiResponse<Vec<DnsRecord>> = serde_json::from_str(
            r#"{"success":false,"errors":[{"code":9109,"message":"Invalid access token"}],"result":null}"#,
        )
        .unwrap();
        match check(&body) {
            Err(DnsError::Rejected(msg)) => assert!(msg.contains("9109")),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
