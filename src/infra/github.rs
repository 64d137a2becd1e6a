//! GitHub contents API 客户端
//!
//! 共享节点池文件与目标锁记录都保存在同一个仓库中：
//! - 不带 sha 的 PUT 只在文件不存在时成功（create-if-absent）
//! - 带 sha 的 PUT/DELETE 只在 sha 未变化时成功（compare-and-swap）

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{constants::GITHUB_TIMEOUT_SECS, GitHubConfig};
use crate::domain::{Lock, Registry};
use crate::services::lock::{checked_ttl, LockError, LockService};
use crate::services::registry::{RegistryBackend, RegistryError, RemoteRegistry};

const API_BASE: &str = "https://api.github.com";

/// GitHub 错误
#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("github request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("github returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("cannot decode {path}: {reason}")]
    Decode { path: String, reason: String },
}

/// 写入结果
#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// 文件已存在（未带 sha）或 sha 已过期
    Conflict,
}

/// 文件内容与版本
#[derive(Debug, Clone)]
pub struct RemoteFile {
    pub sha: String,
    pub bytes: Vec<u8>,
}

#[derive(Deserialize)]
struct ContentsResponse {
    sha: String,
    #[serde(default)]
    content: String,
}

#[derive(Serialize)]
struct PutBody<'a> {
    message: &'a str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    branch: Option<&'a str>,
}

#[derive(Serialize)]
struct DeleteBody<'a> {
    message: &'a str,
    sha: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    branch: Option<&'a str>,
}

/// GitHub 客户端
#[derive(Clone)]
pub struct GitHubClient {
    client: Client,
    repo: String,
    token: String,
    branch: Option<String>,
}

impl GitHubClient {
    pub fn new(config: &GitHubConfig) -> Result<Self, GitHubError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(GITHUB_TIMEOUT_SECS))
            .user_agent(concat!("hermit-crab/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            repo: config.repo.clone(),
            token: config.token.clone(),
            branch: config.branch.clone(),
        })
    }

    pub fn contents_url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/contents/{}",
            API_BASE,
            self.repo,
            path.trim_start_matches('/')
        )
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.contents_url(path))
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    /// 读取文件，不存在时返回 None
    pub async fn get_file(&self, path: &str) -> Result<Option<RemoteFile>, GitHubError> {
        let mut req = self.request(reqwest::Method::GET, path);
        if let Some(branch) = &self.branch {
            req = req.query(&[("ref", branch)]);
        }
        let resp = req.send().await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }

        let body: ContentsResponse = resp.json().await?;
        let bytes = decode_content(&body.content).map_err(|reason| GitHubError::Decode {
            path: path.to_string(),
            reason,
        })?;
        debug!(path, sha = %body.sha, bytes = bytes.len(), "Fetched file from GitHub");
        Ok(Some(RemoteFile {
            sha: body.sha,
            bytes,
        }))
    }

    /// 写入文件；`sha` 为 None 表示仅在不存在时创建
    pub async fn put_file(
        &self,
        path: &str,
        bytes: &[u8],
        sha: Option<&str>,
        message: &str,
    ) -> Result<WriteOutcome, GitHubError> {
        let body = PutBody {
            message,
            content: STANDARD.encode(bytes),
            sha,
            branch: self.branch.as_deref(),
        };
        let resp = self
            .request(reqwest::Method::PUT, path)
            .json(&body)
            .send()
            .await?;

        match resp.status() {
            s if s.is_success() => Ok(WriteOutcome::Written),
            // 409: sha 不匹配；422: 文件已存在但未提供 sha
            StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
                debug!(path, "GitHub write conflicted");
                Ok(WriteOutcome::Conflict)
            }
            _ => Err(status_error(resp).await),
        }
    }

    pub async fn delete_file(&self, path: &str, sha: &str, message: &str) -> Result<WriteOutcome, GitHubError> {
        let body = DeleteBody {
            message,
            sha,
            branch: self.branch.as_deref(),
        };
        let resp = self
            .request(reqwest::Method::DELETE, path)
            .json(&body)
            .send()
            .await?;

        match resp.status() {
            s if s.is_success() => Ok(WriteOutcome::Written),
            StatusCode::NOT_FOUND => Ok(WriteOutcome::Written),
            StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => Ok(WriteOutcome::Conflict),
            _ => Err(status_error(resp).await),
        }
    }
}

/// contents API 的最小读写接口，锁服务只依赖这三个操作
#[async_trait]
pub trait ContentsStore: Send + Sync {
    async fn get_file(&self, path: &str) -> Result<Option<RemoteFile>, GitHubError>;

    async fn put_file(
        &self,
        path: &str,
        bytes: &[u8],
        sha: Option<&str>,
        message: &str,
    ) -> Result<WriteOutcome, GitHubError>;

    async fn delete_file(&self, path: &str, sha: &str, message: &str) -> Result<WriteOutcome, GitHubError>;
}

#[async_trait]
impl ContentsStore for GitHubClient {
    async fn get_file(&self, path: &str) -> Result<Option<RemoteFile>, GitHubError> {
        GitHubClient::get_file(self, path).await
    }

    async fn put_file(
        &self,
        path: &str,
        bytes: &[u8],
        sha: Option<&str>,
        message: &str,
    ) -> Result<WriteOutcome, GitHubError> {
        GitHubClient::put_file(self, path, bytes, sha, message).await
    }

    async fn delete_file(&self, path: &str, sha: &str, message: &str) -> Result<WriteOutcome, GitHubError> {
        GitHubClient::delete_file(self, path, sha, message).await
    }
}

async fn status_error(resp: reqwest::Response) -> GitHubError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    GitHubError::Status { status, body }
}

/// contents API 返回的 base64 内容带换行
pub fn decode_content(content: &str) -> Result<Vec<u8>, String> {
    let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD.decode(compact).map_err(|e| e.to_string())
}

/// 节点池后端
pub struct GitHubRegistryBackend {
    client: GitHubClient,
    nodes_file: String,
}

impl GitHubRegistryBackend {
    pub fn new(client: GitHubClient, nodes_file: impl Into<String>) -> Self {
        Self {
            client,
            nodes_file: nodes_file.into(),
        }
    }
}

fn registry_backend_err(e: GitHubError) -> RegistryError {
    RegistryError::Backend(e.to_string())
}

#[async_trait]
impl RegistryBackend for GitHubRegistryBackend {
    fn name(&self) -> &'static str {
        "github"
    }

    async fn pull(&self) -> Result<Option<RemoteRegistry>, RegistryError> {
        let file = match self
            .client
            .get_file(&self.nodes_file)
            .await
            .map_err(registry_backend_err)?
        {
            Some(file) => file,
            None => return Ok(None),
        };

        let registry: Registry = serde_json::from_slice(&file.bytes).map_err(|e| {
            RegistryError::Backend(format!("remote {} is not a registry: {}", self.nodes_file, e))
        })?;
        Ok(Some(RemoteRegistry {
            registry,
            revision: Some(file.sha),
        }))
    }

    async fn push(&self, registry: &Registry, base: Option<&str>) -> Result<(), RegistryError> {
        let bytes = serde_json::to_vec_pretty(registry)
            .map_err(|e| RegistryError::Backend(e.to_string()))?;
        let message = format!(
            "hermit-crab: update node registry (v{}, {} nodes)",
            registry.version,
            registry.len()
        );
        match self
            .client
            .put_file(&self.nodes_file, &bytes, base, &message)
            .await
            .map_err(registry_backend_err)?
        {
            WriteOutcome::Written => Ok(()),
            WriteOutcome::Conflict => Err(RegistryError::Conflict),
        }
    }
}

/// 锁后端：`locks/<target>.json`
pub struct GitHubLockService {
    client: Arc<dyn ContentsStore>,
}

impl GitHubLockService {
    pub fn new(client: GitHubClient) -> Self {
        Self::with_store(Arc::new(client))
    }

    pub fn with_store(client: Arc<dyn ContentsStore>) -> Self {
        Self { client }
    }

    pub fn lock_path(target_id: &str) -> String {
        format!("locks/{}.json", target_id)
    }

    /// 读取锁记录；无法解析的记录视为不存在（可被 CAS 覆盖）
    async fn read(&self, target_id: &str) -> Result<Option<(String, Option<Lock>)>, LockError> {
        let path = Self::lock_path(target_id);
        let file = self
            .client
            .get_file(&path)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(file.map(|f| {
            let lock = serde_json::from_slice::<Lock>(&f.bytes)
                .map_err(|e| warn!(path = %path, error = %e, "Unreadable lock record"))
                .ok();
            (f.sha, lock)
        }))
    }

    async fn write(&self, lock: &Lock, sha: Option<&str>, message: &str) -> Result<WriteOutcome, LockError> {
        let bytes = serde_json::to_vec_pretty(lock).map_err(|e| LockError::Backend(e.to_string()))?;
        self.client
            .put_file(&Self::lock_path(&lock.target_id), &bytes, sha, message)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))
    }
}

#[async_trait]
impl LockService for GitHubLockService {
    async fn acquire(
        &self,
        target_id: &str,
        holder_id: &str,
        ttl_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<Lock, LockError> {
        let ttl_secs = checked_ttl(ttl_secs)?;
        let existing = self.read(target_id).await?;
        let sha = match &existing {
            Some((_, Some(lock))) if !lock.is_expired(now) => {
                return Err(LockError::Contention {
                    target_id: target_id.to_string(),
                    holder_id: lock.holder_id.clone(),
                });
            }
            Some((sha, _)) => Some(sha.as_str()),
            None => None,
        };

        let lock = Lock::new(target_id, holder_id, ttl_secs, now);
        let message = format!("hermit-crab: lock {} for {}", target_id, holder_id);
        match self.write(&lock, sha, &message).await? {
            WriteOutcome::Written => {
                info!(target_id, holder_id, "Acquired lock via GitHub");
                Ok(lock)
            }
            // 其他主机抢先写入
            WriteOutcome::Conflict => Err(LockError::Contention {
                target_id: target_id.to_string(),
                holder_id: "unknown".to_string(),
            }),
        }
    }

    async fn release(&self, target_id: &str, holder_id: &str, now: DateTime<Utc>) -> Result<(), LockError> {
        let (sha, lock) = match self.read(target_id).await? {
            Some(found) => found,
            None => return Ok(()),
        };
        if let Some(lock) = &lock {
            if !lock.is_expired(now) && !lock.is_held_by(holder_id) {
                return Err(LockError::NotHolder {
                    target_id: target_id.to_string(),
                    holder_id: holder_id.to_string(),
                });
            }
        }

        let message = format!("hermit-crab: release {} by {}", target_id, holder_id);
        match self
            .client
            .delete_file(&Self::lock_path(target_id), &sha, &message)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?
        {
            WriteOutcome::Written => Ok(()),
            WriteOutcome::Conflict => {
                // 删除期间被改写：若是我们自己的过期锁被他人接管，视为已释放
                let expired_or_foreign = lock.map_or(true, |l| l.is_expired(now));
                if expired_or_foreign {
                    Ok(())
                } else {
                    Err(LockError::NotHolder {
                        target_id: target_id.to_string(),
                        holder_id: holder_id.to_string(),
                    })
                }
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
        let not_holder = || LockError::NotHolder {
            target_id: target_id.to_string(),
            holder_id: holder_id.to_string(),
        };
        let (sha, lock) = match self.read(target_id).await? {
            Some((sha, Some(lock))) => (sha, lock),
            _ => return Err(not_holder()),
        };
        if !lock.is_held_by(holder_id) || lock.is_expired(now) {
            return Err(not_holder());
        }

        let renewed = Lock::new(target_id, holder_id, ttl_secs, now);
        let message = format!("hermit-crab: renew {} for {}", target_id, holder_id);
        match self.write(&renewed, Some(&sha), &message).await? {
            WriteOutcome::Written => Ok(renewed),
            WriteOutcome::Conflict => Err(not_holder()),
        }
    }

    async fn current(&self, target_id: &str, now: DateTime<Utc>) -> Result<Option<Lock>, LockError> {
        Ok(self
            .read(target_id)
            .await?
            .and_then(|(_, lock)| lock)
            .filter(|l| !l.is_expired(now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> GitHubClient {
        GitHubClient::new(&GitHubConfig {
            repo: "acme/hermit-pool".into(),
            token: "t".into(),
            nodes_file: "nodes.json".into(),
            branch: None,
        })
        .unwrap()
    }

    #[test]
    fn test_contents_url() {
        assert_eq!(
            client().contents_url("/locks/node-a.json"),
            "https://api.github.com/repos/acme/hermit-pool/contents/locks/node-a.json"
        );
        assert_eq!(GitHubLockService::lock_path("node-a"), "locks/node-a.json");
    }

    #[test]
    fn test_decode_content_with_newlines() {
        let encoded = STANDARD.encode(br#"{"version":3}"#);
        let (a, b) = encoded.split_at(6);
        let wrapped = format!("{}\n{}\n", a, b);
        assert_eq!(decode_content(&wrapped).unwrap(), br#"{"version":3}"#.to_vec());
        assert!(decode_content("!!").is_err());
    }

    #[test]
    fn test_put_body_omits_sha_for_create() {
        let body = PutBody {
            message: "m",
            content: "e30=".into(),
            sha: None,
            branch: None,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert!(value.get("sha").is_none());
        assert!(value.get("branch").is_none());
    }

    /// 内存版 contents 存储：sha 每次写入递增，语义与 contents API 一致
    #[derive(Default)]
    struct FakeContents {
        files: tokio::sync::Mutex<std::collections::HashMap<String, RemoteFile>>,
        next_sha: std::sync::atomic::AtomicU64,
        conflicts: std::sync::atomic::AtomicU32,
        /// 下一次删除前由“其他主机”改写文件
        rewrite_before_delete: std::sync::atomic::AtomicBool,
        puts_with_sha: std::sync::atomic::AtomicU32,
    }

    impl FakeContents {
        fn sha(&self) -> String {
            let n = self.next_sha.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            format!("sha-{}", n)
        }

        fn conflict(&self) -> Result<WriteOutcome, GitHubError> {
            self.conflicts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(WriteOutcome::Conflict)
        }

        async fn raw(&self, path: &str, bytes: &[u8]) {
            let sha = self.sha();
            self.files.lock().await.insert(
                path.to_string(),
                RemoteFile {
                    sha,
                    bytes: bytes.to_vec(),
                },
            );
        }

        async fn stored(&self, target_id: &str) -> Option<Lock> {
            let files = self.files.lock().await;
            let lock = files
                .get(&GitHubLockService::lock_path(target_id))
                .and_then(|f| serde_json::from_slice(&f.bytes).ok());
            lock
        }
    }

    #[async_trait]
    impl ContentsStore for FakeContents {
        async fn get_file(&self, path: &str) -> Result<Option<RemoteFile>, GitHubError> {
            let file = self.files.lock().await.get(path).cloned();
            // 让并发的调用方都先读到同一版本
            tokio::task::yield_now().await;
            Ok(file)
        }

        async fn put_file(
            &self,
            path: &str,
            bytes: &[u8],
            sha: Option<&str>,
            _message: &str,
        ) -> Result<WriteOutcome, GitHubError> {
            let mut files = self.files.lock().await;
            let current = files.get(path).map(|f| f.sha.clone());
            match (current.as_deref(), sha) {
                (Some(_), None) | (None, Some(_)) => return self.conflict(),
                (Some(current), Some(sha)) if current != sha => return self.conflict(),
                _ => {}
            }
            if sha.is_some() {
                self.puts_with_sha.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
            files.insert(
                path.to_string(),
                RemoteFile {
                    sha: self.sha(),
                    bytes: bytes.to_vec(),
                },
            );
            Ok(WriteOutcome::Written)
        }

        async fn delete_file(&self, path: &str, sha: &str, _message: &str) -> Result<WriteOutcome, GitHubError> {
            let mut files = self.files.lock().await;
            if self
                .rewrite_before_delete
                .swap(false, std::sync::atomic::Ordering::SeqCst)
            {
                if let Some(file) = files.get_mut(path) {
                    file.sha = self.sha();
                }
            }
            let current = files.get(path).map(|f| f.sha.clone());
            match current {
                None => Ok(WriteOutcome::Written),
                Some(current) if current != sha => self.conflict(),
                Some(_) => {
                    files.remove(path);
                    Ok(WriteOutcome::Written)
                }
            }
        }
    }

    fn service() -> (Arc<FakeContents>, GitHubLockService) {
        let store = Arc::new(FakeContents::default());
        (store.clone(), GitHubLockService::with_store(store))
    }

    #[tokio::test]
    async fn test_concurrent_create_single_winner() {
        let (store, service) = service();
        let service = Arc::new(service);
        let now = Utc::now();

        let mut handles = Vec::new();
        for i in 0..8 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                service.acquire("node-a", &format!("host-{}", i), 60, now).await
            }));
        }

        let mut winners = Vec::new();
        for h in handles {
            match h.await.unwrap() {
                Ok(lock) => winners.push(lock.holder_id),
                Err(e) => assert!(matches!(e, LockError::Contention { .. }), "{}", e),
            }
        }
        assert_eq!(winners.len(), 1);
        // 全部先读到“不存在”，失败者都在不带 sha 的创建上冲突
        assert_eq!(store.conflicts.load(std::sync::atomic::Ordering::SeqCst), 7);
        assert_eq!(store.stored("node-a").await.unwrap().holder_id, winners[0]);
    }

    #[tokio::test]
    async fn test_expired_lock_replaced_via_sha() {
        let (store, service) = service();
        let now = Utc::now();
        service.acquire("node-a", "host-1", 60, now).await.unwrap();

        let err = service
            .acquire("node-a", "host-2", 60, now + chrono::Duration::seconds(30))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Contention { ref holder_id, .. } if holder_id == "host-1"));

        let lock = service
            .acquire("node-a", "host-2", 60, now + chrono::Duration::seconds(61))
            .await
            .unwrap();
        assert_eq!(lock.holder_id, "host-2");
        assert_eq!(store.puts_with_sha.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(store.stored("node-a").await.unwrap().holder_id, "host-2");
    }

    #[tokio::test]
    async fn test_unreadable_record_is_overwritten() {
        let (store, service) = service();
        store.raw(&GitHubLockService::lock_path("node-a"), b"not json").await;

        let lock = service.acquire("node-a", "host-1", 60, Utc::now()).await.unwrap();
        assert_eq!(lock.holder_id, "host-1");
        assert_eq!(store.puts_with_sha.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_renew_after_takeover_is_not_holder() {
        let (_store, service) = service();
        let now = Utc::now();
        service.acquire("node-a", "host-1", 60, now).await.unwrap();
        let renewed = service
            .renew("node-a", "host-1", 60, now + chrono::Duration::seconds(50))
            .await
            .unwrap();
        assert_eq!(renewed.acquired_at, now + chrono::Duration::seconds(50));

        let later = now + chrono::Duration::seconds(200);
        service.acquire("node-a", "host-2", 60, later).await.unwrap();
        assert!(matches!(
            service.renew("node-a", "host-1", 60, later).await,
            Err(LockError::NotHolder { .. })
        ));
        service.renew("node-a", "host-2", 60, later).await.unwrap();
        assert!(matches!(
            service.renew("node-b", "host-2", 60, later).await,
            Err(LockError::NotHolder { .. })
        ));
    }

    #[tokio::test]
    async fn test_release_only_by_holder() {
        let (store, service) = service();
        let now = Utc::now();
        service.acquire("node-a", "host-1", 60, now).await.unwrap();

        assert!(matches!(
            service.release("node-a", "host-2", now).await,
            Err(LockError::NotHolder { .. })
        ));
        assert!(store.stored("node-a").await.is_some());

        service.release("node-a", "host-1", now).await.unwrap();
        assert!(store.stored("node-a").await.is_none());
        // 不存在时为空操作
        service.release("node-a", "host-1", now).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_conflict_handling() {
        let (store, service) = service();
        let now = Utc::now();
        service.acquire("node-a", "host-1", 60, now).await.unwrap();

        // 自己的锁仍有效却在删除时被改写
        store
            .rewrite_before_delete
            .store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(matches!(
            service.release("node-a", "host-1", now).await,
            Err(LockError::NotHolder { .. })
        ));

        // 已过期的锁在删除时被接管，视为已释放
        let later = now + chrono::Duration::seconds(120);
        store
            .rewrite_before_delete
            .store(true, std::sync::atomic::Ordering::SeqCst);
        service.release("node-a", "host-1", later).await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_range_ttl_never_written() {
        let (store, service) = service();
        assert!(matches!(
            service.acquire("node-a", "host-1", u64::MAX, Utc::now()).await,
            Err(LockError::InvalidTtl(_))
        ));
        assert!(store.files.lock().await.is_empty());
    }
}
