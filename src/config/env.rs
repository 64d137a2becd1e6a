//! 环境变量配置加载
//!
//! 所有选项都有类型和默认值，启动时一次性校验

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

use super::credentials::SshPasswords;
use super::exclude::{load_exclusion_file, push_unique, validate_exclusions};
use crate::domain::LeaseThresholds;

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key} ({value:?}): {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
    #[error("missing required setting {0}")]
    Missing(String),
    #[error("cannot read exclusion file {}: {source}", .path.display())]
    ExcludeFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub fn invalid(key: &str, value: &str, reason: &str) -> Self {
        ConfigError::Invalid {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// 配置变量来源
pub type Vars = HashMap<String, String>;

/// Agent 配置
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// 安装目录
    pub install_path: PathBuf,
    /// 对外服务域名（切换时必需）
    pub domain: Option<String>,
    /// 本机地址
    pub address: Option<String>,
    pub lease: LeaseConfig,
    pub transfer: TransferConfig,
    pub ssh: SshConfig,
    pub migration: MigrationConfig,
    /// GitHub 节点池同步（可选）
    pub github: Option<GitHubConfig>,
    /// Cloudflare DNS（可选）
    pub cloudflare: Option<CloudflareConfig>,
    /// 邮件通知（可选）
    pub notification: Option<NotificationConfig>,
    pub daemon: DaemonConfig,
}

/// 租期配置
#[derive(Clone, Debug)]
pub struct LeaseConfig {
    pub total_days: i64,
    pub migrate_threshold: i64,
    pub warning_days: i64,
    pub critical_days: i64,
    pub minimum_gain_days: i64,
    pub check_interval_secs: u64,
    /// 墓碑保留天数
    pub tombstone_retention_days: i64,
}

/// 传输配置
#[derive(Clone, Debug)]
pub struct TransferConfig {
    pub exclude_file: PathBuf,
    /// 排除项（文件 + 额外项 + 内置运行目录）
    pub exclusions: Vec<String>,
    /// 以 tar 流传输的目录
    pub stream_dirs: Vec<String>,
    /// 带宽限制 KiB/s，0 表示不限
    pub bandwidth_limit_kbps: u64,
    pub timeout_secs: u64,
    pub verify_timeout_secs: u64,
    /// 目标机上需要保留的网络身份文件
    pub preserve_paths: Vec<String>,
}

/// SSH 配置
#[derive(Clone, Debug)]
pub struct SshConfig {
    pub user: String,
    pub key_path: PathBuf,
    pub connect_timeout_secs: u64,
    /// 首次连接用的口令，装好密钥后不再使用
    pub passwords: SshPasswords,
}

/// 源主机退役方式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetireMode {
    /// 从节点池删除
    Remove,
    /// 标记为 dead
    Dead,
}

impl FromStr for RetireMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "remove" => Ok(RetireMode::Remove),
            "dead" => Ok(RetireMode::Dead),
            other => Err(format!("unknown retire mode: {}", other)),
        }
    }
}

/// 迁移流程配置
#[derive(Clone, Debug)]
pub struct MigrationConfig {
    pub max_retries: u32,
    /// 重试退避基数（秒）
    pub retry_interval_secs: u64,
    pub lock_ttl_secs: u64,
    pub max_lock_attempts: u32,
    pub probe_retries: u32,
    pub retire_mode: RetireMode,
    pub skip_reboot: bool,
    pub startup_wait_secs: u64,
    /// 目标机上的 agent 可执行文件
    pub agent_bin: String,
}

/// GitHub 配置
#[derive(Clone, Debug)]
pub struct GitHubConfig {
    /// owner/repo
    pub repo: String,
    pub token: String,
    pub nodes_file: String,
    pub branch: Option<String>,
}

/// Cloudflare 配置
#[derive(Clone, Debug)]
pub struct CloudflareConfig {
    pub zone_id: String,
    pub token: String,
    pub ttl: u32,
    /// 切换后指向旧主机的记录名
    pub retired_record: Option<String>,
}

/// 通知配置
#[derive(Clone, Debug)]
pub struct NotificationConfig {
    pub api_key: String,
    pub from: String,
    pub to: Vec<String>,
}

/// 守护进程配置
#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub service_unit: String,
    pub status_port: Option<u16>,
}

impl AgentConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: Vars = env::vars().collect();
        Self::from_vars(&vars)
    }

    /// 从给定变量表加载配置并校验
    pub fn from_vars(vars: &Vars) -> Result<Self, ConfigError> {
        let install_path = PathBuf::from(
            get(vars, "HERMIT_INSTALL_PATH").unwrap_or_else(|| "/opt/hermit-crab".to_string()),
        );
        let domain = get(vars, "HERMIT_CURRENT_DOMAIN");
        let address = get(vars, "HERMIT_CURRENT_ADDRESS");

        let config = Self {
            lease: LeaseConfig::from_vars(vars)?,
            transfer: TransferConfig::from_vars(vars, &install_path)?,
            ssh: SshConfig::from_vars(vars)?,
            migration: MigrationConfig::from_vars(vars, &install_path)?,
            github: GitHubConfig::from_vars(vars)?,
            cloudflare: CloudflareConfig::from_vars(vars)?,
            notification: NotificationConfig::from_vars(vars)?,
            daemon: DaemonConfig::from_vars(vars)?,
            install_path,
            domain,
            address,
        };
        config.validate()?;
        Ok(config)
    }

    /// 交叉校验
    pub fn validate(&self) -> Result<(), ConfigError> {
        let lease = &self.lease;
        if lease.total_days <= 0 {
            return Err(ConfigError::invalid(
                "HERMIT_TOTAL_DAYS",
                &lease.total_days.to_string(),
                "lease duration must be positive",
            ));
        }
        if lease.migrate_threshold >= lease.total_days {
            return Err(ConfigError::invalid(
                "HERMIT_MIGRATE_THRESHOLD",
                &lease.migrate_threshold.to_string(),
                "threshold must be shorter than the lease",
            ));
        }
        if lease.migrate_threshold < 0 || lease.critical_days < 0 || lease.warning_days < 0 {
            return Err(ConfigError::invalid(
                "HERMIT_MIGRATE_THRESHOLD",
                &lease.migrate_threshold.to_string(),
                "thresholds must not be negative",
            ));
        }
        if lease.check_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "HERMIT_CHECK_INTERVAL",
                "0",
                "check interval must be positive",
            ));
        }
        let ttl = self.migration.lock_ttl_secs;
        if !(constants::MIN_LOCK_TTL_SECS..=constants::MAX_LOCK_TTL_SECS).contains(&ttl) {
            return Err(ConfigError::invalid(
                "HERMIT_LOCK_TTL",
                &ttl.to_string(),
                &format!(
                    "lock ttl must be between {} and {} seconds",
                    constants::MIN_LOCK_TTL_SECS,
                    constants::MAX_LOCK_TTL_SECS
                ),
            ));
        }
        if self.migration.max_retries == 0 {
            return Err(ConfigError::invalid(
                "HERMIT_MAX_RETRIES",
                "0",
                "at least one transfer attempt is required",
            ));
        }
        if let Some(bad) = self.transfer.stream_dirs.iter().find(|d| !d.starts_with('/')) {
            return Err(ConfigError::invalid(
                "HERMIT_STREAM_DIRS",
                bad,
                "stream directories must be absolute",
            ));
        }
        validate_exclusions(&self.transfer.exclusions)
    }

    /// 切换需要服务域名
    pub fn require_domain(&self) -> Result<&str, ConfigError> {
        self.domain
            .as_deref()
            .ok_or_else(|| ConfigError::Missing("HERMIT_CURRENT_DOMAIN".to_string()))
    }

    /// 数据目录（租期状态、节点池副本）
    pub fn data_dir(&self) -> PathBuf {
        self.install_path.join("data")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.install_path.join("logs")
    }

    /// 运行期目录（pid 文件），不参与传输
    pub fn run_dir(&self) -> PathBuf {
        self.install_path.join("run")
    }

    pub fn lease_file(&self) -> PathBuf {
        self.data_dir().join("lease.json")
    }

    pub fn registry_file(&self) -> PathBuf {
        self.data_dir().join("nodes.json")
    }

    /// 校验标记文件
    pub fn marker_file(&self) -> PathBuf {
        self.data_dir().join("migration.marker")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.run_dir().join("hermit-crab.pid")
    }

    pub fn thresholds(&self) -> LeaseThresholds {
        LeaseThresholds {
            warning_days: self.lease.warning_days,
            critical_days: self.lease.critical_days,
            migrate_days: self.lease.migrate_threshold,
        }
    }
}

impl LeaseConfig {
    pub fn from_vars(vars: &Vars) -> Result<Self, ConfigError> {
        let migrate_threshold = parse_or(vars, "HERMIT_MIGRATE_THRESHOLD", 5)?;
        Ok(Self {
            total_days: parse_or(vars, "HERMIT_TOTAL_DAYS", 15)?,
            migrate_threshold,
            warning_days: parse_or(vars, "HERMIT_WARNING_DAYS", 10)?,
            critical_days: parse_or(vars, "HERMIT_CRITICAL_DAYS", migrate_threshold)?,
            minimum_gain_days: parse_or(vars, "HERMIT_MINIMUM_GAIN_DAYS", 1)?,
            check_interval_secs: parse_or(vars, "HERMIT_CHECK_INTERVAL", 3600)?,
            tombstone_retention_days: parse_or(vars, "HERMIT_TOMBSTONE_RETENTION_DAYS", 30)?,
        })
    }
}

impl TransferConfig {
    pub fn from_vars(vars: &Vars, install_path: &std::path::Path) -> Result<Self, ConfigError> {
        let explicit_file = get(vars, "HERMIT_EXCLUDE_FILE");
        let exclude_file = explicit_file
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| install_path.join("config").join("exclude_list.txt"));

        let mut exclusions = load_exclusion_file(&exclude_file, explicit_file.is_some())?;
        for extra in list(vars, "HERMIT_EXCLUDE_PATHS") {
            push_unique(&mut exclusions, &extra);
        }
        if !exclusions.is_empty() {
            // pid 文件所在目录不能复制到目标机
            let run_dir = install_path.join("run");
            push_unique(&mut exclusions, &run_dir.to_string_lossy());
        }

        let preserve_paths = if vars.contains_key("HERMIT_PRESERVE_PATHS") {
            list(vars, "HERMIT_PRESERVE_PATHS")
        } else {
            constants::DEFAULT_PRESERVE_PATHS
                .iter()
                .map(|p| p.to_string())
                .collect()
        };

        Ok(Self {
            exclude_file,
            exclusions,
            stream_dirs: list(vars, "HERMIT_STREAM_DIRS"),
            bandwidth_limit_kbps: parse_or(vars, "HERMIT_RSYNC_BANDWIDTH_LIMIT", 0)?,
            timeout_secs: parse_or(vars, "HERMIT_RSYNC_TIMEOUT", 7200)?,
            verify_timeout_secs: parse_or(vars, "HERMIT_VERIFY_TIMEOUT", 60)?,
            preserve_paths,
        })
    }
}

impl SshConfig {
    pub fn from_vars(vars: &Vars) -> Result<Self, ConfigError> {
        Ok(Self {
            user: get(vars, "HERMIT_SSH_USER").unwrap_or_else(|| "root".to_string()),
            key_path: PathBuf::from(
                get(vars, "HERMIT_SSH_KEY_PATH")
                    .unwrap_or_else(|| "/root/.ssh/hermit_crab_id_rsa".to_string()),
            ),
            connect_timeout_secs: parse_or(vars, "HERMIT_SSH_TIMEOUT", 30)?,
            passwords: SshPasswords::parse(
                get(vars, "HERMIT_SSH_PASSWORD").as_deref(),
                get(vars, "HERMIT_SSH_PASSWORD_MAP").as_deref(),
            )?,
        })
    }
}

impl MigrationConfig {
    pub fn from_vars(vars: &Vars, install_path: &std::path::Path) -> Result<Self, ConfigError> {
        let agent_bin = get(vars, "HERMIT_AGENT_BIN").unwrap_or_else(|| {
            install_path
                .join("bin")
                .join("hermit-crab")
                .to_string_lossy()
                .to_string()
        });
        Ok(Self {
            max_retries: parse_or(vars, "HERMIT_MAX_RETRIES", 3)?,
            retry_interval_secs: parse_or(vars, "HERMIT_RETRY_INTERVAL", 30)?,
            lock_ttl_secs: parse_or(vars, "HERMIT_LOCK_TTL", 10_800)?,
            max_lock_attempts: parse_or(vars, "HERMIT_MAX_LOCK_ATTEMPTS", 3)?,
            probe_retries: parse_or(vars, "HERMIT_PROBE_RETRIES", 2)?,
            retire_mode: parse_or(vars, "HERMIT_RETIRE_MODE", RetireMode::Remove)?,
            skip_reboot: flag(vars, "HERMIT_SKIP_REBOOT", false),
            startup_wait_secs: parse_or(vars, "HERMIT_STARTUP_WAIT", 120)?,
            agent_bin,
        })
    }
}

impl GitHubConfig {
    pub fn from_vars(vars: &Vars) -> Result<Option<Self>, ConfigError> {
        if !flag(vars, "HERMIT_GITHUB_ENABLED", false) {
            return Ok(None);
        }
        let repo = require(vars, "HERMIT_GITHUB_REPO")?;
        if repo.split('/').filter(|s| !s.is_empty()).count() != 2 {
            return Err(ConfigError::invalid("HERMIT_GITHUB_REPO", &repo, "expected owner/repo"));
        }
        let token = load_with_fallback(vars, "HERMIT_GITHUB_TOKEN", "GITHUB_TOKEN")
            .ok_or_else(|| ConfigError::Missing("HERMIT_GITHUB_TOKEN".to_string()))?;
        Ok(Some(Self {
            repo,
            token,
            nodes_file: get(vars, "HERMIT_GITHUB_NODES_FILE")
                .unwrap_or_else(|| "nodes.json".to_string()),
            branch: get(vars, "HERMIT_GITHUB_BRANCH"),
        }))
    }
}

impl CloudflareConfig {
    pub fn from_vars(vars: &Vars) -> Result<Option<Self>, ConfigError> {
        if !flag(vars, "HERMIT_CF_ENABLED", false) {
            return Ok(None);
        }
        let token = load_with_fallback(vars, "HERMIT_CF_TOKEN", "CLOUDFLARE_API_TOKEN")
            .ok_or_else(|| ConfigError::Missing("HERMIT_CF_TOKEN".to_string()))?;
        Ok(Some(Self {
            zone_id: require(vars, "HERMIT_CF_ZONE_ID")?,
            token,
            ttl: parse_or(vars, "HERMIT_CF_TTL", 120)?,
            retired_record: get(vars, "HERMIT_CF_RETIRED_RECORD"),
        }))
    }
}

impl NotificationConfig {
    pub fn from_vars(vars: &Vars) -> Result<Option<Self>, ConfigError> {
        if !flag(vars, "HERMIT_NOTIFICATION_ENABLED", false) {
            return Ok(None);
        }
        let to = list(vars, "HERMIT_NOTIFICATION_TO");
        if to.is_empty() {
            return Err(ConfigError::Missing("HERMIT_NOTIFICATION_TO".to_string()));
        }
        Ok(Some(Self {
            api_key: require(vars, "HERMIT_RESEND_API_KEY")?,
            from: get(vars, "HERMIT_NOTIFICATION_FROM")
                .unwrap_or_else(|| "hermit-crab@localhost".to_string()),
            to,
        }))
    }
}

impl DaemonConfig {
    pub fn from_vars(vars: &Vars) -> Result<Self, ConfigError> {
        let status_port = match get(vars, "HERMIT_STATUS_PORT") {
            Some(v) => Some(
                v.parse()
                    .map_err(|_| ConfigError::invalid("HERMIT_STATUS_PORT", &v, "not a port"))?,
            ),
            None => None,
        };
        Ok(Self {
            service_unit: get(vars, "HERMIT_SERVICE_UNIT")
                .unwrap_or_else(|| "hermit-crab-daemon.service".to_string()),
            status_port,
        })
    }
}

/// 读取非空变量
fn get(vars: &Vars, key: &str) -> Option<String> {
    vars.get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn require(vars: &Vars, key: &str) -> Result<String, ConfigError> {
    get(vars, key).ok_or_else(|| ConfigError::Missing(key.to_string()))
}

/// 解析变量，未设置时使用默认值；格式错误直接报错
fn parse_or<T: FromStr>(vars: &Vars, key: &str, default: T) -> Result<T, ConfigError> {
    match get(vars, key) {
        Some(v) => v
            .parse()
            .map_err(|_| ConfigError::invalid(key, &v, "cannot parse value")),
        None => Ok(default),
    }
}

fn flag(vars: &Vars, key: &str, default: bool) -> bool {
    get(vars, key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

/// 逗号分隔列表
fn list(vars: &Vars, key: &str) -> Vec<String> {
    get(vars, key)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// 加载变量，支持 fallback
fn load_with_fallback(vars: &Vars, primary: &str, fallback: &str) -> Option<String> {
    let value = get(vars, primary);
    if value.is_none() && get(vars, fallback).is_some() {
        warn!(primary, fallback, "Using fallback environment variable");
    }
    value.or_else(|| get(vars, fallback))
}

/// 常量
pub mod constants {
    /// 目标机默认保留的网络身份文件
    pub const DEFAULT_PRESERVE_PATHS: &[&str] = &[
        "/etc/fstab",
        "/etc/hostname",
        "/etc/hosts",
        "/etc/netplan",
        "/etc/network/interfaces",
    ];

    /// 目标机上保存网络身份备份的目录
    pub const PRESERVE_BACKUP_DIR: &str = "/root/.hermit-preserve";

    /// DNS 请求超时（秒）
    pub const DNS_TIMEOUT_SECS: u64 = 30;

    /// GitHub 请求超时（秒）
    pub const GITHUB_TIMEOUT_SECS: u64 = 30;

    /// 目标锁 TTL 下限（秒）：续租周期为 TTL/3，一次续租最长耗时 GITHUB_TIMEOUT_SECS
    pub const MIN_LOCK_TTL_SECS: u64 = 3 * GITHUB_TIMEOUT_SECS;

    /// 目标锁 TTL 上限（秒）
    pub const MAX_LOCK_TTL_SECS: u64 = 7 * 24 * 3600;

    /// 节点池同步最大尝试次数（推送冲突时重试）
    pub const SYNC_ATTEMPTS: u32 = 3;

    /// 版本号
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn vars_with_excludes(extra: &[(&str, &str)]) -> (tempfile::NamedTempFile, Vars) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# defaults\n/proc\n/sys\n/dev").unwrap();
        let mut vars = Vars::new();
        vars.insert(
            "HERMIT_EXCLUDE_FILE".into(),
            file.path().to_string_lossy().to_string(),
        );
        vars.insert("HERMIT_INSTALL_PATH".into(), "/opt/hc".into());
        for (k, v) in extra {
            vars.insert(k.to_string(), v.to_string());
        }
        (file, vars)
    }

    #[test]
    fn test_defaults() {
        let (_file, vars) = vars_with_excludes(&[]);
        let config = AgentConfig::from_vars(&vars).unwrap();

        assert_eq!(config.lease.total_days, 15);
        assert_eq!(config.lease.migrate_threshold, 5);
        assert_eq!(config.lease.critical_days, 5);
        assert_eq!(config.lease.warning_days, 10);
        assert_eq!(config.migration.retire_mode, RetireMode::Remove);
        assert_eq!(config.migration.agent_bin, "/opt/hc/bin/hermit-crab");
        assert_eq!(config.ssh.user, "root");
        assert!(config.ssh.passwords.is_empty());
        assert!(config.github.is_none());
        assert!(config.cloudflare.is_none());
        assert_eq!(
            config.transfer.exclusions,
            vec!["/proc", "/sys", "/dev", "/opt/hc/run"]
        );
        assert_eq!(config.lease_file(), PathBuf::from("/opt/hc/data/lease.json"));
    }

    #[test]
    fn test_critical_defaults_to_migrate_threshold() {
        let (_file, vars) = vars_with_excludes(&[("HERMIT_MIGRATE_THRESHOLD", "3")]);
        let config = AgentConfig::from_vars(&vars).unwrap();
        assert_eq!(config.lease.critical_days, 3);
    }

    #[test]
    fn test_malformed_number_is_error() {
        let (_file, vars) = vars_with_excludes(&[("HERMIT_TOTAL_DAYS", "fifteen")]);
        let err = AgentConfig::from_vars(&vars).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "HERMIT_TOTAL_DAYS"));
    }

    #[test]
    fn test_lock_ttl_bounds() {
        for bad in ["0", "30", "18446744073709551615", "604801"] {
            let (_file, vars) = vars_with_excludes(&[("HERMIT_LOCK_TTL", bad)]);
            let err = AgentConfig::from_vars(&vars).unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid { ref key, .. } if key == "HERMIT_LOCK_TTL"),
                "ttl {} accepted",
                bad
            );
        }
        let (_file, vars) = vars_with_excludes(&[("HERMIT_LOCK_TTL", "90")]);
        assert_eq!(AgentConfig::from_vars(&vars).unwrap().migration.lock_ttl_secs, 90);
    }

    #[test]
    fn test_ssh_passwords_from_env() {
        let (_file, vars) = vars_with_excludes(&[
            ("HERMIT_SSH_PASSWORD", "common"),
            ("HERMIT_SSH_PASSWORD_MAP", "10.0.0.2:special"),
        ]);
        let config = AgentConfig::from_vars(&vars).unwrap();
        assert_eq!(config.ssh.passwords.password_for("10.0.0.2"), Some("special"));
        assert_eq!(config.ssh.passwords.password_for("10.0.0.3"), Some("common"));

        let (_file, vars) = vars_with_excludes(&[("HERMIT_SSH_PASSWORD_MAP", "10.0.0.2")]);
        assert!(AgentConfig::from_vars(&vars).is_err());
    }

    #[test]
    fn test_threshold_must_be_below_lease() {
        let (_file, vars) = vars_with_excludes(&[
            ("HERMIT_TOTAL_DAYS", "5"),
            ("HERMIT_MIGRATE_THRESHOLD", "5"),
        ]);
        assert!(AgentConfig::from_vars(&vars).is_err());

        let (_file, vars) = vars_with_excludes(&[("HERMIT_TOTAL_DAYS", "0")]);
        assert!(AgentConfig::from_vars(&vars).is_err());
    }

    #[test]
    fn test_enabled_backend_requires_credentials() {
        let (_file, vars) = vars_with_excludes(&[
            ("HERMIT_GITHUB_ENABLED", "true"),
            ("HERMIT_GITHUB_REPO", "acme/pool"),
        ]);
        assert!(matches!(
            AgentConfig::from_vars(&vars),
            Err(ConfigError::Missing(ref k)) if k == "HERMIT_GITHUB_TOKEN"
        ));

        let (_file, vars) = vars_with_excludes(&[
            ("HERMIT_GITHUB_ENABLED", "1"),
            ("HERMIT_GITHUB_REPO", "acme/pool"),
            ("GITHUB_TOKEN", "ghp_x"),
        ]);
        let config = AgentConfig::from_vars(&vars).unwrap();
        let github = config.github.unwrap();
        assert_eq!(github.token, "ghp_x");
        assert_eq!(github.nodes_file, "nodes.json");

        let (_file, vars) = vars_with_excludes(&[("HERMIT_CF_ENABLED", "true")]);
        assert!(AgentConfig::from_vars(&vars).is_err());
    }

    #[test]
    fn test_empty_exclusion_set_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut vars = Vars::new();
        vars.insert(
            "HERMIT_INSTALL_PATH".into(),
            dir.path().to_string_lossy().to_string(),
        );
        assert!(AgentConfig::from_vars(&vars).is_err());

        // 只有额外排除项也可以
        vars.insert("HERMIT_EXCLUDE_PATHS".into(), "/proc, /sys".into());
        let config = AgentConfig::from_vars(&vars).unwrap();
        assert_eq!(&config.transfer.exclusions[..2], &["/proc", "/sys"]);
    }

    #[test]
    fn test_load_with_fallback() {
        let mut vars = Vars::new();
        vars.insert("TEST_PRIMARY".into(), "primary_value".into());
        vars.insert("TEST_FALLBACK".into(), "fallback_value".into());
        assert_eq!(
            load_with_fallback(&vars, "TEST_PRIMARY", "TEST_FALLBACK"),
            Some("primary_value".to_string())
        );

        vars.remove("TEST_PRIMARY");
        assert_eq!(
            load_with_fallback(&vars, "TEST_PRIMARY", "TEST_FALLBACK"),
            Some("fallback_value".to_string())
        );

        vars.remove("TEST_FALLBACK");
        assert_eq!(load_with_fallback(&vars, "TEST_PRIMARY", "TEST_FALLBACK"), None);
    }
}
