//! 配置模块
//!
//! 环境变量解析、排除列表与启动校验

pub mod credentials;
pub mod env;
pub mod exclude;

pub use credentials::SshPasswords;
pub use env::{
    constants, AgentConfig, CloudflareConfig, ConfigError, DaemonConfig, GitHubConfig,
    LeaseConfig, MigrationConfig, NotificationConfig, RetireMode, SshConfig, TransferConfig,
};
pub use exclude::parse_exclusions;
