//! 基础设施层
//!
//! 外部命令与第三方 API 的薄适配器

pub mod cloudflare;
pub mod command;
pub mod github;
pub mod resend;
pub mod ssh;
pub mod systemd;

pub use cloudflare::CloudflareDns;
pub use command::{CommandError, CommandResult, CommandRunner};
pub use github::{GitHubClient, GitHubLockService, GitHubRegistryBackend};
pub use resend::ResendNotifier;
pub use ssh::SshChannel;
pub use systemd::SystemdSupervisor;
