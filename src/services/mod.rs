//! 服务层模块
//!
//! 租期、节点池、锁、传输与迁移编排；外部系统通过 trait 接入

pub mod daemon;
pub mod dns;
pub mod guard;
pub mod lease;
pub mod lock;
pub mod notify;
pub mod orchestrator;
pub mod persistence;
pub mod registry;
pub mod remote;
pub mod supervisor;
pub mod transfer;

pub use lease::LeaseTracker;
pub use lock::LockCoordinator;
pub use orchestrator::{MigrationOrchestrator, MigrationRequest};
pub use registry::NodeRegistry;
pub use transfer::TransferEngine;
