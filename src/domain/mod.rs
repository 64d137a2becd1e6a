//! 领域模型模块
//!
//! 纯数据结构，不依赖 axum/tokio

pub mod lease;
pub mod lock;
pub mod migration;
pub mod node;

// Re-exports for convenience
pub use lease::{LeaseClass, LeaseState, LeaseStatus, LeaseThresholds, MigrationRecord};
pub use lock::Lock;
pub use migration::{
    InvalidTransition, MigrationPhase, MigrationSession, PhaseOutcome, PhaseRecord, TransferProgress,
};
pub use node::{floor_days, node_id_for, Node, NodeStatus, Registry, RegistryEntryError};
