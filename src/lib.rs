//! hermit-crab - 租期驱动的主机迁移代理
//!
//! 服务运行在一串短租期主机上，租期将尽时把整机状态克隆到节点池中租期最长的空闲主机，
//! 切换 DNS 并在目标机上接管

pub mod api;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
pub mod logging;
pub mod services;
pub mod state;

pub use config::AgentConfig;
pub use error::AgentError;
pub use state::AgentState;
