//! API 模块
//!
//! 只读状态端点，仅读取本地状态

pub mod health;

use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::state::AgentState;

/// 构建状态端点路由
pub fn router(state: Arc<AgentState>) -> Router {
    Router::new()
        .merge(health::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
