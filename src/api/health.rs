//! 健康检查和租期状态 API
//!
//! 包含 /health, /status 端点

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use crate::config::constants::VERSION;
use crate::domain::{LeaseStatus, MigrationPhase, NodeStatus};
use crate::error::ApiResult;
use crate::state::AgentState;

/// 健康检查响应
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    timestamp: String,
    uptime_secs: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_check: Option<String>,
}

/// 最近一次迁移摘要
#[derive(Debug, Serialize)]
struct SessionSummary {
    id: String,
    phase: MigrationPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    ended_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// 节点池计数
#[derive(Debug, Default, Serialize)]
struct PoolSummary {
    total: usize,
    idle: usize,
    active: usize,
    transferring: usize,
    dead: usize,
}

/// 状态响应
#[derive(Debug, Serialize)]
struct StatusResponse {
    lease: LeaseStatus,
    pool: PoolSummary,
    registry_backend: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_session: Option<SessionSummary>,
}

/// 创建健康检查路由
pub fn router() -> Router<Arc<AgentState>> {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(lease_status))
}

/// 健康检查 - 返回版本、运行时间、最近检查时间
///
/// GET /health
async fn health_check(State(state): State<Arc<AgentState>>) -> impl IntoResponse {
    let now = Utc::now();
    Json(HealthResponse {
        status: "ok",
        service: "hermit-crab",
        version: VERSION,
        timestamp: now.to_rfc3339(),
        uptime_secs: (now - state.started_at).num_seconds(),
        last_check: state.last_check.read().await.map(|t| t.to_rfc3339()),
    })
}

/// 租期与节点池状态
///
/// GET /status
async fn lease_status(State(state): State<Arc<AgentState>>) -> ApiResult<Json<StatusResponse>> {
    let now = Utc::now();
    let lease = state.lease.status(now).await?;

    let mut pool = PoolSummary::default();
    for node in state.registry.list().await {
        pool.total += 1;
        match node.status {
            NodeStatus::Idle => pool.idle += 1,
            NodeStatus::Active => pool.active += 1,
            NodeStatus::Transferring => pool.transferring += 1,
            NodeStatus::Dead => pool.dead += 1,
        }
    }

    let last_session = state.last_session.read().await.as_ref().map(|s| SessionSummary {
        id: s.id.to_string(),
        phase: s.phase,
        target: s.target_address().map(str::to_string),
        started_at: s.started_at.to_rfc3339(),
        ended_at: s.ended_at.map(|t| t.to_rfc3339()),
        error: s.error.clone(),
    });

    Ok(Json(StatusResponse {
        lease,
        pool,
        registry_backend: state.registry.backend_name(),
        last_session,
    }))
}
