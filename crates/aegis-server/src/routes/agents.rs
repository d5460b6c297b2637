// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::Result;
use crate::state::AppState;
use aegis_server_core::{Agent, HeartbeatRow, HeartbeatSample};
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
	pub key: String,
	pub public_key: String,
}

/// POST /api/v1/agent/connect - agent submits its session public key
/// and receives the overlay parameters.
pub async fn connect(
	State(state): State<AppState>,
	Json(req): Json<ConnectRequest>,
) -> Result<Json<Value>> {
	let vpn = state.agents.connect(&req.key, &req.public_key).await?;

	Ok(Json(json!({
		"status": "connected",
		"vpn": vpn,
	})))
}

/// POST /api/v1/agents/heartbeat - liveness plus telemetry sample.
pub async fn heartbeat(
	State(state): State<AppState>,
	Json(sample): Json<HeartbeatSample>,
) -> Result<Json<Value>> {
	state.heartbeats.record(&sample).await?;

	Ok(Json(json!({ "status": "ok" })))
}

/// GET /api/v1/agents - list enrolled agents.
pub async fn list_agents(State(state): State<AppState>) -> Result<Json<Vec<Agent>>> {
	Ok(Json(state.agents.list().await?))
}

/// GET /api/v1/agents/{id}
pub async fn get_agent(
	State(state): State<AppState>,
	Path(id): Path<Uuid>,
) -> Result<Json<Agent>> {
	Ok(Json(state.agents.get(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct UpdateRoutesRequest {
	pub routes: Value,
}

/// PUT /api/v1/agents/{id}/routes - declared local subnets.
pub async fn update_routes(
	State(state): State<AppState>,
	Path(id): Path<Uuid>,
	Json(req): Json<UpdateRoutesRequest>,
) -> Result<Json<Agent>> {
	Ok(Json(state.agents.update_routes(id, &req.routes).await?))
}

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
	pub limit: Option<i64>,
}

/// GET /api/v1/agents/{id}/metrics - recent heartbeat samples.
pub async fn agent_metrics(
	State(state): State<AppState>,
	Path(id): Path<Uuid>,
	Query(query): Query<MetricsQuery>,
) -> Result<Json<Vec<HeartbeatRow>>> {
	let limit = query.limit.unwrap_or(100).clamp(1, 1000);
	Ok(Json(state.heartbeats.list_samples(id, limit).await?))
}
