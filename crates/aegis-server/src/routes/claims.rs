// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Device-claim control surface (agent enrollment + dashboard approval).

use crate::error::{Result, ServerError};
use crate::state::AppState;
use aegis_server_core::{ClaimState, DeviceClaim};
use axum::extract::{ConnectInfo, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;

#[derive(Debug, Deserialize)]
pub struct StartClaimRequest {
	pub public_key: String,
	pub hostname: String,
}

/// POST /api/v1/start-claim - agent begins enrollment.
pub async fn start_claim(
	State(state): State<AppState>,
	ConnectInfo(remote): ConnectInfo<SocketAddr>,
	Json(req): Json<StartClaimRequest>,
) -> Result<Json<Value>> {
	if req.public_key.is_empty() {
		return Err(ServerError::BadRequest("public_key is required".into()));
	}

	let started = state
		.claims
		.start_claim(&req.public_key, &req.hostname, &remote.ip().to_string())
		.await?;

	Ok(Json(json!({
		"token": started.token,
		"claim_url": started.claim_url,
		"status": "pending",
	})))
}

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
	pub token: Option<String>,
}

/// GET /api/v1/claim-status - agent polls for approval.
pub async fn claim_status(
	State(state): State<AppState>,
	Query(query): Query<TokenQuery>,
) -> Result<Json<Value>> {
	let token = query
		.token
		.ok_or_else(|| ServerError::BadRequest("token is required".into()))?;

	let body = match state.claims.status(&token).await? {
		ClaimState::Pending => json!({ "status": "pending" }),
		ClaimState::Rejected => json!({ "status": "rejected" }),
		ClaimState::Approved { api_key } => json!({
			"status": "approved",
			"api_key": api_key,
		}),
	};

	Ok(Json(body))
}

/// GET /api/v1/claim-details - claim info for the approval page.
pub async fn claim_details(
	State(state): State<AppState>,
	Query(query): Query<TokenQuery>,
) -> Result<Json<DeviceClaim>> {
	let token = query
		.token
		.ok_or_else(|| ServerError::BadRequest("token is required".into()))?;

	Ok(Json(state.claims.details(&token).await?))
}

#[derive(Debug, Deserialize)]
pub struct ApproveRequest {
	pub token: String,
	pub email: String,
}

/// POST /api/v1/claim/approve - dashboard approves a claim.
pub async fn approve_claim(
	State(state): State<AppState>,
	Json(req): Json<ApproveRequest>,
) -> Result<Json<Value>> {
	if req.email.is_empty() {
		return Err(ServerError::BadRequest("email is required".into()));
	}

	let user = state.claims.approve(&req.token, &req.email).await?;

	Ok(Json(json!({
		"status": "approved",
		"user": user,
	})))
}

#[derive(Debug, Deserialize)]
pub struct RejectRequest {
	pub token: String,
}

/// POST /api/v1/claim/reject - dashboard rejects a claim.
pub async fn reject_claim(
	State(state): State<AppState>,
	Json(req): Json<RejectRequest>,
) -> Result<Json<Value>> {
	state.claims.reject(&req.token).await?;

	Ok(Json(json!({ "status": "rejected" })))
}
