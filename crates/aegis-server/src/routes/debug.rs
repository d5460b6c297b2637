// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Overlay diagnostics: server-originated probes dialled through the
//! userspace gateway.

use crate::error::{Result, ServerError};
use crate::state::AppState;
use aegis_server_core::{CoreError, HttpCheckReport, PingReport, PortCheckReport};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use std::net::Ipv4Addr;
use uuid::Uuid;

async fn agent_overlay_ip(state: &AppState, id: Uuid) -> Result<Ipv4Addr> {
	let agent = state.agents.get(id).await?;
	agent.ip.ok_or_else(|| {
		ServerError::from(CoreError::InvalidRequest(
			"agent has no overlay address yet".to_string(),
		))
	})
}

#[derive(Debug, Deserialize)]
pub struct PingRequest {
	pub dest_agent_id: Uuid,
	#[serde(default)]
	pub count: usize,
}

/// POST /api/v1/debug/ping - overlay reachability probe.
pub async fn ping(
	State(state): State<AppState>,
	Json(req): Json<PingRequest>,
) -> Result<Json<PingReport>> {
	let dest = agent_overlay_ip(&state, req.dest_agent_id).await?;
	Ok(Json(state.probes.ping(dest, req.count).await?))
}

#[derive(Debug, Deserialize)]
pub struct PortCheckRequest {
	pub dest_agent_id: Uuid,
	pub port: u16,
}

/// POST /api/v1/debug/port-check - open/closed/unreachable.
pub async fn port_check(
	State(state): State<AppState>,
	Json(req): Json<PortCheckRequest>,
) -> Result<Json<PortCheckReport>> {
	let dest = agent_overlay_ip(&state, req.dest_agent_id).await?;
	Ok(Json(state.probes.port_check(dest, req.port).await?))
}

#[derive(Debug, Deserialize)]
pub struct HttpCheckRequest {
	pub url: String,
	#[serde(default)]
	pub method: String,
}

/// POST /api/v1/debug/http - real HTTP request, via the overlay when
/// the target lives inside it.
pub async fn http_check(
	State(state): State<AppState>,
	Json(req): Json<HttpCheckRequest>,
) -> Result<Json<HttpCheckReport>> {
	Ok(Json(state.probes.http_check(&req.url, &req.method).await?))
}

#[derive(Debug, Deserialize)]
pub struct ProxyQuery {
	pub ip: Option<Ipv4Addr>,
	pub port: Option<u16>,
	pub path: Option<String>,
}

/// GET /api/v1/debug/proxy?ip=&port=&path= - GET proxy to a service on
/// an agent's overlay address.
pub async fn proxy(
	State(state): State<AppState>,
	Query(query): Query<ProxyQuery>,
) -> Result<impl IntoResponse> {
	let ip = query
		.ip
		.ok_or_else(|| ServerError::BadRequest("missing 'ip' query parameter".into()))?;
	let port = query.port.unwrap_or(80);
	let path = query.path.unwrap_or_else(|| "/".to_string());

	let response = state.probes.proxy(ip, port, &path).await?;

	let mut headers = HeaderMap::new();
	for (name, value) in &response.headers {
		if let (Ok(name), Ok(value)) = (
			name.parse::<HeaderName>(),
			HeaderValue::from_str(value),
		) {
			headers.insert(name, value);
		}
	}

	let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);

	Ok((status, headers, response.body))
}
