// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{Result, ServerError};
use crate::state::AppState;
use aegis_server_core::{Agent, CoreError};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct TunnelQuery {
	pub key: Option<String>,
}

/// GET /ws/tunnel?key= - authenticated upgrade into the WireGuard
/// datagram bridge. Auth happens before the upgrade so a bad
/// credential is an HTTP 401, not a WebSocket close.
pub async fn ws_tunnel(
	ws: WebSocketUpgrade,
	Query(query): Query<TunnelQuery>,
	State(state): State<AppState>,
) -> Result<Response> {
	let key = query
		.key
		.ok_or_else(|| ServerError::BadRequest("key is required".into()))?;

	let agent: Agent = state
		.agent_repo
		.get_by_api_key(&key)
		.await
		.map_err(CoreError::from)?
		.ok_or(CoreError::InvalidCredential)?
		.try_into()?;

	let tunnel = state.tunnel.clone();
	Ok(ws.on_upgrade(move |socket| async move {
		tunnel
			.handle_socket(socket, agent.id, agent.public_key.clone())
			.await;
	}))
}
