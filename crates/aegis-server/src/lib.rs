// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! AEGIS control server: HTTP control surface over the claim state
//! machine, peer registry, heartbeat ingest and overlay probes, plus
//! the WebSocket tunnel endpoint.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::ServerConfig;
pub use error::ServerError;
pub use state::AppState;

use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn create_router(state: AppState) -> Router {
	Router::new()
		.route("/health", get(routes::health::health))
		.route("/api/v1/start-claim", post(routes::claims::start_claim))
		.route("/api/v1/claim-status", get(routes::claims::claim_status))
		.route("/api/v1/claim-details", get(routes::claims::claim_details))
		.route("/api/v1/claim/approve", post(routes::claims::approve_claim))
		.route("/api/v1/claim/reject", post(routes::claims::reject_claim))
		.route("/api/v1/agent/connect", post(routes::agents::connect))
		.route("/api/v1/agents", get(routes::agents::list_agents))
		.route("/api/v1/agents/heartbeat", post(routes::agents::heartbeat))
		.route("/api/v1/agents/{id}", get(routes::agents::get_agent))
		.route("/api/v1/agents/{id}/routes", put(routes::agents::update_routes))
		.route("/api/v1/agents/{id}/metrics", get(routes::agents::agent_metrics))
		.route("/api/v1/debug/ping", post(routes::debug::ping))
		.route("/api/v1/debug/port-check", post(routes::debug::port_check))
		.route("/api/v1/debug/http", post(routes::debug::http_check))
		.route("/api/v1/debug/proxy", get(routes::debug::proxy))
		.route("/ws/tunnel", get(routes::tunnel::ws_tunnel))
		.layer(TraceLayer::new_for_http())
		.layer(CorsLayer::permissive())
		.with_state(state)
}
