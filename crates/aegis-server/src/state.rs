// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Explicit composition root. Handlers receive everything through
//! this state; nothing lives in process-wide globals, so tests build
//! isolated instances over in-memory stores and channel transports.

use crate::config::ServerConfig;
use aegis_server_core::{
	AgentService, ClaimService, HeartbeatService, IpAllocator, LivenessReaper, ProbeService,
};
use aegis_server_db::{
	AgentRepository, ClaimRepository, TelemetryRepository, UserRepository,
};
use aegis_tunnel_ws::WsTunnelServer;
use aegis_wg_engine::WgDevice;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct AppState {
	pub config: Arc<ServerConfig>,
	pub claims: ClaimService,
	pub agents: AgentService,
	pub heartbeats: HeartbeatService,
	pub probes: ProbeService,
	pub tunnel: Arc<WsTunnelServer>,
	pub agent_repo: AgentRepository,
	pub wg: Arc<WgDevice>,
}

impl AppState {
	pub async fn build(
		pool: SqlitePool,
		config: ServerConfig,
		wg: Arc<WgDevice>,
	) -> Result<Self, aegis_server_core::CoreError> {
		let agent_repo = AgentRepository::new(pool.clone());
		let claim_repo = ClaimRepository::new(pool.clone());
		let user_repo = UserRepository::new(pool.clone());
		let telemetry_repo = TelemetryRepository::new(pool);

		let allocator = Arc::new(IpAllocator::new(config.overlay_cidr, &agent_repo).await?);

		let claims = ClaimService::new(
			claim_repo,
			agent_repo.clone(),
			user_repo,
			config.dashboard_url.clone(),
		);

		let agents = AgentService::new(
			agent_repo.clone(),
			allocator,
			Arc::clone(&wg),
			config.wg_endpoint.clone(),
		);

		let heartbeats = HeartbeatService::new(agent_repo.clone(), telemetry_repo);

		let probes = ProbeService::new(Some(Arc::clone(&wg)), config.overlay_cidr);

		let tunnel = Arc::new(WsTunnelServer::new(
			format!("127.0.0.1:{}", config.wg_port)
				.parse()
				.expect("loopback WG address is always valid"),
		));

		Ok(Self {
			config: Arc::new(config),
			claims,
			agents,
			heartbeats,
			probes,
			tunnel,
			agent_repo,
			wg,
		})
	}

	pub fn reaper(&self) -> LivenessReaper {
		LivenessReaper::new(
			self.agent_repo.clone(),
			Duration::from_secs(self.config.liveness_interval_secs),
			Duration::from_secs(self.config.liveness_window_secs),
		)
	}
}
