// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Peer registry: agent connects, first-connect address allocation and
//! key rotation against the WireGuard device.

use crate::error::{CoreError, Result};
use crate::ip_allocator::IpAllocator;
use crate::models::Agent;
use aegis_server_db::AgentRepository;
use aegis_wg_common::WgPublicKey;
use aegis_wg_engine::WgDevice;
use ipnet::Ipv4Net;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument};
use uuid::Uuid;

/// Overlay parameters returned to a connecting agent.
#[derive(Debug, Clone, Serialize)]
pub struct OverlayConfig {
	pub endpoint: String,
	pub server_pub_key: String,
	pub allowed_ips: String,
	pub assigned_ip: String,
}

#[derive(Clone)]
pub struct AgentService {
	agents: AgentRepository,
	allocator: Arc<IpAllocator>,
	wg: Arc<WgDevice>,
	endpoint: String,
	overlay_net: Ipv4Net,
	// Peer add/remove for the same agent must not interleave; one
	// critical section around the whole connect path satisfies the
	// per-agent requirement at this scale.
	connect_lock: Arc<Mutex<()>>,
}

impl AgentService {
	pub fn new(
		agents: AgentRepository,
		allocator: Arc<IpAllocator>,
		wg: Arc<WgDevice>,
		endpoint: String,
	) -> Self {
		let overlay_net = allocator.network();
		Self {
			agents,
			allocator,
			wg,
			endpoint,
			overlay_net,
			connect_lock: Arc::new(Mutex::new(())),
		}
	}

	/// Agent connect: authenticate by credential, allocate the overlay
	/// address on first connect, and bind the submitted public key in
	/// the WireGuard device. On rotation the old binding is removed
	/// before the new one is added, because two peers may never share
	/// an allowed address.
	#[instrument(skip(self, api_key, public_key))]
	pub async fn connect(&self, api_key: &str, public_key: &str) -> Result<OverlayConfig> {
		let _guard = self.connect_lock.lock().await;

		let agent: Agent = self
			.agents
			.get_by_api_key(api_key)
			.await?
			.ok_or(CoreError::InvalidCredential)?
			.try_into()?;

		// Reject malformed keys before they reach the device.
		WgPublicKey::from_base64(public_key)?;

		let ip = match agent.ip {
			Some(ip) => ip,
			None => {
				let ip = self.allocator.allocate().await?;
				self.agents.assign_ip(agent.id, &ip.to_string()).await?;
				info!(agent = %agent.id, %ip, "assigned overlay address on first connect");
				ip
			}
		};

		if agent.public_key != public_key {
			if !agent.public_key.is_empty() {
				self.wg.remove_peer(&agent.public_key).await?;
				info!(agent = %agent.id, "removed rotated-out peer binding");
			}
			self.agents.update_public_key(agent.id, public_key).await?;
		}
		// Idempotent add also restores the binding after a server
		// restart, when the device comes up empty.
		self.wg.add_peer(public_key, ip).await?;

		let server_pub_key = self
			.wg
			.public_key()
			.await
			.ok_or(CoreError::OverlayUnavailable)?
			.to_base64();

		Ok(OverlayConfig {
			endpoint: self.endpoint.clone(),
			server_pub_key,
			allowed_ips: self.overlay_net.to_string(),
			assigned_ip: format!("{}/32", ip),
		})
	}

	#[instrument(skip(self))]
	pub async fn list(&self) -> Result<Vec<Agent>> {
		let rows = self.agents.list().await?;
		rows.into_iter().map(Agent::try_from).collect()
	}

	#[instrument(skip(self), fields(%id))]
	pub async fn get(&self, id: Uuid) -> Result<Agent> {
		self
			.agents
			.get(id)
			.await?
			.ok_or(CoreError::AgentNotFound)?
			.try_into()
	}

	/// Replace the agent's declared local routes. The value is opaque
	/// to the core; it only has to be a JSON array.
	#[instrument(skip(self, routes), fields(%id))]
	pub async fn update_routes(&self, id: Uuid, routes: &serde_json::Value) -> Result<Agent> {
		if !routes.is_array() {
			return Err(CoreError::InvalidRequest(
				"routes must be a JSON array".to_string(),
			));
		}

		let rows = self
			.agents
			.update_routes(id, &routes.to_string())
			.await?;
		if rows == 0 {
			return Err(CoreError::AgentNotFound);
		}

		self.get(id).await
	}

	pub fn gateway_ip(&self) -> Ipv4Addr {
		self.allocator.gateway()
	}
}
