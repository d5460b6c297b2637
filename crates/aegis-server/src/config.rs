// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use ipnet::Ipv4Net;
use std::net::{Ipv4Addr, SocketAddr};

#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub listen_addr: SocketAddr,
	pub database_url: String,
	/// Base64 gateway private key; generated at startup when unset.
	pub wg_private_key: Option<String>,
	pub wg_port: u16,
	/// Endpoint advertised to agents (a public host in production).
	pub wg_endpoint: String,
	pub overlay_cidr: Ipv4Net,
	pub dns: Ipv4Addr,
	pub dashboard_url: String,
	pub claim_ttl_secs: u64,
	pub claim_sweep_interval_secs: u64,
	pub liveness_interval_secs: u64,
	pub liveness_window_secs: u64,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			listen_addr: "0.0.0.0:3000".parse().unwrap(),
			database_url: "sqlite:aegis.db".to_string(),
			wg_private_key: None,
			wg_port: 51820,
			wg_endpoint: "127.0.0.1:51820".to_string(),
			overlay_cidr: "10.0.0.0/24".parse().unwrap(),
			dns: Ipv4Addr::new(8, 8, 8, 8),
			dashboard_url: "http://localhost:3001".to_string(),
			claim_ttl_secs: 900,
			claim_sweep_interval_secs: 60,
			liveness_interval_secs: 10,
			liveness_window_secs: 30,
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("invalid value for {0}: {1}")]
	Invalid(&'static str, String),
}

fn env_parse<T: std::str::FromStr>(
	name: &'static str,
	default: T,
) -> Result<T, ConfigError> {
	match std::env::var(name) {
		Ok(value) => value
			.parse()
			.map_err(|_| ConfigError::Invalid(name, value)),
		Err(_) => Ok(default),
	}
}

impl ServerConfig {
	pub fn from_env() -> Result<Self, ConfigError> {
		let defaults = Self::default();

		Ok(Self {
			listen_addr: env_parse("AEGIS_LISTEN_ADDR", defaults.listen_addr)?,
			database_url: std::env::var("AEGIS_DATABASE_URL").unwrap_or(defaults.database_url),
			wg_private_key: std::env::var("AEGIS_WG_PRIVATE_KEY").ok(),
			wg_port: env_parse("AEGIS_WG_PORT", defaults.wg_port)?,
			wg_endpoint: std::env::var("AEGIS_WG_ENDPOINT").unwrap_or(defaults.wg_endpoint),
			overlay_cidr: env_parse("AEGIS_OVERLAY_CIDR", defaults.overlay_cidr)?,
			dns: env_parse("AEGIS_DNS", defaults.dns)?,
			dashboard_url: std::env::var("AEGIS_DASHBOARD_URL").unwrap_or(defaults.dashboard_url),
			claim_ttl_secs: env_parse("AEGIS_CLAIM_TTL_SECS", defaults.claim_ttl_secs)?,
			claim_sweep_interval_secs: env_parse(
				"AEGIS_CLAIM_SWEEP_INTERVAL_SECS",
				defaults.claim_sweep_interval_secs,
			)?,
			liveness_interval_secs: env_parse(
				"AEGIS_LIVENESS_INTERVAL_SECS",
				defaults.liveness_interval_secs,
			)?,
			liveness_window_secs: env_parse(
				"AEGIS_LIVENESS_WINDOW_SECS",
				defaults.liveness_window_secs,
			)?,
		})
	}

	pub fn gateway_ip(&self) -> Ipv4Addr {
		Ipv4Addr::from(u32::from(self.overlay_cidr.network()) + 1)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_the_overlay_plan() {
		let config = ServerConfig::default();
		assert_eq!(config.listen_addr.port(), 3000);
		assert_eq!(config.wg_port, 51820);
		assert_eq!(config.gateway_ip(), Ipv4Addr::new(10, 0, 0, 1));
		assert_eq!(config.liveness_window_secs, 30);
		assert_eq!(config.claim_ttl_secs, 900);
	}
}
