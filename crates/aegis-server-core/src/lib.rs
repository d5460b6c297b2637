// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Control-plane services: claim state machine, peer registry,
//! heartbeat ingest, liveness reaping, overlay address allocation and
//! overlay probes. Everything here is an explicit composition-root
//! value; there is no process-wide state, so tests instantiate
//! isolated cores.

pub mod agents;
pub mod claims;
pub mod error;
pub mod heartbeats;
pub mod ip_allocator;
pub mod models;
pub mod probes;
pub mod reaper;

pub use agents::{AgentService, OverlayConfig};
pub use claims::{ClaimService, ClaimState, StartedClaim};
pub use error::{CoreError, Result};
pub use heartbeats::{HeartbeatSample, HeartbeatService, PostureUpdate};
pub use ip_allocator::IpAllocator;
pub use models::{Agent, AgentStatus, ClaimStatus, DeviceClaim, HeartbeatRow};
pub use probes::{HttpCheckReport, PingReport, PortCheckReport, ProbeService, ProxiedResponse};
pub use reaper::LivenessReaper;

#[cfg(test)]
pub(crate) mod testing {
	use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
	use std::str::FromStr;

	pub async fn pool() -> SqlitePool {
		let options = SqliteConnectOptions::from_str(":memory:")
			.unwrap()
			.create_if_missing(true);

		let pool = SqlitePoolOptions::new()
			.max_connections(1)
			.connect_with(options)
			.await
			.expect("failed to create test pool");

		aegis_server_db::apply_schema(&pool)
			.await
			.expect("failed to apply schema");

		pool
	}
}
