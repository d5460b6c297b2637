// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::Result;
use aegis_server_db::AgentRepository;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

/// Marks non-heartbeating agents offline.
///
/// Heartbeat cadence is 5 s and the default window 30 s, so an agent
/// survives six consecutive misses before it is declared down. The
/// reaper is the only writer of the offline transition; the heartbeat
/// handler is the only writer of the online one.
#[derive(Clone)]
pub struct LivenessReaper {
	agents: AgentRepository,
	interval: Duration,
	window: Duration,
}

impl LivenessReaper {
	pub fn new(agents: AgentRepository, interval: Duration, window: Duration) -> Self {
		Self {
			agents,
			interval,
			window,
		}
	}

	/// One scan cycle. Exposed so tests can drive cycles directly.
	#[instrument(skip(self))]
	pub async fn sweep(&self) -> Result<u64> {
		let reaped = self.agents.reap_stale(self.window.as_secs()).await?;
		if reaped > 0 {
			info!(reaped, "marked stale agents offline");
		}
		Ok(reaped)
	}

	pub fn spawn(self, mut shutdown_rx: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(self.interval);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

			loop {
				tokio::select! {
					biased;

					_ = shutdown_rx.changed() => {
						if *shutdown_rx.borrow() {
							info!("liveness reaper shutting down");
							break;
						}
					}

					_ = ticker.tick() => {
						if let Err(e) = self.sweep().await {
							warn!(error = %e, "liveness sweep failed");
						}
					}
				}
			}
		})
	}
}
