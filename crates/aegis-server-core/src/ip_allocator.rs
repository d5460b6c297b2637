// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{CoreError, Result};
use aegis_server_db::AgentRepository;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

/// Overlay address pool. The first host of the network belongs to the
/// gateway; agents get `.2` upward. Allocation is monotonic over the
/// highest address ever persisted, so released addresses are never
/// re-issued to a different device.
pub struct IpAllocator {
	net: Ipv4Net,
	next: Mutex<u32>,
}

impl IpAllocator {
	#[instrument(skip(repo), fields(%net))]
	pub async fn new(net: Ipv4Net, repo: &AgentRepository) -> Result<Self> {
		let gateway = u32::from(net.network()) + 1;

		let mut highest = gateway;
		for (ip,) in repo.allocated_ips().await? {
			if let Ok(addr) = ip.parse::<Ipv4Addr>() {
				if net.contains(&addr) {
					highest = highest.max(u32::from(addr));
				}
			}
		}

		debug!(next = %Ipv4Addr::from(highest + 1), "seeded overlay allocator");

		Ok(Self {
			net,
			next: Mutex::new(highest + 1),
		})
	}

	pub fn gateway(&self) -> Ipv4Addr {
		Ipv4Addr::from(u32::from(self.net.network()) + 1)
	}

	pub fn network(&self) -> Ipv4Net {
		self.net
	}

	#[instrument(skip(self))]
	pub async fn allocate(&self) -> Result<Ipv4Addr> {
		let mut next = self.next.lock().await;

		let candidate = Ipv4Addr::from(*next);
		if *next >= u32::from(self.net.broadcast()) {
			return Err(CoreError::PoolExhausted);
		}

		*next += 1;
		debug!(%candidate, "allocated overlay address");
		Ok(candidate)
	}
}
