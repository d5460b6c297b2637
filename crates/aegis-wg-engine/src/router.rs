// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use aegis_wg_common::WgPublicKey;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use tracing::{debug, instrument, warn};

/// Maps overlay destinations to peers. Longest prefix wins, so an
/// agent's single `10.0.0.0/24` route to the gateway coexists with
/// the gateway's per-agent /32 bindings.
pub struct Router {
	routes: Vec<(Ipv4Net, WgPublicKey)>,
}

impl Router {
	pub fn new() -> Self {
		Self { routes: Vec::new() }
	}

	#[instrument(skip(self), fields(%net, peer = %peer))]
	pub fn add_route(&mut self, net: Ipv4Net, peer: WgPublicKey) {
		if let Some((_, existing)) = self.routes.iter().find(|(n, _)| *n == net) {
			if existing == &peer {
				return;
			}
			warn!(
				old_peer = %existing,
				new_peer = %peer,
				"route reassigned to different peer"
			);
			self.routes.retain(|(n, _)| *n != net);
		}
		self.routes.push((net, peer));
		debug!("added route");
	}

	#[instrument(skip(self), fields(peer = %peer))]
	pub fn remove_peer(&mut self, peer: &WgPublicKey) {
		let before = self.routes.len();
		self.routes.retain(|(_, p)| p != peer);
		debug!(count = before - self.routes.len(), "removed routes for peer");
	}

	pub fn route(&self, dst: Ipv4Addr) -> Option<&WgPublicKey> {
		self
			.routes
			.iter()
			.filter(|(net, _)| net.contains(&dst))
			.max_by_key(|(net, _)| net.prefix_len())
			.map(|(_, peer)| peer)
	}

	pub fn route_count(&self) -> usize {
		self.routes.len()
	}

	pub fn routes_for_peer(&self, peer: &WgPublicKey) -> Vec<Ipv4Net> {
		self
			.routes
			.iter()
			.filter(|(_, p)| p == peer)
			.map(|(net, _)| *net)
			.collect()
	}
}

impl Default for Router {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use aegis_wg_common::WgKeyPair;

	fn key() -> WgPublicKey {
		*WgKeyPair::generate().public_key()
	}

	#[test]
	fn test_add_and_route() {
		let mut router = Router::new();
		let pk = key();
		let net: Ipv4Net = "10.0.0.2/32".parse().unwrap();

		router.add_route(net, pk);

		let found = router.route("10.0.0.2".parse().unwrap());
		assert_eq!(found, Some(&pk));
	}

	#[test]
	fn test_route_not_found() {
		let router = Router::new();
		assert!(router.route("10.0.0.2".parse().unwrap()).is_none());
	}

	#[test]
	fn test_longest_prefix_wins() {
		let mut router = Router::new();
		let gateway = key();
		let neighbor = key();

		router.add_route("10.0.0.0/24".parse().unwrap(), gateway);
		router.add_route("10.0.0.5/32".parse().unwrap(), neighbor);

		assert_eq!(router.route("10.0.0.5".parse().unwrap()), Some(&neighbor));
		assert_eq!(router.route("10.0.0.9".parse().unwrap()), Some(&gateway));
	}

	#[test]
	fn test_remove_peer() {
		let mut router = Router::new();
		let pk = key();

		router.add_route("10.0.0.2/32".parse().unwrap(), pk);
		router.add_route("192.168.1.0/24".parse().unwrap(), pk);
		assert_eq!(router.route_count(), 2);

		router.remove_peer(&pk);

		assert_eq!(router.route_count(), 0);
		assert!(router.route("10.0.0.2".parse().unwrap()).is_none());
	}

	#[test]
	fn test_remove_peer_preserves_other_peers() {
		let mut router = Router::new();
		let pk1 = key();
		let pk2 = key();

		router.add_route("10.0.0.2/32".parse().unwrap(), pk1);
		router.add_route("10.0.0.3/32".parse().unwrap(), pk2);

		router.remove_peer(&pk1);

		assert!(router.route("10.0.0.2".parse().unwrap()).is_none());
		assert_eq!(router.route("10.0.0.3".parse().unwrap()), Some(&pk2));
	}

	#[test]
	fn test_add_route_same_peer_is_noop() {
		let mut router = Router::new();
		let pk = key();
		let net: Ipv4Net = "10.0.0.2/32".parse().unwrap();

		router.add_route(net, pk);
		router.add_route(net, pk);

		assert_eq!(router.route_count(), 1);
	}

	#[test]
	fn test_add_route_different_peer_overwrites() {
		let mut router = Router::new();
		let pk1 = key();
		let pk2 = key();
		let net: Ipv4Net = "10.0.0.2/32".parse().unwrap();

		router.add_route(net, pk1);
		router.add_route(net, pk2);

		assert_eq!(router.route_count(), 1);
		assert_eq!(router.route("10.0.0.2".parse().unwrap()), Some(&pk2));
	}

	#[test]
	fn test_routes_for_peer() {
		let mut router = Router::new();
		let pk1 = key();
		let pk2 = key();

		router.add_route("10.0.0.2/32".parse().unwrap(), pk1);
		router.add_route("10.0.0.3/32".parse().unwrap(), pk1);
		router.add_route("10.0.0.4/32".parse().unwrap(), pk2);

		let routes = router.routes_for_peer(&pk1);
		assert_eq!(routes.len(), 2);
	}
}
