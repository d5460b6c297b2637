// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::device::{OverlayStack, OverlayTcpListener, OverlayTcpStream};
use crate::error::{EngineError, Result};
use crate::router::Router;
use crate::transport::DatagramTransport;
use crate::uapi::{self, DeviceUpdate, PeerUpdate};
use aegis_wg_common::{WgPrivateKey, WgPublicKey};
use defguard_boringtun::noise::{Tunn, TunnResult};
use defguard_boringtun::x25519::{PublicKey, StaticSecret};
use ipnet::Ipv4Net;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, instrument, trace, warn};

const DEFAULT_MTU: u16 = 1420;
const MAX_DATAGRAM: usize = 65536;

#[derive(Debug, Clone)]
pub struct WgDeviceConfig {
	/// Overlay address this device answers on (`.1` for the gateway).
	pub address: Ipv4Addr,
	/// Prefix of the overlay network, used to scope the virtual stack.
	pub prefix_len: u8,
	/// DNS server handed to the stack configuration.
	pub dns: Ipv4Addr,
	pub mtu: u16,
}

impl Default for WgDeviceConfig {
	fn default() -> Self {
		Self {
			address: Ipv4Addr::new(10, 0, 0, 1),
			prefix_len: 24,
			dns: Ipv4Addr::new(8, 8, 8, 8),
			mtu: DEFAULT_MTU,
		}
	}
}

struct PeerState {
	tunn: Mutex<Tunn>,
	public_key: WgPublicKey,
	allowed_ip: Ipv4Net,
}

/// Userspace WireGuard device.
///
/// Owns the embedded tunnels, the overlay TCP/IP stack and the
/// datagram transport. Configuration goes through the text control
/// protocol ([`crate::uapi`]); the typed peer helpers are thin
/// wrappers that format it. The control surface is single-writer:
/// all mutations funnel through [`WgDevice::apply_uapi`].
pub struct WgDevice {
	config: WgDeviceConfig,
	transport: Arc<dyn DatagramTransport>,
	private_key: RwLock<Option<[u8; 32]>>,
	public_key: RwLock<Option<WgPublicKey>>,
	listen_port: RwLock<Option<u16>>,
	peers: RwLock<Vec<Arc<PeerState>>>,
	endpoints: RwLock<HashMap<WgPublicKey, SocketAddr>>,
	router: RwLock<Router>,
	stack: OverlayStack,
	next_index: AtomicU32,
	shutdown_tx: watch::Sender<bool>,
	shutdown_rx: watch::Receiver<bool>,
	running: AtomicBool,
}

impl WgDevice {
	#[instrument(skip(config, transport), fields(address = %config.address, mtu = config.mtu))]
	pub fn new(config: WgDeviceConfig, transport: Arc<dyn DatagramTransport>) -> Result<Self> {
		let stack = OverlayStack::new(config.address, config.prefix_len, config.mtu)?;

		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		info!("created WireGuard device");

		Ok(Self {
			config,
			transport,
			private_key: RwLock::new(None),
			public_key: RwLock::new(None),
			listen_port: RwLock::new(None),
			peers: RwLock::new(Vec::new()),
			endpoints: RwLock::new(HashMap::new()),
			router: RwLock::new(Router::new()),
			stack,
			next_index: AtomicU32::new(0),
			shutdown_tx,
			shutdown_rx,
			running: AtomicBool::new(false),
		})
	}

	/// Apply the device's own identity. Called once at startup; an
	/// invalid key here is configuration-fatal for the caller.
	#[instrument(skip(self, private_key_b64), fields(listen_port))]
	pub async fn configure_self(&self, private_key_b64: &str, listen_port: u16) -> Result<()> {
		let private = WgPrivateKey::from_base64(private_key_b64)?;
		let text = uapi::format_device(&private.to_hex(), listen_port);
		self.apply_uapi(&text).await
	}

	/// Idempotent upsert of a peer binding restricted to exactly
	/// `allowed_ip/32`.
	#[instrument(skip(self, public_key_b64), fields(%allowed_ip))]
	pub async fn add_peer(&self, public_key_b64: &str, allowed_ip: Ipv4Addr) -> Result<()> {
		let public = WgPublicKey::from_base64(public_key_b64)?;
		let net = Ipv4Net::new(allowed_ip, 32).expect("/32 prefix is always valid");
		let text = uapi::format_peer_add(&public.to_hex(), net);
		self.apply_uapi(&text).await
	}

	/// Remove a peer binding. Silent no-op when the key is absent.
	#[instrument(skip(self, public_key_b64))]
	pub async fn remove_peer(&self, public_key_b64: &str) -> Result<()> {
		let public = WgPublicKey::from_base64(public_key_b64)?;
		let text = uapi::format_peer_remove(&public.to_hex());
		self.apply_uapi(&text).await
	}

	/// Apply a line-oriented configuration fragment.
	pub async fn apply_uapi(&self, text: &str) -> Result<()> {
		let update = uapi::parse(text)?;
		self.apply_update(update).await
	}

	async fn apply_update(&self, update: DeviceUpdate) -> Result<()> {
		if let Some(bytes) = update.private_key {
			let private = WgPrivateKey::from_bytes(bytes);
			*self.public_key.write().await = Some(private.public_key());
			*self.private_key.write().await = Some(*private.expose_bytes());
			debug!("applied device private key");
		}

		if let Some(port) = update.listen_port {
			*self.listen_port.write().await = Some(port);
		}

		for peer in update.peers {
			if peer.remove {
				self.remove_peer_state(&peer.public_key).await;
			} else {
				self.upsert_peer_state(peer).await?;
			}
		}

		Ok(())
	}

	async fn upsert_peer_state(&self, update: PeerUpdate) -> Result<()> {
		let private =
			(*self.private_key.read().await).ok_or(EngineError::NotConfigured)?;

		let allowed_ip = update
			.allowed_ip
			.unwrap_or_else(|| Ipv4Net::new(Ipv4Addr::UNSPECIFIED, 0).expect("valid prefix"));

		{
			let mut peers = self.peers.write().await;
			if let Some(existing) = peers.iter().position(|p| p.public_key == update.public_key) {
				// Same key, possibly a new allowed range. Keep the
				// established tunnel state.
				let old = &peers[existing];
				if old.allowed_ip != allowed_ip {
					let mut router = self.router.write().await;
					router.remove_peer(&update.public_key);
					router.add_route(allowed_ip, update.public_key);
					peers[existing] = Arc::new(PeerState {
						tunn: Mutex::new(Self::new_tunn(
							&private,
							&update.public_key,
							update.persistent_keepalive,
							self.next_index.fetch_add(1, Ordering::SeqCst),
						)),
						public_key: update.public_key,
						allowed_ip,
					});
				}
			} else {
				let tunn = Self::new_tunn(
					&private,
					&update.public_key,
					update.persistent_keepalive,
					self.next_index.fetch_add(1, Ordering::SeqCst),
				);
				peers.push(Arc::new(PeerState {
					tunn: Mutex::new(tunn),
					public_key: update.public_key,
					allowed_ip,
				}));

				let mut router = self.router.write().await;
				router.add_route(allowed_ip, update.public_key);
			}
		}

		if let Some(endpoint) = update.endpoint {
			self
				.endpoints
				.write()
				.await
				.insert(update.public_key, endpoint);
		}

		info!(peer = %update.public_key, %allowed_ip, "added peer to WireGuard device");
		Ok(())
	}

	fn new_tunn(
		private: &[u8; 32],
		peer_key: &WgPublicKey,
		persistent_keepalive: Option<u16>,
		index: u32,
	) -> Tunn {
		Tunn::new(
			StaticSecret::from(*private),
			PublicKey::from(*peer_key.as_bytes()),
			None,
			persistent_keepalive,
			index,
			None,
		)
	}

	async fn remove_peer_state(&self, public_key: &WgPublicKey) {
		{
			let mut peers = self.peers.write().await;
			peers.retain(|p| p.public_key != *public_key);
		}

		{
			let mut router = self.router.write().await;
			router.remove_peer(public_key);
		}

		self.endpoints.write().await.remove(public_key);

		info!(peer = %public_key, "removed peer from WireGuard device");
	}

	pub async fn peer_count(&self) -> usize {
		self.peers.read().await.len()
	}

	/// Allowed overlay range for a peer, if it is currently bound.
	pub async fn peer_allowed_ip(&self, public_key_b64: &str) -> Option<Ipv4Net> {
		let public = WgPublicKey::from_base64(public_key_b64).ok()?;
		let peers = self.peers.read().await;
		peers
			.iter()
			.find(|p| p.public_key == public)
			.map(|p| p.allowed_ip)
	}

	pub async fn public_key(&self) -> Option<WgPublicKey> {
		*self.public_key.read().await
	}

	pub fn address(&self) -> Ipv4Addr {
		self.config.address
	}

	pub fn dns(&self) -> Ipv4Addr {
		self.config.dns
	}

	pub fn stack(&self) -> &OverlayStack {
		&self.stack
	}

	/// Dial from the gateway's overlay address into the overlay.
	/// Connection-refused and deadline-exceeded are distinct errors so
	/// probes can tell a closed port from an unreachable host.
	#[instrument(skip(self), fields(%addr, ?deadline))]
	pub async fn dial_overlay(
		&self,
		addr: SocketAddrV4,
		deadline: Duration,
	) -> Result<OverlayTcpStream> {
		let stream = self.stack.connect(addr)?;
		match tokio::time::timeout(deadline, stream.wait_connected()).await {
			Ok(Ok(())) => Ok(stream),
			Ok(Err(e)) => Err(e),
			Err(_) => Err(EngineError::DialTimeout(addr)),
		}
	}

	#[instrument(skip(self), fields(port))]
	pub async fn listen_overlay(&self, port: u16) -> Result<OverlayTcpListener> {
		self.stack.listen(port)
	}

	#[instrument(skip(self))]
	pub async fn start(&self) -> Result<()> {
		if self.running.swap(true, Ordering::SeqCst) {
			return Err(EngineError::AlreadyRunning);
		}

		if self.private_key.read().await.is_none() {
			self.running.store(false, Ordering::SeqCst);
			return Err(EngineError::NotConfigured);
		}

		info!("starting WireGuard device");
		Ok(())
	}

	pub fn spawn_all(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
		vec![
			Arc::clone(self).spawn_recv_loop(),
			Arc::clone(self).spawn_send_loop(),
			Arc::clone(self).spawn_timer_loop(),
		]
	}

	pub fn spawn_recv_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
		let device = Arc::clone(&self);
		let mut shutdown_rx = self.shutdown_rx.clone();

		tokio::spawn(async move {
			let mut buf = vec![0u8; MAX_DATAGRAM];
			let mut dst_buf = vec![0u8; MAX_DATAGRAM];
			let mut flush_buf = vec![0u8; MAX_DATAGRAM];

			loop {
				tokio::select! {
					biased;

					_ = shutdown_rx.changed() => {
						if *shutdown_rx.borrow() {
							info!("recv loop shutting down");
							break;
						}
					}

					result = device.transport.recv_from(&mut buf) => {
						match result {
							Ok((len, from)) => {
								device
									.handle_datagram(&buf[..len], from, &mut dst_buf, &mut flush_buf)
									.await;
							}
							Err(e) => {
								warn!(error = %e, "transport recv error");
								tokio::time::sleep(Duration::from_millis(10)).await;
							}
						}
					}
				}
			}
		})
	}

	async fn handle_datagram(
		&self,
		datagram: &[u8],
		from: SocketAddr,
		dst_buf: &mut [u8],
		flush_buf: &mut [u8],
	) {
		// Known source address first; an unknown source (fresh
		// handshake, roamed agent) is offered to every peer and the
		// one whose crypto accepts it claims the endpoint.
		let known = {
			let endpoints = self.endpoints.read().await;
			let peers = self.peers.read().await;
			peers
				.iter()
				.find(|p| endpoints.get(&p.public_key) == Some(&from))
				.cloned()
		};

		if let Some(peer) = known {
			self
				.decapsulate_from(&peer, datagram, from, dst_buf, flush_buf)
				.await;
			return;
		}

		let peers: Vec<Arc<PeerState>> = self.peers.read().await.iter().cloned().collect();
		for peer in peers {
			if self
				.decapsulate_from(&peer, datagram, from, dst_buf, flush_buf)
				.await
			{
				return;
			}
		}

		trace!(?from, len = datagram.len(), "datagram matched no peer");
	}

	/// Returns true when the peer's crypto accepted the datagram.
	async fn decapsulate_from(
		&self,
		peer: &PeerState,
		datagram: &[u8],
		from: SocketAddr,
		dst_buf: &mut [u8],
		flush_buf: &mut [u8],
	) -> bool {
		let mut to_network: Vec<Vec<u8>> = Vec::new();
		let mut to_stack: Vec<Vec<u8>> = Vec::new();

		{
			let mut tunn = peer.tunn.lock().await;
			match tunn.decapsulate(None, datagram, dst_buf) {
				TunnResult::Err(e) => {
					trace!(peer = %peer.public_key, ?e, "tunnel decapsulate error");
					return false;
				}
				TunnResult::Done => {}
				TunnResult::WriteToNetwork(data) => {
					to_network.push(data.to_vec());
					// Drain packets queued behind the handshake.
					loop {
						match tunn.decapsulate(None, &[], flush_buf) {
							TunnResult::WriteToNetwork(data) => to_network.push(data.to_vec()),
							_ => break,
						}
					}
				}
				TunnResult::WriteToTunnelV4(data, src) => {
					if peer.allowed_ip.contains(&src) {
						to_stack.push(data.to_vec());
					} else {
						warn!(
							peer = %peer.public_key,
							%src,
							allowed = %peer.allowed_ip,
							"dropping packet with source outside the peer's allowed range"
						);
					}
				}
				TunnResult::WriteToTunnelV6(_, _) => {
					trace!(peer = %peer.public_key, "dropping unexpected IPv6 packet");
				}
			}
		}

		// The datagram authenticated against this peer: remember where
		// it came from so replies and keepalives can reach it.
		{
			let mut endpoints = self.endpoints.write().await;
			let prev = endpoints.insert(peer.public_key, from);
			if prev != Some(from) {
				debug!(peer = %peer.public_key, ?from, "learned peer endpoint");
			}
		}

		for data in to_network {
			if let Err(e) = self.transport.send_to(&data, from).await {
				warn!(peer = %peer.public_key, error = %e, "failed to send handshake response");
			}
		}

		for data in to_stack {
			if let Err(e) = self.stack.receive_packet(&data) {
				warn!(error = %e, "failed to receive packet into overlay stack");
			}
		}

		true
	}

	pub fn spawn_send_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
		let device = Arc::clone(&self);
		let mut shutdown_rx = self.shutdown_rx.clone();

		tokio::spawn(async move {
			let mut dst_buf = vec![0u8; MAX_DATAGRAM];

			loop {
				tokio::select! {
					biased;

					_ = shutdown_rx.changed() => {
						if *shutdown_rx.borrow() {
							info!("send loop shutting down");
							break;
						}
					}

					_ = tokio::time::sleep(Duration::from_millis(1)) => {
						while let Some(packet) = device.stack.transmit_packet() {
							device.encrypt_and_send(&packet, &mut dst_buf).await;
						}
					}
				}
			}
		})
	}

	async fn encrypt_and_send(&self, packet: &[u8], dst_buf: &mut [u8]) {
		let Some(dst_ip) = extract_ipv4_dst(packet) else {
			return;
		};

		let peer_key = {
			let router = self.router.read().await;
			router.route(dst_ip).copied()
		};

		let Some(peer_key) = peer_key else {
			trace!(%dst_ip, "no route for outbound packet");
			return;
		};

		let peer = {
			let peers = self.peers.read().await;
			peers.iter().find(|p| p.public_key == peer_key).cloned()
		};

		let Some(peer) = peer else {
			return;
		};

		let out = {
			let mut tunn = peer.tunn.lock().await;
			match tunn.encapsulate(packet, dst_buf) {
				TunnResult::WriteToNetwork(data) => Some(data.to_vec()),
				TunnResult::Done => None,
				TunnResult::Err(e) => {
					debug!(peer = %peer_key, ?e, "tunnel encapsulate error");
					None
				}
				_ => None,
			}
		};

		if let Some(data) = out {
			let endpoint = { self.endpoints.read().await.get(&peer_key).copied() };
			match endpoint {
				Some(addr) => {
					trace!(len = data.len(), peer = %peer_key, "sending encrypted packet");
					if let Err(e) = self.transport.send_to(&data, addr).await {
						warn!(peer = %peer_key, error = %e, "failed to send encrypted packet");
					}
				}
				None => {
					trace!(peer = %peer_key, "no endpoint known yet, dropping packet");
				}
			}
		}
	}

	pub fn spawn_timer_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
		let device = Arc::clone(&self);
		let mut shutdown_rx = self.shutdown_rx.clone();

		tokio::spawn(async move {
			let mut dst_buf = vec![0u8; MAX_DATAGRAM];

			loop {
				tokio::select! {
					biased;

					_ = shutdown_rx.changed() => {
						if *shutdown_rx.borrow() {
							info!("timer loop shutting down");
							break;
						}
					}

					_ = tokio::time::sleep(Duration::from_millis(250)) => {
						let peers: Vec<Arc<PeerState>> =
							device.peers.read().await.iter().cloned().collect();

						for peer in peers {
							let out = {
								let mut tunn = peer.tunn.lock().await;
								match tunn.update_timers(&mut dst_buf) {
									TunnResult::WriteToNetwork(data) => Some(data.to_vec()),
									TunnResult::Done => None,
									TunnResult::Err(e) => {
										debug!(peer = %peer.public_key, ?e, "timer update error");
										None
									}
									_ => None,
								}
							};

							if let Some(data) = out {
								let endpoint =
									{ device.endpoints.read().await.get(&peer.public_key).copied() };
								if let Some(addr) = endpoint {
									trace!(len = data.len(), peer = %peer.public_key, "sending keepalive/handshake");
									if let Err(e) = device.transport.send_to(&data, addr).await {
										warn!(peer = %peer.public_key, error = %e, "failed to send timer packet");
									}
								}
							}
						}
					}
				}
			}
		})
	}

	#[instrument(skip(self))]
	pub async fn shutdown(&self) {
		info!("shutting down WireGuard device");
		let _ = self.shutdown_tx.send(true);
		self.running.store(false, Ordering::SeqCst);

		{
			let mut peers = self.peers.write().await;
			peers.clear();
		}
		self.endpoints.write().await.clear();
	}

	pub async fn wait(&self) {
		let mut rx = self.shutdown_rx.clone();
		while !*rx.borrow() {
			if rx.changed().await.is_err() {
				break;
			}
		}
	}

	pub fn is_running(&self) -> bool {
		self.running.load(Ordering::SeqCst)
	}
}

fn extract_ipv4_dst(packet: &[u8]) -> Option<Ipv4Addr> {
	if packet.len() < 20 {
		return None;
	}

	let version = packet[0] >> 4;
	if version != 4 {
		return None;
	}

	let mut dst_bytes = [0u8; 4];
	dst_bytes.copy_from_slice(&packet[16..20]);
	Some(Ipv4Addr::from(dst_bytes))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::transport::channel_pair;
	use aegis_wg_common::WgKeyPair;

	fn test_device(address: &str) -> Arc<WgDevice> {
		let (transport, _other) = channel_pair();
		let config = WgDeviceConfig {
			address: address.parse().unwrap(),
			..Default::default()
		};
		Arc::new(WgDevice::new(config, Arc::new(transport)).unwrap())
	}

	#[test]
	fn test_extract_ipv4_dst() {
		let mut packet = vec![0u8; 20];
		packet[0] = 0x45;

		let dst: Ipv4Addr = "10.0.0.2".parse().unwrap();
		packet[16..20].copy_from_slice(&dst.octets());

		assert_eq!(extract_ipv4_dst(&packet), Some(dst));
	}

	#[test]
	fn test_extract_ipv4_dst_too_short() {
		assert!(extract_ipv4_dst(&[0u8; 10]).is_none());
	}

	#[test]
	fn test_extract_ipv4_dst_wrong_version() {
		let mut packet = vec![0u8; 40];
		packet[0] = 0x60;
		assert!(extract_ipv4_dst(&packet).is_none());
	}

	#[test]
	fn test_config_default() {
		let config = WgDeviceConfig::default();
		assert_eq!(config.mtu, 1420);
		assert_eq!(config.address, Ipv4Addr::new(10, 0, 0, 1));
		assert_eq!(config.prefix_len, 24);
	}

	#[tokio::test]
	async fn add_peer_requires_configured_key() {
		let device = test_device("10.0.0.1");
		let peer = WgKeyPair::generate();

		let err = device
			.add_peer(&peer.public_key().to_base64(), "10.0.0.2".parse().unwrap())
			.await
			.unwrap_err();
		assert!(matches!(err, EngineError::NotConfigured));
	}

	#[tokio::test]
	async fn configure_self_rejects_invalid_key() {
		let device = test_device("10.0.0.1");
		assert!(device.configure_self("not-a-key", 51820).await.is_err());
	}

	#[tokio::test]
	async fn add_peer_is_idempotent() {
		let device = test_device("10.0.0.1");
		let server = WgKeyPair::generate();
		let peer = WgKeyPair::generate();

		device
			.configure_self(&server.private_key().to_base64(), 51820)
			.await
			.unwrap();

		let pk = peer.public_key().to_base64();
		let ip: Ipv4Addr = "10.0.0.2".parse().unwrap();

		device.add_peer(&pk, ip).await.unwrap();
		device.add_peer(&pk, ip).await.unwrap();

		assert_eq!(device.peer_count().await, 1);
		assert_eq!(
			device.peer_allowed_ip(&pk).await,
			Some("10.0.0.2/32".parse().unwrap())
		);
	}

	#[tokio::test]
	async fn remove_peer_is_noop_when_absent() {
		let device = test_device("10.0.0.1");
		let server = WgKeyPair::generate();
		let peer = WgKeyPair::generate();

		device
			.configure_self(&server.private_key().to_base64(), 51820)
			.await
			.unwrap();

		device
			.remove_peer(&peer.public_key().to_base64())
			.await
			.unwrap();
		assert_eq!(device.peer_count().await, 0);
	}

	#[tokio::test]
	async fn key_rotation_replaces_binding_and_keeps_ip() {
		let device = test_device("10.0.0.1");
		let server = WgKeyPair::generate();
		let old = WgKeyPair::generate();
		let new = WgKeyPair::generate();

		device
			.configure_self(&server.private_key().to_base64(), 51820)
			.await
			.unwrap();

		let ip: Ipv4Addr = "10.0.0.2".parse().unwrap();
		device
			.add_peer(&old.public_key().to_base64(), ip)
			.await
			.unwrap();

		device
			.remove_peer(&old.public_key().to_base64())
			.await
			.unwrap();
		device
			.add_peer(&new.public_key().to_base64(), ip)
			.await
			.unwrap();

		assert_eq!(device.peer_allowed_ip(&old.public_key().to_base64()).await, None);
		assert_eq!(
			device.peer_allowed_ip(&new.public_key().to_base64()).await,
			Some("10.0.0.2/32".parse().unwrap())
		);
		assert_eq!(device.peer_count().await, 1);
	}

	#[tokio::test]
	async fn public_key_derived_from_configured_private() {
		let device = test_device("10.0.0.1");
		let server = WgKeyPair::generate();

		assert!(device.public_key().await.is_none());

		device
			.configure_self(&server.private_key().to_base64(), 51820)
			.await
			.unwrap();

		assert_eq!(device.public_key().await, Some(*server.public_key()));
	}

	#[tokio::test]
	async fn start_requires_configuration() {
		let device = test_device("10.0.0.1");
		assert!(matches!(
			device.start().await.unwrap_err(),
			EngineError::NotConfigured
		));
	}
}
