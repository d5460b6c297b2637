// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::{MAX_DATAGRAM, READ_DEADLINE};
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, instrument, warn};

const WRITE_QUEUE: usize = 256;

struct TunnelEntry {
	agent_id: uuid::Uuid,
	shutdown: watch::Sender<bool>,
}

/// Server half of the tunnel. Each authenticated upgrade gets its own
/// UDP socket toward the local WireGuard listener and two forwarding
/// tasks. The registry is keyed by public key for management and
/// teardown only; the data path never consults it.
pub struct WsTunnelServer {
	wg_addr: SocketAddr,
	clients: Arc<RwLock<HashMap<String, TunnelEntry>>>,
}

impl WsTunnelServer {
	pub fn new(wg_addr: SocketAddr) -> Self {
		Self {
			wg_addr,
			clients: Arc::new(RwLock::new(HashMap::new())),
		}
	}

	pub async fn client_count(&self) -> usize {
		self.clients.read().await.len()
	}

	/// Tear down a client's tunnel, e.g. when its agent is revoked.
	#[instrument(skip(self, public_key))]
	pub async fn disconnect(&self, public_key: &str) -> bool {
		let clients = self.clients.read().await;
		match clients.get(public_key) {
			Some(entry) => {
				let _ = entry.shutdown.send(true);
				true
			}
			None => false,
		}
	}

	/// Drive one upgraded WebSocket until either side ends the session.
	#[instrument(skip(self, socket, public_key), fields(%agent_id))]
	pub async fn handle_socket(&self, socket: WebSocket, agent_id: uuid::Uuid, public_key: String) {
		let udp = match UdpSocket::bind("0.0.0.0:0").await {
			Ok(socket) => Arc::new(socket),
			Err(e) => {
				warn!(error = %e, "failed to bind tunnel-side UDP socket");
				return;
			}
		};
		if let Err(e) = udp.connect(self.wg_addr).await {
			warn!(error = %e, wg_addr = %self.wg_addr, "failed to connect to WireGuard listener");
			return;
		}

		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		{
			let mut clients = self.clients.write().await;
			if let Some(previous) = clients.insert(
				public_key.clone(),
				TunnelEntry {
					agent_id,
					shutdown: shutdown_tx.clone(),
				},
			) {
				// A reconnecting agent replaces its old tunnel.
				let _ = previous.shutdown.send(true);
				debug!(old_agent = %previous.agent_id, "replaced existing tunnel for key");
			}
		}

		info!(key_prefix = %&public_key[..public_key.len().min(8)], "WebSocket tunnel established");

		let (mut ws_sink, mut ws_stream) = socket.split();

		// Exactly one writer per direction: frames for the WebSocket go
		// through this queue so writes are serialized in one task.
		let (frame_tx, mut frame_rx) = mpsc::channel::<Bytes>(WRITE_QUEUE);

		let writer = tokio::spawn(async move {
			while let Some(frame) = frame_rx.recv().await {
				if let Err(e) = ws_sink.send(Message::Binary(frame)).await {
					debug!(error = %e, "WebSocket write error");
					break;
				}
			}
			let _ = ws_sink.close().await;
		});

		let uplink_udp = Arc::clone(&udp);
		let mut uplink_shutdown = shutdown_rx.clone();
		let uplink = tokio::spawn(async move {
			let mut buf = vec![0u8; MAX_DATAGRAM];
			loop {
				tokio::select! {
					biased;

					_ = uplink_shutdown.changed() => {
						if *uplink_shutdown.borrow() {
							break;
						}
					}

					result = tokio::time::timeout(READ_DEADLINE, uplink_udp.recv(&mut buf)) => {
						match result {
							Err(_) => continue,
							Ok(Err(e)) => {
								debug!(error = %e, "UDP read error");
								break;
							}
							Ok(Ok(n)) => {
								if frame_tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
									break;
								}
							}
						}
					}
				}
			}
		});

		// Downlink runs inline: WebSocket frames onto the WG socket.
		let mut downlink_shutdown = shutdown_rx.clone();
		loop {
			tokio::select! {
				biased;

				_ = downlink_shutdown.changed() => {
					if *downlink_shutdown.borrow() {
						break;
					}
				}

				msg = ws_stream.next() => {
					match msg {
						Some(Ok(Message::Binary(data))) => {
							if let Err(e) = udp.send(&data).await {
								warn!(error = %e, "UDP write error");
								break;
							}
						}
						Some(Ok(Message::Close(_))) | None => break,
						Some(Ok(_)) => continue,
						Some(Err(e)) => {
							debug!(error = %e, "WebSocket read error");
							break;
						}
					}
				}
			}
		}

		// Wind down the sibling tasks before dropping the registry entry.
		let _ = shutdown_tx.send(true);
		uplink.abort();
		writer.abort();
		let _ = uplink.await;
		let _ = writer.await;

		{
			let mut clients = self.clients.write().await;
			if clients
				.get(&public_key)
				.is_some_and(|entry| entry.agent_id == agent_id)
			{
				clients.remove(&public_key);
			}
		}

		info!("WebSocket tunnel closed");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn client_count_starts_empty() {
		let server = WsTunnelServer::new("127.0.0.1:51820".parse().unwrap());
		assert_eq!(server.client_count().await, 0);
	}

	#[tokio::test]
	async fn disconnect_unknown_key_is_false() {
		let server = WsTunnelServer::new("127.0.0.1:51820".parse().unwrap());
		assert!(!server.disconnect("nope").await);
	}
}
