// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Datagram transport seam for the WireGuard device.
//!
//! The device only ever needs "send one datagram, receive one datagram".
//! Direct UDP and the WebSocket tunnel's local proxy are both reached
//! through [`UdpTransport`]; [`ChannelTransport`] pairs two devices
//! in-process so the full engine runs under test with no sockets.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

const CHANNEL_DEPTH: usize = 1024;

#[async_trait]
pub trait DatagramTransport: Send + Sync {
	async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;
	async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
	fn local_addr(&self) -> io::Result<SocketAddr>;
}

pub struct UdpTransport {
	socket: UdpSocket,
}

impl UdpTransport {
	pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
		let socket = UdpSocket::bind(addr).await?;
		debug!(local_addr = ?socket.local_addr(), "bound UDP transport");
		Ok(Self { socket })
	}
}

#[async_trait]
impl DatagramTransport for UdpTransport {
	async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
		self.socket.send_to(buf, target).await
	}

	async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
		self.socket.recv_from(buf).await
	}

	fn local_addr(&self) -> io::Result<SocketAddr> {
		self.socket.local_addr()
	}
}

/// One half of an in-memory datagram link. Frames sent into one half
/// come out of the other; a full queue drops, like the network would.
pub struct ChannelTransport {
	tx: mpsc::Sender<Vec<u8>>,
	rx: Mutex<mpsc::Receiver<Vec<u8>>>,
	local_addr: SocketAddr,
	peer_addr: SocketAddr,
}

pub fn channel_pair() -> (ChannelTransport, ChannelTransport) {
	let (a_tx, a_rx) = mpsc::channel(CHANNEL_DEPTH);
	let (b_tx, b_rx) = mpsc::channel(CHANNEL_DEPTH);

	let addr_a: SocketAddr = "127.0.0.1:51821".parse().unwrap();
	let addr_b: SocketAddr = "127.0.0.1:51822".parse().unwrap();

	(
		ChannelTransport {
			tx: b_tx,
			rx: Mutex::new(a_rx),
			local_addr: addr_a,
			peer_addr: addr_b,
		},
		ChannelTransport {
			tx: a_tx,
			rx: Mutex::new(b_rx),
			local_addr: addr_b,
			peer_addr: addr_a,
		},
	)
}

impl ChannelTransport {
	pub fn peer_addr(&self) -> SocketAddr {
		self.peer_addr
	}
}

#[async_trait]
impl DatagramTransport for ChannelTransport {
	async fn send_to(&self, buf: &[u8], _target: SocketAddr) -> io::Result<usize> {
		// Datagram semantics: drop on backpressure rather than block.
		let _ = self.tx.try_send(buf.to_vec());
		Ok(buf.len())
	}

	async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
		let mut rx = self.rx.lock().await;
		match rx.recv().await {
			Some(frame) => {
				let len = frame.len().min(buf.len());
				buf[..len].copy_from_slice(&frame[..len]);
				Ok((len, self.peer_addr))
			}
			None => Err(io::Error::new(
				io::ErrorKind::BrokenPipe,
				"channel transport closed",
			)),
		}
	}

	fn local_addr(&self) -> io::Result<SocketAddr> {
		Ok(self.local_addr)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn channel_pair_delivers_both_directions() {
		let (a, b) = channel_pair();
		let target = b.local_addr().unwrap();

		a.send_to(b"ping", target).await.unwrap();

		let mut buf = [0u8; 16];
		let (len, from) = b.recv_from(&mut buf).await.unwrap();
		assert_eq!(&buf[..len], b"ping");
		assert_eq!(from, a.local_addr().unwrap());

		b.send_to(b"pong", from).await.unwrap();
		let (len, _) = a.recv_from(&mut buf).await.unwrap();
		assert_eq!(&buf[..len], b"pong");
	}

	#[tokio::test]
	async fn udp_transport_roundtrip() {
		let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
			.await
			.unwrap();
		let b = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
			.await
			.unwrap();

		a.send_to(b"hello", b.local_addr().unwrap()).await.unwrap();

		let mut buf = [0u8; 16];
		let (len, from) = b.recv_from(&mut buf).await.unwrap();
		assert_eq!(&buf[..len], b"hello");
		assert_eq!(from, a.local_addr().unwrap());
	}
}
