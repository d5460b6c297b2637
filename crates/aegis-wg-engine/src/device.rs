// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{EngineError, Result};
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::socket::tcp::{Socket as TcpSocket, SocketBuffer, State as TcpState};
use smoltcp::time::Instant as SmoltcpInstant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpEndpoint, Ipv4Address};
use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Instant as StdInstant;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, instrument, trace, warn};

const DEFAULT_TCP_RX_BUFFER_SIZE: usize = 65536;
const DEFAULT_TCP_TX_BUFFER_SIZE: usize = 65536;

/// Maximum number of packets in rx/tx queues to prevent memory exhaustion
const MAX_QUEUE_SIZE: usize = 1024;

fn smoltcp_now() -> SmoltcpInstant {
	static START: std::sync::OnceLock<StdInstant> = std::sync::OnceLock::new();
	let start = START.get_or_init(StdInstant::now);
	SmoltcpInstant::from_micros(start.elapsed().as_micros() as i64)
}

struct InternalDevice {
	rx_queue: VecDeque<Vec<u8>>,
	tx_queue: VecDeque<Vec<u8>>,
	mtu: usize,
}

impl InternalDevice {
	fn new(mtu: u16) -> Self {
		Self {
			rx_queue: VecDeque::new(),
			tx_queue: VecDeque::new(),
			mtu: mtu as usize,
		}
	}
}

struct InternalRxToken {
	data: Vec<u8>,
}

impl RxToken for InternalRxToken {
	fn consume<R, F>(mut self, f: F) -> R
	where
		F: FnOnce(&mut [u8]) -> R,
	{
		f(&mut self.data)
	}
}

struct InternalTxToken<'a> {
	tx_queue: &'a mut VecDeque<Vec<u8>>,
}

impl<'a> TxToken for InternalTxToken<'a> {
	fn consume<R, F>(self, len: usize, f: F) -> R
	where
		F: FnOnce(&mut [u8]) -> R,
	{
		let mut buffer = vec![0u8; len];
		let result = f(&mut buffer);
		if self.tx_queue.len() >= MAX_QUEUE_SIZE {
			warn!(queue = "tx", "packet queue full, dropping oldest packet");
			self.tx_queue.pop_front();
		}
		self.tx_queue.push_back(buffer);
		result
	}
}

impl Device for InternalDevice {
	type RxToken<'a> = InternalRxToken;
	type TxToken<'a> = InternalTxToken<'a>;

	fn receive(
		&mut self,
		_timestamp: SmoltcpInstant,
	) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
		if let Some(data) = self.rx_queue.pop_front() {
			Some((
				InternalRxToken { data },
				InternalTxToken {
					tx_queue: &mut self.tx_queue,
				},
			))
		} else {
			None
		}
	}

	fn transmit(&mut self, _timestamp: SmoltcpInstant) -> Option<Self::TxToken<'_>> {
		Some(InternalTxToken {
			tx_queue: &mut self.tx_queue,
		})
	}

	fn capabilities(&self) -> DeviceCapabilities {
		let mut caps = DeviceCapabilities::default();
		caps.max_transmission_unit = self.mtu;
		caps.medium = Medium::Ip;
		caps
	}
}

struct StackInner {
	device: InternalDevice,
	iface: Interface,
	sockets: SocketSet<'static>,
	wakers: Vec<Waker>,
}

/// Userspace IPv4 TCP/IP stack holding the overlay address. Plain IP
/// packets go in and out; the WireGuard layer above owns encryption.
pub struct OverlayStack {
	address: Ipv4Addr,
	mtu: u16,
	inner: Arc<Mutex<StackInner>>,
}

impl std::fmt::Debug for OverlayStack {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("OverlayStack")
			.field("address", &self.address)
			.field("mtu", &self.mtu)
			.finish()
	}
}

impl OverlayStack {
	#[instrument(skip_all, fields(%address, prefix_len, mtu))]
	pub fn new(address: Ipv4Addr, prefix_len: u8, mtu: u16) -> Result<Self> {
		let mut device = InternalDevice::new(mtu);

		let config = Config::new(HardwareAddress::Ip);
		let mut iface = Interface::new(config, &mut device, smoltcp_now());

		let smoltcp_addr = Ipv4Address::from_bytes(&address.octets());
		iface.update_ip_addrs(|addrs| {
			addrs
				.push(IpCidr::new(IpAddress::Ipv4(smoltcp_addr), prefix_len))
				.ok();
		});

		let sockets = SocketSet::new(vec![]);

		debug!("created overlay stack");

		Ok(Self {
			address,
			mtu,
			inner: Arc::new(Mutex::new(StackInner {
				device,
				iface,
				sockets,
				wakers: Vec::new(),
			})),
		})
	}

	/// Inject one decrypted IP packet into the stack.
	#[instrument(skip(self, data), fields(len = data.len()))]
	pub fn receive_packet(&self, data: &[u8]) -> Result<()> {
		let mut inner = self
			.inner
			.lock()
			.map_err(|e| EngineError::Device(format!("lock poisoned: {}", e)))?;

		if inner.device.rx_queue.len() >= MAX_QUEUE_SIZE {
			warn!(queue = "rx", "packet queue full, dropping oldest packet");
			inner.device.rx_queue.pop_front();
		}
		inner.device.rx_queue.push_back(data.to_vec());

		self.poll_iface(&mut inner);

		for waker in inner.wakers.drain(..) {
			waker.wake();
		}

		trace!("received packet into overlay stack");
		Ok(())
	}

	/// Pop one outbound IP packet, if the stack produced any.
	pub fn transmit_packet(&self) -> Option<Vec<u8>> {
		let mut inner = self.inner.lock().ok()?;

		self.poll_iface(&mut inner);

		let packet = inner.device.tx_queue.pop_front();
		if packet.is_some() {
			trace!("transmitting packet from overlay stack");
		}
		packet
	}

	pub fn poll(&self) -> bool {
		let mut inner = match self.inner.lock() {
			Ok(i) => i,
			Err(_) => return false,
		};

		self.poll_iface(&mut inner)
	}

	fn poll_iface(&self, inner: &mut StackInner) -> bool {
		let timestamp = smoltcp_now();
		inner
			.iface
			.poll(timestamp, &mut inner.device, &mut inner.sockets)
	}

	pub fn address(&self) -> Ipv4Addr {
		self.address
	}

	pub fn mtu(&self) -> u16 {
		self.mtu
	}

	fn create_tcp_socket(&self) -> TcpSocket<'static> {
		let rx_buffer = SocketBuffer::new(vec![0u8; DEFAULT_TCP_RX_BUFFER_SIZE]);
		let tx_buffer = SocketBuffer::new(vec![0u8; DEFAULT_TCP_TX_BUFFER_SIZE]);
		TcpSocket::new(rx_buffer, tx_buffer)
	}

	fn add_listen_socket(&self, port: u16) -> Result<SocketHandle> {
		let mut inner = self
			.inner
			.lock()
			.map_err(|e| EngineError::Device(format!("lock poisoned: {}", e)))?;

		let mut socket = self.create_tcp_socket();
		socket
			.listen(port)
			.map_err(|e| EngineError::Device(format!("listen failed: {}", e)))?;

		Ok(inner.sockets.add(socket))
	}

	pub fn listen(&self, port: u16) -> Result<OverlayTcpListener> {
		let handle = self.add_listen_socket(port)?;
		let local_addr = SocketAddrV4::new(self.address, port);

		debug!(%port, "listening on overlay port");
		Ok(OverlayTcpListener {
			stack: self.clone(),
			handle,
			port,
			local_addr,
		})
	}

	pub fn connect(&self, addr: SocketAddrV4) -> Result<OverlayTcpStream> {
		let mut inner = self
			.inner
			.lock()
			.map_err(|e| EngineError::Device(format!("lock poisoned: {}", e)))?;

		let mut socket = self.create_tcp_socket();

		let local_port = 49152 + (fastrand::u16(..) % 16383);
		let local_endpoint = IpEndpoint::new(
			IpAddress::Ipv4(Ipv4Address::from_bytes(&self.address.octets())),
			local_port,
		);
		let remote_endpoint = IpEndpoint::new(
			IpAddress::Ipv4(Ipv4Address::from_bytes(&addr.ip().octets())),
			addr.port(),
		);

		socket
			.connect(inner.iface.context(), remote_endpoint, local_endpoint)
			.map_err(|e| EngineError::TcpConnect(format!("connect failed: {}", e)))?;

		let handle = inner.sockets.add(socket);
		self.poll_iface(&mut inner);

		debug!(%addr, "connecting to overlay remote");
		Ok(OverlayTcpStream {
			stack: self.clone(),
			handle,
			remote: addr,
		})
	}

	pub fn socket_state(&self, handle: SocketHandle) -> Option<TcpState> {
		let inner = self.inner.lock().ok()?;
		let socket = inner.sockets.get::<TcpSocket>(handle);
		Some(socket.state())
	}

	pub fn register_waker(&self, waker: Waker) {
		if let Ok(mut inner) = self.inner.lock() {
			inner.wakers.push(waker);
		}
	}
}

impl Clone for OverlayStack {
	fn clone(&self) -> Self {
		Self {
			address: self.address,
			mtu: self.mtu,
			inner: Arc::clone(&self.inner),
		}
	}
}

pub struct OverlayTcpListener {
	stack: OverlayStack,
	handle: SocketHandle,
	port: u16,
	local_addr: SocketAddrV4,
}

impl OverlayTcpListener {
	/// Wait for the next inbound connection. The consumed listen socket
	/// becomes the connection; a fresh one is armed for the next caller.
	pub async fn accept(&mut self) -> Result<(OverlayTcpStream, SocketAddrV4)> {
		loop {
			{
				let inner = self
					.stack
					.inner
					.lock()
					.map_err(|e| EngineError::Device(format!("lock poisoned: {}", e)))?;

				let socket = inner.sockets.get::<TcpSocket>(self.handle);
				if socket.state() == TcpState::Established {
					if let Some(remote) = socket.remote_endpoint() {
						let remote_addr = {
							let IpAddress::Ipv4(v4) = remote.addr;
							SocketAddrV4::new(Ipv4Addr::from(v4.0), remote.port)
						};
						drop(inner);

						let conn_handle = self.handle;
						self.handle = self.stack.add_listen_socket(self.port)?;

						let stream = OverlayTcpStream {
							stack: self.stack.clone(),
							handle: conn_handle,
							remote: remote_addr,
						};
						return Ok((stream, remote_addr));
					}
				}
			}

			tokio::time::sleep(std::time::Duration::from_millis(10)).await;
			self.stack.poll();
		}
	}

	pub fn local_addr(&self) -> SocketAddrV4 {
		self.local_addr
	}
}

#[derive(Debug)]
pub struct OverlayTcpStream {
	stack: OverlayStack,
	handle: SocketHandle,
	remote: SocketAddrV4,
}

impl OverlayTcpStream {
	/// Resolve the connect attempt. A socket that falls back to
	/// `Closed` before establishing took an RST from the remote, which
	/// is the overlay's connection-refused signal.
	pub async fn wait_connected(&self) -> Result<()> {
		loop {
			let state = self
				.stack
				.socket_state(self.handle)
				.ok_or_else(|| EngineError::TcpConnect("socket not found".to_string()))?;

			match state {
				TcpState::Established => return Ok(()),
				TcpState::Closed | TcpState::Closing | TcpState::TimeWait => {
					return Err(EngineError::ConnectionRefused(self.remote))
				}
				_ => {
					tokio::time::sleep(std::time::Duration::from_millis(10)).await;
					self.stack.poll();
				}
			}
		}
	}

	pub fn remote_addr(&self) -> SocketAddrV4 {
		self.remote
	}

	fn poll_read_inner(&self, buf: &mut [u8]) -> io::Result<usize> {
		let mut inner = self
			.stack
			.inner
			.lock()
			.map_err(|e| io::Error::other(format!("lock poisoned: {}", e)))?;

		self.stack.poll_iface(&mut inner);

		let socket = inner.sockets.get_mut::<TcpSocket>(self.handle);

		if socket.can_recv() {
			match socket.recv_slice(buf) {
				Ok(n) => Ok(n),
				Err(e) => Err(io::Error::other(format!("{}", e))),
			}
		} else if socket.state() == TcpState::Established {
			Err(io::Error::new(io::ErrorKind::WouldBlock, "no data"))
		} else {
			Ok(0)
		}
	}

	fn poll_write_inner(&self, buf: &[u8]) -> io::Result<usize> {
		let mut inner = self
			.stack
			.inner
			.lock()
			.map_err(|e| io::Error::other(format!("lock poisoned: {}", e)))?;

		let socket = inner.sockets.get_mut::<TcpSocket>(self.handle);

		if socket.can_send() {
			match socket.send_slice(buf) {
				Ok(n) => {
					self.stack.poll_iface(&mut inner);
					Ok(n)
				}
				Err(e) => Err(io::Error::other(format!("{}", e))),
			}
		} else if socket.state() == TcpState::Established {
			Err(io::Error::new(io::ErrorKind::WouldBlock, "buffer full"))
		} else {
			Err(io::Error::new(io::ErrorKind::NotConnected, "not connected"))
		}
	}
}

impl AsyncRead for OverlayTcpStream {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		match self.poll_read_inner(buf.initialize_unfilled()) {
			Ok(n) => {
				buf.advance(n);
				Poll::Ready(Ok(()))
			}
			Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
				self.stack.register_waker(cx.waker().clone());
				Poll::Pending
			}
			Err(e) => Poll::Ready(Err(e)),
		}
	}
}

impl AsyncWrite for OverlayTcpStream {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		match self.poll_write_inner(buf) {
			Ok(n) => Poll::Ready(Ok(n)),
			Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
				self.stack.register_waker(cx.waker().clone());
				Poll::Pending
			}
			Err(e) => Poll::Ready(Err(e)),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		self.stack.poll();
		Poll::Ready(Ok(()))
	}

	fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		let mut inner = self
			.stack
			.inner
			.lock()
			.map_err(|e| io::Error::other(format!("lock poisoned: {}", e)))?;

		let socket = inner.sockets.get_mut::<TcpSocket>(self.handle);
		if socket.state() == TcpState::Established {
			socket.close();
		}
		self.stack.poll_iface(&mut inner);

		Poll::Ready(Ok(()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_overlay_stack_creation() {
		let addr: Ipv4Addr = "10.0.0.1".parse().unwrap();
		let stack = OverlayStack::new(addr, 24, 1420).unwrap();

		assert_eq!(stack.address(), addr);
		assert_eq!(stack.mtu(), 1420);
	}

	#[test]
	fn test_overlay_stack_poll() {
		let addr: Ipv4Addr = "10.0.0.1".parse().unwrap();
		let stack = OverlayStack::new(addr, 24, 1420).unwrap();

		stack.poll();
	}

	#[test]
	fn test_overlay_stack_clone_shares_state() {
		let addr: Ipv4Addr = "10.0.0.1".parse().unwrap();
		let stack1 = OverlayStack::new(addr, 24, 1420).unwrap();
		let stack2 = stack1.clone();

		assert_eq!(stack1.address(), stack2.address());
		assert_eq!(stack1.mtu(), stack2.mtu());
	}

	#[test]
	fn test_listen_local_addr() {
		let addr: Ipv4Addr = "10.0.0.1".parse().unwrap();
		let stack = OverlayStack::new(addr, 24, 1420).unwrap();

		let listener = stack.listen(80).unwrap();
		assert_eq!(listener.local_addr(), SocketAddrV4::new(addr, 80));
	}

	#[test]
	fn test_receive_packet_queues() {
		let addr: Ipv4Addr = "10.0.0.1".parse().unwrap();
		let stack = OverlayStack::new(addr, 24, 1420).unwrap();

		// Garbage is accepted into the queue and discarded by the
		// interface poll without panicking.
		stack.receive_packet(&[0u8; 40]).unwrap();
	}
}
