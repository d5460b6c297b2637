// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{Result, TunnelError};
use crate::{MAX_DATAGRAM, READ_DEADLINE};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, instrument, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Handle for tearing a running tunnel down from outside.
#[derive(Clone)]
pub struct TunnelCloser {
	shutdown: watch::Sender<bool>,
}

impl TunnelCloser {
	pub fn close(&self) {
		let _ = self.shutdown.send(true);
	}
}

/// Agent half of the tunnel.
///
/// Dials the server's `/ws/tunnel` endpoint and binds a loopback UDP
/// proxy for the local WireGuard device to "send to". The device's
/// source port is recorded off the first datagram so inbound frames
/// can be routed back to it; frames arriving before any datagram has
/// been seen are dropped.
#[derive(Debug)]
pub struct WsTunnelClient {
	tunnel_url: Url,
	ws: Option<WsStream>,
	udp: Option<Arc<UdpSocket>>,
	shutdown_tx: watch::Sender<bool>,
	shutdown_rx: watch::Receiver<bool>,
}

impl WsTunnelClient {
	/// Dial the tunnel endpoint. `tunnel_url` accepts http(s) schemes
	/// and rewrites them to ws(s); a bare host gets the standard
	/// `/ws/tunnel` path. TLS verification is skipped only when
	/// `insecure` is set (dev only).
	#[instrument(skip(api_key), fields(url = %tunnel_url))]
	pub async fn connect(tunnel_url: &str, api_key: &str, insecure: bool) -> Result<Self> {
		let normalized = if let Some(rest) = tunnel_url.strip_prefix("https://") {
			format!("wss://{}", rest)
		} else if let Some(rest) = tunnel_url.strip_prefix("http://") {
			format!("ws://{}", rest)
		} else {
			tunnel_url.to_string()
		};
		let mut url = Url::parse(&normalized)?;

		if url.path() == "" || url.path() == "/" {
			url.set_path("/ws/tunnel");
		}

		url.query_pairs_mut().append_pair("key", api_key);

		let connector = if url.scheme() == "wss" {
			let tls = native_tls::TlsConnector::builder()
				.danger_accept_invalid_certs(insecure)
				.build()?;
			Some(Connector::NativeTls(tls))
		} else {
			None
		};

		info!(host = ?url.host_str(), "connecting to WebSocket tunnel");
		let (ws, _response) =
			connect_async_tls_with_config(url.as_str(), None, false, connector).await?;
		info!("WebSocket tunnel established");

		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		Ok(Self {
			tunnel_url: url,
			ws: Some(ws),
			udp: None,
			shutdown_tx,
			shutdown_rx,
		})
	}

	/// Bind the loopback UDP proxy. Returns the address the local
	/// WireGuard device should use as its endpoint.
	#[instrument(skip(self))]
	pub async fn start_local_udp_proxy(&mut self, port: u16) -> Result<SocketAddr> {
		let udp = UdpSocket::bind(("127.0.0.1", port)).await?;
		let local_addr = udp.local_addr()?;
		info!(%local_addr, "local UDP proxy listening");
		self.udp = Some(Arc::new(udp));
		Ok(local_addr)
	}

	pub fn closer(&self) -> TunnelCloser {
		TunnelCloser {
			shutdown: self.shutdown_tx.clone(),
		}
	}

	pub fn tunnel_url(&self) -> &Url {
		&self.tunnel_url
	}

	/// Forward bidirectionally until shutdown or the first pump error.
	/// The error is returned so the session controller can treat a dead
	/// tunnel as session-terminal and reconnect.
	#[instrument(skip(self))]
	pub async fn run(mut self) -> Result<()> {
		let ws = self.ws.take().ok_or(TunnelError::NotConnected)?;
		let udp = self.udp.clone().ok_or(TunnelError::ProxyNotStarted)?;

		let (sink, mut stream) = ws.split();
		let sink = Arc::new(Mutex::new(sink));
		let last_src: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));

		let (err_tx, mut err_rx) = mpsc::channel::<TunnelError>(2);

		// Local UDP -> WebSocket. The datagram's source is the local
		// WireGuard socket; remember it for the return path.
		let uplink = {
			let udp = Arc::clone(&udp);
			let sink = Arc::clone(&sink);
			let last_src = Arc::clone(&last_src);
			let err_tx = err_tx.clone();
			let mut shutdown = self.shutdown_rx.clone();

			tokio::spawn(async move {
				let mut buf = vec![0u8; MAX_DATAGRAM];
				loop {
					tokio::select! {
						biased;

						_ = shutdown.changed() => {
							if *shutdown.borrow() {
								break;
							}
						}

						result = tokio::time::timeout(READ_DEADLINE, udp.recv_from(&mut buf)) => {
							match result {
								Err(_) => continue,
								Ok(Err(e)) => {
									let _ = err_tx.send(TunnelError::Io(e)).await;
									break;
								}
								Ok(Ok((n, src))) => {
									*last_src.lock().await = Some(src);

									// WriteMessage is not safe for concurrent
									// callers; the sink mutex is held for
									// exactly one frame write.
									let frame = Bytes::copy_from_slice(&buf[..n]);
									let mut sink = sink.lock().await;
									if let Err(e) = sink.send(Message::Binary(frame)).await {
										let _ = err_tx.send(TunnelError::WebSocket(e)).await;
										break;
									}
								}
							}
						}
					}
				}
			})
		};

		// WebSocket -> local UDP, replies go to the last recorded source.
		let downlink = {
			let udp = Arc::clone(&udp);
			let last_src = Arc::clone(&last_src);
			let err_tx = err_tx.clone();
			let mut shutdown = self.shutdown_rx.clone();

			tokio::spawn(async move {
				loop {
					tokio::select! {
						biased;

						_ = shutdown.changed() => {
							if *shutdown.borrow() {
								break;
							}
						}

						msg = stream.next() => {
							match msg {
								Some(Ok(Message::Binary(data))) => {
									let dest = *last_src.lock().await;
									match dest {
										Some(addr) => {
											if let Err(e) = udp.send_to(&data, addr).await {
												warn!(error = %e, "UDP write error");
											}
										}
										None => {
											debug!("dropping inbound frame, no local source recorded yet");
										}
									}
								}
								Some(Ok(Message::Close(_))) | None => {
									let _ = err_tx.send(TunnelError::Closed).await;
									break;
								}
								Some(Ok(_)) => continue,
								Some(Err(e)) => {
									let _ = err_tx.send(TunnelError::WebSocket(e)).await;
									break;
								}
							}
						}
					}
				}
			})
		};

		let mut shutdown = self.shutdown_rx.clone();
		let result = tokio::select! {
			err = err_rx.recv() => {
				match err {
					Some(TunnelError::Closed) => {
						info!("tunnel closed by remote");
						Err(TunnelError::Closed)
					}
					Some(e) => {
						warn!(error = %e, "tunnel pump failed");
						Err(e)
					}
					None => Ok(()),
				}
			}
			_ = shutdown.changed() => Ok(()),
		};

		let _ = self.shutdown_tx.send(true);
		uplink.abort();
		downlink.abort();
		let _ = uplink.await;
		let _ = downlink.await;

		result
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn connect_rejects_invalid_url() {
		let err = WsTunnelClient::connect("not a url", "sk_live_x", false)
			.await
			.unwrap_err();
		assert!(matches!(err, TunnelError::Url(_)));
	}

	#[tokio::test]
	async fn connect_fails_fast_against_closed_port() {
		// Bind then drop to obtain a port with nothing listening.
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		drop(listener);

		let url = format!("ws://{}/ws/tunnel", addr);
		let err = WsTunnelClient::connect(&url, "sk_live_x", false)
			.await
			.unwrap_err();
		assert!(matches!(err, TunnelError::WebSocket(_)));
	}
}
