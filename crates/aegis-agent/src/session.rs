// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Agent session controller.
//!
//! One call to [`run_session`] is one tunnel lifetime: fresh ephemeral
//! keypair, connect, overlay stack, optional WebSocket transport, the
//! demo service and the heartbeat emitter. It returns `Ok(())` only on
//! a termination signal; every other exit is an error the outer loop
//! answers with a reconnect.

use crate::error::{AgentError, Result};
use crate::heartbeat::{self, HeartbeatConfig};
use aegis_tunnel_ws::{TunnelError, WsTunnelClient};
use aegis_wg_common::{WgKeyPair, WgPublicKey};
use aegis_wg_engine::{OverlayTcpStream, UdpTransport, WgDevice, WgDeviceConfig};
use bytes::Bytes;
use http_body_util::Full;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use ipnet::Ipv4Net;
use serde::Deserialize;
use std::convert::Infallible;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use url::Url;

pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEMO_SERVICE_PORT: u16 = 80;

#[derive(Debug, Clone)]
pub struct SessionConfig {
	pub server_url: String,
	pub api_key: String,
	pub tunnel_mode: Option<String>,
	pub tunnel_url: Option<String>,
	pub insecure: bool,
	pub dns: Ipv4Addr,
	pub heartbeat_interval: Duration,
	pub heartbeat_timeout: Duration,
	pub heartbeat_budget: u32,
}

impl SessionConfig {
	pub fn new(server_url: String, api_key: String) -> Self {
		Self {
			server_url,
			api_key,
			tunnel_mode: None,
			tunnel_url: None,
			insecure: false,
			dns: Ipv4Addr::new(8, 8, 8, 8),
			heartbeat_interval: Duration::from_secs(5),
			heartbeat_timeout: Duration::from_secs(3),
			heartbeat_budget: 5,
		}
	}

	pub fn wants_ws_tunnel(&self) -> bool {
		self.tunnel_mode.as_deref() == Some("ws")
	}
}

#[derive(Debug, Deserialize)]
pub struct VpnConfig {
	pub endpoint: String,
	pub server_pub_key: String,
	pub allowed_ips: String,
	pub assigned_ip: String,
}

#[derive(Debug, Deserialize)]
struct ConnectResponse {
	#[allow(dead_code)]
	status: String,
	vpn: Option<VpnConfig>,
}

pub async fn connect_to_server(
	http: &reqwest::Client,
	server_url: &str,
	api_key: &str,
	public_key: &str,
) -> Result<VpnConfig> {
	let response = http
		.post(format!("{server_url}/api/v1/agent/connect"))
		.timeout(CONNECT_TIMEOUT)
		.json(&serde_json::json!({
			"key": api_key,
			"public_key": public_key,
		}))
		.send()
		.await?;

	if !response.status().is_success() {
		return Err(AgentError::ServerStatus(response.status().as_u16()));
	}

	let parsed: ConnectResponse = response.json().await?;
	parsed
		.vpn
		.ok_or_else(|| AgentError::InvalidResponse("server did not return a vpn config".into()))
}

/// `assigned_ip` arrives as `A.B.C.D/32`.
pub fn parse_assigned_ip(assigned: &str) -> Result<Ipv4Addr> {
	let ip = assigned.split('/').next().unwrap_or(assigned);
	Ok(ip.parse()?)
}

/// Tunnel endpoint derivation when `--tunnel-url` is not given: port
/// 3000 is the dev control surface, whose tunnel lives on 443;
/// otherwise the tunnel shares the control host.
pub fn effective_tunnel_url(server_url: &str, explicit: Option<&str>) -> Result<String> {
	if let Some(url) = explicit {
		return Ok(url.to_string());
	}

	let url = Url::parse(server_url)?;
	let host = url
		.host_str()
		.ok_or_else(|| AgentError::InvalidResponse(format!("server URL has no host: {server_url}")))?;

	if url.port() == Some(3000) {
		return Ok(format!("wss://{host}:443/ws/tunnel"));
	}

	let scheme = if url.scheme() == "http" { "ws" } else { "wss" };
	match url.port() {
		Some(port) => Ok(format!("{scheme}://{host}:{port}/ws/tunnel")),
		None => Ok(format!("{scheme}://{host}/ws/tunnel")),
	}
}

/// Drive one session until signal or failure.
#[instrument(skip(config, http, shutdown_rx), fields(server_url = %config.server_url))]
pub async fn run_session(
	config: &SessionConfig,
	http: &reqwest::Client,
	shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<()> {
	// Fresh keypair per session buys forward secrecy for the cost of
	// one peer rotation on the server.
	let keypair = WgKeyPair::generate();
	info!(public_key = %keypair.public_key(), "generated session keypair");

	let vpn = connect_to_server(
		http,
		&config.server_url,
		&config.api_key,
		&keypair.public_key().to_base64(),
	)
	.await?;
	info!(endpoint = %vpn.endpoint, assigned_ip = %vpn.assigned_ip, "received overlay config");

	let address = parse_assigned_ip(&vpn.assigned_ip)?;
	let allowed: Ipv4Net = vpn
		.allowed_ips
		.parse()
		.map_err(|_| AgentError::InvalidResponse(format!("bad allowed_ips: {}", vpn.allowed_ips)))?;

	let mut endpoint = vpn.endpoint.clone();

	// Firewall-bypass mode: all WireGuard datagrams ride the
	// WebSocket; the device's endpoint becomes the local proxy.
	let mut tunnel_closer = None;
	let mut tunnel_handle: Option<JoinHandle<std::result::Result<(), TunnelError>>> = None;
	if config.wants_ws_tunnel() {
		let tunnel_url = effective_tunnel_url(&config.server_url, config.tunnel_url.as_deref())?;
		info!(%tunnel_url, "WebSocket tunnel mode enabled");

		let mut client = WsTunnelClient::connect(&tunnel_url, &config.api_key, config.insecure).await?;
		let proxy_addr = client.start_local_udp_proxy(0).await?;
		tunnel_closer = Some(client.closer());
		tunnel_handle = Some(tokio::spawn(client.run()));

		endpoint = proxy_addr.to_string();
		info!(%endpoint, "WireGuard routed through WebSocket tunnel");
	}

	let transport = Arc::new(UdpTransport::bind("0.0.0.0:0".parse().expect("valid bind address")).await?);
	let device = Arc::new(WgDevice::new(
		WgDeviceConfig {
			address,
			prefix_len: allowed.prefix_len(),
			dns: config.dns,
			..Default::default()
		},
		transport,
	)?);

	let uapi = format!(
		"private_key={}\npublic_key={}\nallowed_ip={}\nendpoint={}\npersistent_keepalive_interval=25\n",
		keypair.private_key().to_hex(),
		WgPublicKey::from_base64(&vpn.server_pub_key)?.to_hex(),
		vpn.allowed_ips,
		endpoint,
	);
	device.apply_uapi(&uapi).await?;
	device.start().await?;
	let _device_tasks = device.spawn_all();

	info!(ip = %vpn.assigned_ip, "overlay tunnel established");

	let (session_tx, session_rx) = watch::channel(false);
	let _demo = spawn_demo_service(
		Arc::clone(&device),
		vpn.assigned_ip.clone(),
		session_rx.clone(),
	);

	let (err_tx, mut err_rx) = mpsc::channel::<AgentError>(1);
	let _emitter = heartbeat::spawn_emitter(
		http.clone(),
		HeartbeatConfig {
			server_url: config.server_url.clone(),
			api_key: config.api_key.clone(),
			interval: config.heartbeat_interval,
			request_timeout: config.heartbeat_timeout,
			budget: config.heartbeat_budget,
		},
		err_tx,
		session_rx,
	);

	let outcome = loop {
		tokio::select! {
			_ = shutdown_rx.changed() => {
				if *shutdown_rx.borrow() {
					info!("termination signal received, tearing session down");
					break Ok(());
				}
			}

			err = err_rx.recv() => {
				break Err(err.unwrap_or(AgentError::HeartbeatBudgetExhausted));
			}

			result = await_tunnel(&mut tunnel_handle) => {
				// A dead tunnel means no data path; terminal for the session.
				break Err(match result {
					Ok(()) => AgentError::Tunnel(TunnelError::Closed),
					Err(e) => e,
				});
			}
		}
	};

	let _ = session_tx.send(true);
	if let Some(closer) = tunnel_closer {
		closer.close();
	}
	device.shutdown().await;

	outcome
}

/// Resolves when the tunnel task ends; never resolves when no tunnel
/// is running, so the select arm simply stays quiet in direct mode.
async fn await_tunnel(
	handle: &mut Option<JoinHandle<std::result::Result<(), TunnelError>>>,
) -> std::result::Result<(), AgentError> {
	match handle.as_mut() {
		Some(task) => match task.await {
			Ok(Ok(())) => Ok(()),
			Ok(Err(e)) => Err(e.into()),
			Err(e) => Err(AgentError::InvalidResponse(format!("tunnel task panicked: {e}"))),
		},
		None => std::future::pending().await,
	}
}

/// Demo internal service reachable only across the overlay.
fn spawn_demo_service(
	device: Arc<WgDevice>,
	assigned_ip: String,
	mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut listener = match device.listen_overlay(DEMO_SERVICE_PORT).await {
			Ok(listener) => listener,
			Err(e) => {
				warn!(error = %e, "failed to bind overlay demo service");
				return;
			}
		};

		info!(port = DEMO_SERVICE_PORT, "overlay demo service listening");

		loop {
			tokio::select! {
				biased;

				_ = shutdown_rx.changed() => {
					if *shutdown_rx.borrow() {
						debug!("demo service shutting down");
						break;
					}
				}

				result = listener.accept() => {
					match result {
						Ok((stream, remote)) => {
							debug!(%remote, "overlay connection accepted");
							tokio::spawn(serve_demo_connection(stream, assigned_ip.clone()));
						}
						Err(e) => {
							warn!(error = %e, "overlay accept failed");
							break;
						}
					}
				}
			}
		}
	})
}

async fn serve_demo_connection(stream: OverlayTcpStream, assigned_ip: String) {
	let io = TokioIo::new(stream);

	let service = service_fn(move |_req: hyper::Request<hyper::body::Incoming>| {
		let assigned_ip = assigned_ip.clone();
		async move {
			let body = serde_json::json!({
				"message": "Hello from Agent",
				"ip": assigned_ip,
				"time": chrono::Utc::now().to_rfc3339(),
			})
			.to_string();

			let mut response = hyper::Response::new(Full::new(Bytes::from(body)));
			response.headers_mut().insert(
				hyper::header::CONTENT_TYPE,
				hyper::header::HeaderValue::from_static("application/json"),
			);
			Ok::<_, Infallible>(response)
		}
	});

	if let Err(e) = hyper::server::conn::http1::Builder::new()
		.serve_connection(io, service)
		.await
	{
		debug!(error = %e, "demo connection ended");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn assigned_ip_strips_the_prefix() {
		assert_eq!(
			parse_assigned_ip("10.0.0.2/32").unwrap(),
			Ipv4Addr::new(10, 0, 0, 2)
		);
		assert_eq!(
			parse_assigned_ip("10.0.0.9").unwrap(),
			Ipv4Addr::new(10, 0, 0, 9)
		);
		assert!(parse_assigned_ip("not-an-ip/32").is_err());
	}

	#[test]
	fn explicit_tunnel_url_wins() {
		let url = effective_tunnel_url("http://127.0.0.1:3000", Some("wss://edge.example:443/ws/tunnel"))
			.unwrap();
		assert_eq!(url, "wss://edge.example:443/ws/tunnel");
	}

	#[test]
	fn dev_control_port_derives_the_tls_tunnel() {
		let url = effective_tunnel_url("http://127.0.0.1:3000", None).unwrap();
		assert_eq!(url, "wss://127.0.0.1:443/ws/tunnel");
	}

	#[test]
	fn other_ports_share_the_control_host() {
		assert_eq!(
			effective_tunnel_url("http://gateway.internal:8080", None).unwrap(),
			"ws://gateway.internal:8080/ws/tunnel"
		);
		assert_eq!(
			effective_tunnel_url("https://gateway.example", None).unwrap(),
			"wss://gateway.example/ws/tunnel"
		);
	}

	#[test]
	fn connect_response_decodes() {
		let json = serde_json::json!({
			"status": "connected",
			"vpn": {
				"endpoint": "127.0.0.1:51820",
				"server_pub_key": "c2VydmVyLXB1YmxpYy1rZXktcGxhY2Vob2xkZXIhIQ==",
				"allowed_ips": "10.0.0.0/24",
				"assigned_ip": "10.0.0.2/32"
			}
		});

		let parsed: ConnectResponse = serde_json::from_value(json).unwrap();
		let vpn = parsed.vpn.unwrap();
		assert_eq!(vpn.assigned_ip, "10.0.0.2/32");
		assert_eq!(vpn.allowed_ips, "10.0.0.0/24");
	}

	#[test]
	fn ws_tunnel_mode_detection() {
		let mut config = SessionConfig::new("http://x".into(), "sk_live_x".into());
		assert!(!config.wants_ws_tunnel());
		config.tunnel_mode = Some("ws".to_string());
		assert!(config.wants_ws_tunnel());
	}
}
