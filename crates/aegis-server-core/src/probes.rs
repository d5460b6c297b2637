// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Server-originated diagnostics dialled from the gateway's overlay
//! address. A refused connection proves the host is up with the port
//! closed; only a deadline miss means unreachable.

use crate::error::{CoreError, Result};
use aegis_wg_engine::{EngineError, WgDevice};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use ipnet::Ipv4Net;
use serde::Serialize;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

const PROBE_DEADLINE: Duration = Duration::from_secs(2);
const HTTP_DEADLINE: Duration = Duration::from_secs(10);
const DEFAULT_PING_COUNT: usize = 4;
const MAX_PING_COUNT: usize = 20;

#[derive(Debug, Clone, Serialize)]
pub struct PingProbe {
	pub seq: usize,
	pub success: bool,
	pub latency_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PingReport {
	pub source: String,
	pub destination: Ipv4Addr,
	pub packets_sent: usize,
	pub packets_recv: usize,
	pub packet_loss: f64,
	pub avg_latency: f64,
	pub results: Vec<PingProbe>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortCheckReport {
	pub destination: String,
	pub port: u16,
	pub protocol: String,
	pub status: String,
	pub latency_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpCheckReport {
	pub url: String,
	pub method: String,
	pub status_code: u16,
	pub status_text: String,
	pub duration_ms: i64,
	pub headers: HashMap<String, String>,
	pub used_overlay: bool,
}

#[derive(Debug, Clone)]
pub struct ProxiedResponse {
	pub status: u16,
	pub headers: Vec<(String, String)>,
	pub body: Bytes,
}

#[derive(Clone)]
pub struct ProbeService {
	wg: Option<Arc<WgDevice>>,
	overlay_net: Ipv4Net,
	external: reqwest::Client,
}

impl ProbeService {
	pub fn new(wg: Option<Arc<WgDevice>>, overlay_net: Ipv4Net) -> Self {
		let external = reqwest::Client::builder()
			.timeout(HTTP_DEADLINE)
			.build()
			.unwrap_or_default();

		Self {
			wg,
			overlay_net,
			external,
		}
	}

	fn device(&self) -> Result<&Arc<WgDevice>> {
		self.wg.as_ref().ok_or(CoreError::OverlayUnavailable)
	}

	/// Reachability probe via TCP handshakes to port 80. ICMP is out
	/// of reach for a userspace stack without raw sockets, and a RST
	/// answers the reachability question just as well.
	#[instrument(skip(self), fields(%dest, count))]
	pub async fn ping(&self, dest: Ipv4Addr, count: usize) -> Result<PingReport> {
		let device = self.device()?;

		let count = if count == 0 { DEFAULT_PING_COUNT } else { count.min(MAX_PING_COUNT) };
		let target = SocketAddrV4::new(dest, 80);

		let mut results = Vec::with_capacity(count);
		let mut total_latency = 0i64;
		let mut received = 0usize;

		for seq in 0..count {
			let start = std::time::Instant::now();
			let outcome = device.dial_overlay(target, PROBE_DEADLINE).await;
			let latency_ms = start.elapsed().as_millis() as i64;

			let success = match outcome {
				Ok(_stream) => true,
				// Host answered with a RST: alive, port closed.
				Err(EngineError::ConnectionRefused(_)) => true,
				Err(_) => false,
			};

			if success {
				total_latency += latency_ms;
				received += 1;
			}

			results.push(PingProbe {
				seq: seq + 1,
				success,
				latency_ms,
			});

			tokio::time::sleep(Duration::from_millis(200)).await;
		}

		let avg_latency = if received > 0 {
			total_latency as f64 / received as f64
		} else {
			0.0
		};

		Ok(PingReport {
			source: "Server (overlay gateway)".to_string(),
			destination: dest,
			packets_sent: count,
			packets_recv: received,
			packet_loss: (count - received) as f64 / count as f64 * 100.0,
			avg_latency,
			results,
		})
	}

	#[instrument(skip(self), fields(%dest, port))]
	pub async fn port_check(&self, dest: Ipv4Addr, port: u16) -> Result<PortCheckReport> {
		let device = self.device()?;
		let target = SocketAddrV4::new(dest, port);

		let start = std::time::Instant::now();
		let outcome = device.dial_overlay(target, PROBE_DEADLINE).await;
		let latency_ms = start.elapsed().as_millis() as i64;

		let status = match outcome {
			Ok(_stream) => "open",
			Err(EngineError::ConnectionRefused(_)) => "closed",
			Err(_) => "unreachable",
		};

		Ok(PortCheckReport {
			destination: target.to_string(),
			port,
			protocol: "tcp".to_string(),
			status: status.to_string(),
			latency_ms,
		})
	}

	/// Real HTTP request, dialled through the overlay when the target
	/// resolves inside it and through the regular client otherwise.
	/// Transport failures are part of the report, not an error.
	#[instrument(skip(self), fields(url, method))]
	pub async fn http_check(&self, url: &str, method: &str) -> Result<HttpCheckReport> {
		let method = if method.is_empty() { "GET" } else { method };

		let uri: http::Uri = url
			.parse()
			.map_err(|_| CoreError::InvalidRequest(format!("invalid URL: {url}")))?;

		let overlay_target = uri
			.host()
			.and_then(|h| h.parse::<Ipv4Addr>().ok())
			.filter(|ip| self.overlay_net.contains(ip));

		let start = std::time::Instant::now();

		if let Some(ip) = overlay_target {
			// 503 if the gateway is down, the rest goes in the report.
			self.device()?;

			let port = uri.port_u16().unwrap_or(80);
			let path = uri
				.path_and_query()
				.map(|pq| pq.as_str().to_string())
				.unwrap_or_else(|| "/".to_string());

			let outcome = self
				.overlay_request(SocketAddrV4::new(ip, port), &path, method)
				.await;
			let duration_ms = start.elapsed().as_millis() as i64;

			return Ok(match outcome {
				Ok((status, headers, _body)) => HttpCheckReport {
					url: url.to_string(),
					method: method.to_string(),
					status_code: status.as_u16(),
					status_text: status.to_string(),
					duration_ms,
					headers,
					used_overlay: true,
				},
				Err(e) => HttpCheckReport {
					url: url.to_string(),
					method: method.to_string(),
					status_code: 0,
					status_text: format!("Error: {e}"),
					duration_ms,
					headers: HashMap::new(),
					used_overlay: true,
				},
			});
		}

		let request_method = reqwest::Method::from_bytes(method.as_bytes())
			.map_err(|_| CoreError::InvalidRequest(format!("invalid method: {method}")))?;

		let outcome = self
			.external
			.request(request_method, url)
			.header(reqwest::header::USER_AGENT, "aegis-diagnostics/1.0")
			.send()
			.await;
		let duration_ms = start.elapsed().as_millis() as i64;

		Ok(match outcome {
			Ok(response) => {
				let mut headers = HashMap::new();
				for (name, value) in response.headers() {
					if let Ok(v) = value.to_str() {
						headers.insert(name.to_string(), v.to_string());
					}
				}
				HttpCheckReport {
					url: url.to_string(),
					method: method.to_string(),
					status_code: response.status().as_u16(),
					status_text: response.status().to_string(),
					duration_ms,
					headers,
					used_overlay: false,
				}
			}
			Err(e) => HttpCheckReport {
				url: url.to_string(),
				method: method.to_string(),
				status_code: 0,
				status_text: format!("Error: {e}"),
				duration_ms,
				headers: HashMap::new(),
				used_overlay: false,
			},
		})
	}

	/// GET proxy to a service on an agent's overlay address. Dial
	/// failures surface as errors so the HTTP layer can answer 502.
	#[instrument(skip(self), fields(%ip, port, path))]
	pub async fn proxy(&self, ip: Ipv4Addr, port: u16, path: &str) -> Result<ProxiedResponse> {
		self.device()?;

		let (status, headers, body) = self
			.overlay_request_raw(SocketAddrV4::new(ip, port), path, "GET")
			.await?;

		Ok(ProxiedResponse {
			status: status.as_u16(),
			headers,
			body,
		})
	}

	async fn overlay_request(
		&self,
		addr: SocketAddrV4,
		path: &str,
		method: &str,
	) -> Result<(http::StatusCode, HashMap<String, String>, Bytes)> {
		let (status, headers, body) = self.overlay_request_raw(addr, path, method).await?;
		let map = headers.into_iter().collect();
		Ok((status, map, body))
	}

	async fn overlay_request_raw(
		&self,
		addr: SocketAddrV4,
		path: &str,
		method: &str,
	) -> Result<(http::StatusCode, Vec<(String, String)>, Bytes)> {
		let device = self.device()?;

		let stream = device
			.dial_overlay(addr, PROBE_DEADLINE)
			.await
			.map_err(|e| CoreError::OverlayDial(e.to_string()))?;

		let io = TokioIo::new(stream);
		let (mut sender, conn) = http1::handshake(io)
			.await
			.map_err(|e| CoreError::OverlayDial(e.to_string()))?;

		tokio::spawn(async move {
			if let Err(e) = conn.await {
				debug!(error = %e, "overlay HTTP connection ended");
			}
		});

		let method = http::Method::from_bytes(method.as_bytes())
			.map_err(|_| CoreError::InvalidRequest(format!("invalid method: {method}")))?;

		let request = http::Request::builder()
			.method(method)
			.uri(path)
			.header(http::header::HOST, addr.to_string())
			.header(http::header::USER_AGENT, "aegis-diagnostics/1.0")
			.body(Empty::<Bytes>::new())
			.map_err(|e| CoreError::Internal(e.to_string()))?;

		let response = tokio::time::timeout(HTTP_DEADLINE, sender.send_request(request))
			.await
			.map_err(|_| CoreError::OverlayDial(format!("request to {addr} timed out")))?
			.map_err(|e| CoreError::OverlayDial(e.to_string()))?;

		let status = response.status();
		let headers = response
			.headers()
			.iter()
			.filter_map(|(name, value)| {
				value
					.to_str()
					.ok()
					.map(|v| (name.to_string(), v.to_string()))
			})
			.collect();

		let body = tokio::time::timeout(HTTP_DEADLINE, response.into_body().collect())
			.await
			.map_err(|_| CoreError::OverlayDial(format!("response from {addr} timed out")))?
			.map_err(|e| CoreError::OverlayDial(e.to_string()))?
			.to_bytes();

		Ok((status, headers, body))
	}
}
