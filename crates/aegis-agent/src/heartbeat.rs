// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Heartbeat emitter.
//!
//! Posts one JSON sample per tick: credential, the previous round's
//! measured latency, placeholder byte/connection counters, runtime
//! CPU/memory proxies and the posture snapshot. Individual failures
//! are retryable; exhausting the budget pushes a terminal error onto
//! the session's error channel so the outer loop reconnects.

use crate::error::AgentError;
use crate::posture;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
	pub server_url: String,
	pub api_key: String,
	pub interval: Duration,
	pub request_timeout: Duration,
	/// Failures tolerated before the next one is terminal.
	pub budget: u32,
}

impl HeartbeatConfig {
	pub fn new(server_url: String, api_key: String) -> Self {
		Self {
			server_url,
			api_key,
			interval: Duration::from_secs(5),
			request_timeout: Duration::from_secs(3),
			budget: 5,
		}
	}
}

pub fn spawn_emitter(
	http: reqwest::Client,
	config: HeartbeatConfig,
	err_tx: mpsc::Sender<AgentError>,
	mut shutdown_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(config.interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

		let mut consecutive_failures: u32 = 0;
		let mut last_latency_ms: i64 = 0;

		loop {
			tokio::select! {
				biased;

				_ = shutdown_rx.changed() => {
					if *shutdown_rx.borrow() {
						debug!("heartbeat emitter shutting down");
						return;
					}
				}

				_ = ticker.tick() => {
					match send_heartbeat(&http, &config, last_latency_ms).await {
						Ok(latency_ms) => {
							consecutive_failures = 0;
							last_latency_ms = latency_ms;
						}
						Err(e) => {
							consecutive_failures += 1;
							warn!(
								error = %e,
								consecutive_failures,
								"heartbeat failed"
							);
							if consecutive_failures > config.budget {
								let _ = err_tx.send(AgentError::HeartbeatBudgetExhausted).await;
								return;
							}
						}
					}
				}
			}
		}
	})
}

#[instrument(skip(http, config, last_latency_ms))]
async fn send_heartbeat(
	http: &reqwest::Client,
	config: &HeartbeatConfig,
	last_latency_ms: i64,
) -> Result<i64, AgentError> {
	let posture = posture::collect().await;

	let payload = serde_json::json!({
		"api_key": config.api_key,
		"heartbeat_latency_ms": last_latency_ms,
		"bytes_sent": 0,
		"bytes_received": 0,
		"active_connections": 0,
		"cpu_usage": alive_tasks_proxy(),
		"memory_usage": resident_memory_mb(),
		"posture": posture,
	});

	let start = std::time::Instant::now();
	let response = http
		.post(format!("{}/api/v1/agents/heartbeat", config.server_url))
		.timeout(config.request_timeout)
		.json(&payload)
		.send()
		.await?;
	let latency_ms = start.elapsed().as_millis() as i64;

	if !response.status().is_success() {
		return Err(AgentError::ServerStatus(response.status().as_u16()));
	}

	Ok(latency_ms)
}

/// Load proxy in the spirit of a goroutine count: live tasks on the
/// runtime.
fn alive_tasks_proxy() -> f64 {
	tokio::runtime::Handle::current().metrics().num_alive_tasks() as f64
}

/// Resident set in MiB, read from procfs where available.
fn resident_memory_mb() -> f64 {
	#[cfg(target_os = "linux")]
	{
		if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
			if let Some(resident_pages) = statm
				.split_whitespace()
				.nth(1)
				.and_then(|v| v.parse::<f64>().ok())
			{
				return resident_pages * 4096.0 / 1024.0 / 1024.0;
			}
		}
	}

	0.0
}

#[cfg(test)]
mod tests {
	use super::*;
	use axum::routing::post;
	use axum::{Json, Router};
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Arc;

	fn test_config(server_url: String) -> HeartbeatConfig {
		HeartbeatConfig {
			interval: Duration::from_millis(10),
			request_timeout: Duration::from_millis(500),
			..HeartbeatConfig::new(server_url, "sk_live_test".to_string())
		}
	}

	#[tokio::test]
	async fn budget_exhaustion_pushes_a_terminal_error() {
		// Bind-then-drop: nothing listens, every heartbeat fails.
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		drop(listener);

		let (err_tx, mut err_rx) = mpsc::channel(1);
		let (_shutdown_tx, shutdown_rx) = watch::channel(false);

		let handle = spawn_emitter(
			reqwest::Client::new(),
			test_config(format!("http://{addr}")),
			err_tx,
			shutdown_rx,
		);

		let err = tokio::time::timeout(Duration::from_secs(10), err_rx.recv())
			.await
			.expect("terminal error should arrive")
			.unwrap();
		assert!(matches!(err, AgentError::HeartbeatBudgetExhausted));

		handle.await.unwrap();
	}

	#[tokio::test]
	async fn successes_reset_the_failure_budget() {
		let hits = Arc::new(AtomicUsize::new(0));
		let hits_handler = Arc::clone(&hits);

		let router = Router::new().route(
			"/api/v1/agents/heartbeat",
			post(move || {
				let hits = Arc::clone(&hits_handler);
				async move {
					hits.fetch_add(1, Ordering::SeqCst);
					Json(serde_json::json!({ "status": "ok" }))
				}
			}),
		);

		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			axum::serve(listener, router).await.unwrap();
		});

		let (err_tx, mut err_rx) = mpsc::channel(1);
		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		let handle = spawn_emitter(
			reqwest::Client::new(),
			test_config(format!("http://{addr}")),
			err_tx,
			shutdown_rx,
		);

		// Let several beats land, then stop cleanly.
		tokio::time::sleep(Duration::from_millis(200)).await;
		shutdown_tx.send(true).unwrap();
		handle.await.unwrap();

		assert!(hits.load(Ordering::SeqCst) >= 3);
		assert!(err_rx.try_recv().is_err(), "no terminal error expected");
	}
}
