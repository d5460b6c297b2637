// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Interactive device-claim flow.
//!
//! Three outcomes while polling: approved (credential extracted),
//! rejected (hard failure), and pending or a transient network error
//! (keep polling until the overall deadline).

use crate::error::{AgentError, Result};
use console::style;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument, warn};

pub const POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const POLL_DEADLINE: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Deserialize)]
struct StartClaimResponse {
	token: String,
	claim_url: String,
}

#[derive(Debug, Deserialize)]
struct ClaimStatusResponse {
	status: String,
	#[serde(default)]
	api_key: Option<String>,
}

/// Run the whole claim flow against the control server and return the
/// issued credential.
#[instrument(skip(http, public_key), fields(server_url, hostname))]
pub async fn perform_device_claim(
	http: &reqwest::Client,
	server_url: &str,
	public_key: &str,
	hostname: &str,
) -> Result<String> {
	let response = http
		.post(format!("{server_url}/api/v1/start-claim"))
		.timeout(Duration::from_secs(10))
		.json(&serde_json::json!({
			"public_key": public_key,
			"hostname": hostname,
		}))
		.send()
		.await?;

	if !response.status().is_success() {
		return Err(AgentError::ServerStatus(response.status().as_u16()));
	}

	let started: StartClaimResponse = response.json().await?;

	println!(
		"\n{} Authenticating device '{}' with {}",
		style("→").cyan().bold(),
		hostname,
		server_url
	);
	println!(
		"\nAction required: visit this URL to approve this device:\n\n    {}\n",
		style(&started.claim_url).cyan().underlined()
	);
	println!("Waiting for approval...");

	poll_for_approval(http, server_url, &started.token, POLL_INTERVAL, POLL_DEADLINE).await
}

pub async fn poll_for_approval(
	http: &reqwest::Client,
	server_url: &str,
	token: &str,
	interval: Duration,
	deadline: Duration,
) -> Result<String> {
	let mut ticker = tokio::time::interval(interval);
	ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
	let give_up = tokio::time::Instant::now() + deadline;

	loop {
		if tokio::time::Instant::now() >= give_up {
			return Err(AgentError::ClaimTimeout);
		}
		ticker.tick().await;

		let response = match http
			.get(format!("{server_url}/api/v1/claim-status"))
			.query(&[("token", token)])
			.timeout(Duration::from_secs(10))
			.send()
			.await
		{
			Ok(response) => response,
			Err(e) => {
				// Transient network failure: keep polling.
				warn!(error = %e, "claim poll failed, retrying");
				continue;
			}
		};

		let status: ClaimStatusResponse = match response.json().await {
			Ok(status) => status,
			Err(e) => {
				warn!(error = %e, "claim poll returned an unreadable body, retrying");
				continue;
			}
		};

		match status.status.as_str() {
			"approved" => {
				if let Some(api_key) = status.api_key {
					println!("{} Device approved", style("✓").green().bold());
					return Ok(api_key);
				}
				debug!("approved without credential yet, retrying");
			}
			"rejected" => return Err(AgentError::ClaimRejected),
			_ => {
				debug!(status = %status.status, "claim still pending");
			}
		}
	}
}
