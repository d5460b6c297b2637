// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! AEGIS agent binary: claim flow, then reconnect-forever session loop.

mod claim;
mod error;
mod heartbeat;
mod posture;
mod session;

use aegis_wg_common::{load_credential, save_credential, WgKeyPair};
use clap::Parser;
use error::AgentError;
use session::{SessionConfig, RECONNECT_DELAY};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// AEGIS agent - joins the zero-trust overlay and exposes internal
/// services across it.
#[derive(Parser, Debug)]
#[command(name = "aegis-agent", version, about = "AEGIS zero-trust agent")]
struct Args {
	/// API key for authentication; starts the claim flow when absent
	/// and no stored credential exists
	#[arg(long)]
	key: Option<String>,

	/// Control server URL
	#[arg(long, default_value = "http://127.0.0.1:3000")]
	server: String,

	/// Tunnel mode: 'ws' encapsulates WireGuard in a WebSocket
	/// (firewall bypass)
	#[arg(long)]
	tunnel: Option<String>,

	/// WebSocket tunnel URL (derived from --server when omitted)
	#[arg(long)]
	tunnel_url: Option<String>,

	/// Skip TLS verification (dev only)
	#[arg(long)]
	insecure: bool,

	/// Directory for the stored credential (default ~/.aegis)
	#[arg(long)]
	config_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	tracing_subscriber::registry()
		.with(
			tracing_subscriber::EnvFilter::try_from_env("AEGIS_LOG")
				.or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
				.unwrap_or_else(|_| "info".into()),
		)
		.with(tracing_subscriber::fmt::layer())
		.init();

	let config_dir = args
		.config_dir
		.clone()
		.or_else(|| dirs::home_dir().map(|home| home.join(".aegis")))
		.unwrap_or_else(|| PathBuf::from(".aegis"));
	let credential_path = config_dir.join("credential");

	let http = reqwest::Client::builder()
		.danger_accept_invalid_certs(args.insecure)
		.build()?;

	let api_key = match resolve_credential(&args, &http, &credential_path).await {
		Ok(key) => key,
		Err(e) => {
			tracing::error!(error = %e, "device claiming failed");
			return Err(e.into());
		}
	};

	let config = SessionConfig {
		tunnel_mode: args.tunnel.clone(),
		tunnel_url: args.tunnel_url.clone(),
		insecure: args.insecure,
		..SessionConfig::new(args.server.clone(), api_key)
	};

	// Signal-driven shutdown shared by every session.
	let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
	tokio::spawn(async move {
		let _ = tokio::signal::ctrl_c().await;
		let _ = shutdown_tx.send(true);
	});

	// Reconnect indefinitely; only the signal ends the loop.
	loop {
		tracing::info!(server = %config.server_url, "connecting");

		match session::run_session(&config, &http, &mut shutdown_rx).await {
			Ok(()) => {
				tracing::info!("shutting down agent");
				return Ok(());
			}
			Err(e) => {
				tracing::warn!(error = %e, "session ended");
			}
		}

		tokio::select! {
			_ = shutdown_rx.changed() => {
				if *shutdown_rx.borrow() {
					tracing::info!("shutting down agent");
					return Ok(());
				}
			}
			_ = tokio::time::sleep(RECONNECT_DELAY) => {
				tracing::info!("reconnecting");
			}
		}
	}
}

/// Credential resolution order: `--key`, then the stored credential,
/// then the interactive claim flow (whose result is persisted).
async fn resolve_credential(
	args: &Args,
	http: &reqwest::Client,
	credential_path: &std::path::Path,
) -> Result<String, AgentError> {
	if let Some(key) = &args.key {
		return Ok(key.clone());
	}

	if let Some(saved) = load_credential(credential_path).await? {
		tracing::info!(path = %credential_path.display(), "using stored credential");
		return Ok(saved);
	}

	println!("No API key provided. Starting device claiming workflow...");

	let claim_keys = WgKeyPair::generate();
	let hostname = hostname::get()
		.ok()
		.and_then(|h| h.into_string().ok())
		.unwrap_or_else(|| "agent-device".to_string());

	let api_key = claim::perform_device_claim(
		http,
		&args.server,
		&claim_keys.public_key().to_base64(),
		&hostname,
	)
	.await?;

	save_credential(&api_key, credential_path).await?;
	tracing::info!(path = %credential_path.display(), "stored credential");

	Ok(api_key)
}
