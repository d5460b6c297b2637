// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! AEGIS control server binary.

use aegis_server::{create_router, AppState, ServerConfig};
use aegis_wg_common::WgKeyPair;
use aegis_wg_engine::{UdpTransport, WgDevice, WgDeviceConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	// Load .env file if present
	dotenvy::dotenv().ok();

	let config = ServerConfig::from_env()?;

	tracing_subscriber::registry()
		.with(
			tracing_subscriber::EnvFilter::try_from_env("AEGIS_LOG")
				.or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
				.unwrap_or_else(|_| "info".into()),
		)
		.with(tracing_subscriber::fmt::layer())
		.init();

	tracing::info!(
		listen = %config.listen_addr,
		database = %config.database_url,
		wg_port = config.wg_port,
		overlay = %config.overlay_cidr,
		"starting aegis-server"
	);

	let pool = aegis_server_db::create_pool(&config.database_url).await?;
	aegis_server_db::apply_schema(&pool).await?;

	// Bring the userspace WireGuard gateway up before accepting any
	// control traffic. A bad key here is configuration-fatal.
	let bind_addr: SocketAddr = format!("0.0.0.0:{}", config.wg_port).parse()?;
	let transport = Arc::new(UdpTransport::bind(bind_addr).await?);

	let wg = Arc::new(WgDevice::new(
		WgDeviceConfig {
			address: config.gateway_ip(),
			prefix_len: config.overlay_cidr.prefix_len(),
			dns: config.dns,
			..Default::default()
		},
		transport,
	)?);

	let private_key = match &config.wg_private_key {
		Some(key) => key.clone(),
		None => {
			let generated = WgKeyPair::generate();
			tracing::warn!(
				public_key = %generated.public_key(),
				"AEGIS_WG_PRIVATE_KEY not set, generated an ephemeral gateway key"
			);
			generated.private_key().to_base64()
		}
	};

	wg.configure_self(&private_key, config.wg_port).await?;
	wg.start().await?;
	let _wg_tasks = wg.spawn_all();

	if let Some(public_key) = wg.public_key().await {
		tracing::info!(%public_key, port = config.wg_port, "WireGuard gateway listening");
	}

	let listen_addr = config.listen_addr;
	let claim_ttl = config.claim_ttl_secs;
	let sweep_interval = Duration::from_secs(config.claim_sweep_interval_secs);

	let state = AppState::build(pool, config, Arc::clone(&wg)).await?;

	let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

	let _reaper = state.reaper().spawn(shutdown_rx.clone());
	let _sweeper = state
		.claims
		.clone()
		.spawn_sweeper(sweep_interval, claim_ttl, shutdown_rx);

	let app = create_router(state);

	let listener = tokio::net::TcpListener::bind(listen_addr).await?;
	tracing::info!(%listen_addr, "control surface listening");

	axum::serve(
		listener,
		app.into_make_service_with_connect_info::<SocketAddr>(),
	)
	.with_graceful_shutdown(async {
		let _ = tokio::signal::ctrl_c().await;
		tracing::info!("shutdown signal received");
	})
	.await?;

	let _ = shutdown_tx.send(true);
	wg.shutdown().await;

	Ok(())
}
