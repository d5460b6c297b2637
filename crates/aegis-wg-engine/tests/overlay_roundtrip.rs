// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Full-stack exercise: two userspace devices joined by the in-memory
//! datagram link complete a WireGuard handshake and carry a TCP
//! conversation across the overlay.

use aegis_wg_common::WgKeyPair;
use aegis_wg_engine::{channel_pair, WgDevice, WgDeviceConfig};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn config(address: &str) -> WgDeviceConfig {
	WgDeviceConfig {
		address: address.parse().unwrap(),
		..Default::default()
	}
}

#[tokio::test(flavor = "multi_thread")]
async fn overlay_tcp_roundtrip_between_two_devices() {
	let gateway_keys = WgKeyPair::generate();
	let agent_keys = WgKeyPair::generate();

	let (gateway_link, agent_link) = channel_pair();
	let agent_target = agent_link.peer_addr();

	let gateway = Arc::new(WgDevice::new(config("10.0.0.1"), Arc::new(gateway_link)).unwrap());
	let agent = Arc::new(WgDevice::new(config("10.0.0.2"), Arc::new(agent_link)).unwrap());

	gateway
		.configure_self(&gateway_keys.private_key().to_base64(), 51820)
		.await
		.unwrap();
	gateway
		.add_peer(
			&agent_keys.public_key().to_base64(),
			Ipv4Addr::new(10, 0, 0, 2),
		)
		.await
		.unwrap();

	// The agent configures through the text protocol the way a real
	// session does: server peer, whole overlay allowed, known endpoint.
	let agent_uapi = format!(
		"private_key={}\npublic_key={}\nallowed_ip=10.0.0.0/24\nendpoint={}\npersistent_keepalive_interval=25\n",
		agent_keys.private_key().to_hex(),
		gateway_keys.public_key().to_hex(),
		agent_target,
	);
	agent.apply_uapi(&agent_uapi).await.unwrap();

	gateway.start().await.unwrap();
	agent.start().await.unwrap();
	let _gw_tasks = gateway.spawn_all();
	let _agent_tasks = agent.spawn_all();

	// Echo service on the agent's overlay address.
	let mut listener = agent.listen_overlay(8080).await.unwrap();
	tokio::spawn(async move {
		if let Ok((mut stream, _remote)) = listener.accept().await {
			let mut buf = [0u8; 256];
			if let Ok(n) = stream.read(&mut buf).await {
				let _ = stream.write_all(&buf[..n]).await;
				let _ = stream.flush().await;
			}
		}
	});

	// The gateway dials into the overlay. The first attempt races the
	// initial handshake, so allow a generous deadline.
	let target = "10.0.0.2:8080".parse().unwrap();
	let mut stream = None;
	for _ in 0..10 {
		match gateway.dial_overlay(target, Duration::from_secs(5)).await {
			Ok(s) => {
				stream = Some(s);
				break;
			}
			Err(_) => tokio::time::sleep(Duration::from_millis(200)).await,
		}
	}
	let mut stream = stream.expect("overlay dial should succeed once the handshake completes");

	stream.write_all(b"hello through the overlay").await.unwrap();
	stream.flush().await.unwrap();

	let mut buf = [0u8; 256];
	let mut total = 0;
	let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
	let expected = b"hello through the overlay".len();
	while total < expected && tokio::time::Instant::now() < deadline {
		match tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf[total..])).await {
			Ok(Ok(0)) => break,
			Ok(Ok(n)) => total += n,
			_ => break,
		}
	}

	assert_eq!(&buf[..total], b"hello through the overlay");

	gateway.shutdown().await;
	agent.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn dial_overlay_times_out_when_peer_is_silent() {
	let gateway_keys = WgKeyPair::generate();
	let (gateway_link, _agent_link) = channel_pair();

	let gateway = Arc::new(WgDevice::new(config("10.0.0.1"), Arc::new(gateway_link)).unwrap());
	gateway
		.configure_self(&gateway_keys.private_key().to_base64(), 51820)
		.await
		.unwrap();
	gateway.start().await.unwrap();
	let _tasks = gateway.spawn_all();

	let err = gateway
		.dial_overlay("10.0.0.9:80".parse().unwrap(), Duration::from_millis(500))
		.await
		.unwrap_err();

	assert!(matches!(
		err,
		aegis_wg_engine::EngineError::DialTimeout(_)
	));

	gateway.shutdown().await;
}
