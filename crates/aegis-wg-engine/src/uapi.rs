// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Line-oriented device control protocol.
//!
//! Configuration is newline-separated `key=value` pairs. A
//! `public_key=` line opens a peer section; every subsequent line
//! belongs to that peer until the next `public_key=` line. Keys on
//! this surface are hex-encoded; base64 is converted at this boundary.
//!
//! ```text
//! private_key=<hex>
//! listen_port=51820
//!
//! public_key=<hex>
//! allowed_ip=10.0.0.2/32
//! endpoint=127.0.0.1:51820
//! persistent_keepalive_interval=25
//! remove=true
//! ```

use aegis_wg_common::WgPublicKey;
use ipnet::Ipv4Net;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UapiError {
	#[error("line {0}: expected key=value, got {1:?}")]
	Malformed(usize, String),

	#[error("line {0}: unknown key {1:?}")]
	UnknownKey(usize, String),

	#[error("line {0}: invalid value for {1}: {2}")]
	InvalidValue(usize, &'static str, String),

	#[error("line {0}: {1} is only valid inside a peer section")]
	OutsidePeerSection(usize, &'static str),
}

pub type Result<T> = std::result::Result<T, UapiError>;

#[derive(Debug, Default)]
pub struct DeviceUpdate {
	pub private_key: Option<[u8; 32]>,
	pub listen_port: Option<u16>,
	pub peers: Vec<PeerUpdate>,
}

#[derive(Debug)]
pub struct PeerUpdate {
	pub public_key: WgPublicKey,
	pub allowed_ip: Option<Ipv4Net>,
	pub endpoint: Option<SocketAddr>,
	pub persistent_keepalive: Option<u16>,
	pub remove: bool,
}

impl PeerUpdate {
	fn new(public_key: WgPublicKey) -> Self {
		Self {
			public_key,
			allowed_ip: None,
			endpoint: None,
			persistent_keepalive: None,
			remove: false,
		}
	}
}

pub fn parse(text: &str) -> Result<DeviceUpdate> {
	let mut update = DeviceUpdate::default();
	let mut current: Option<PeerUpdate> = None;

	for (idx, raw) in text.lines().enumerate() {
		let lineno = idx + 1;
		let line = raw.trim();
		if line.is_empty() {
			continue;
		}

		let (key, value) = line
			.split_once('=')
			.ok_or_else(|| UapiError::Malformed(lineno, line.to_string()))?;

		match key {
			"private_key" => {
				let bytes = hex_key(lineno, "private_key", value)?;
				update.private_key = Some(bytes);
			}
			"listen_port" => {
				let port = value
					.parse()
					.map_err(|_| UapiError::InvalidValue(lineno, "listen_port", value.to_string()))?;
				update.listen_port = Some(port);
			}
			"public_key" => {
				if let Some(peer) = current.take() {
					update.peers.push(peer);
				}
				let bytes = hex_key(lineno, "public_key", value)?;
				current = Some(PeerUpdate::new(WgPublicKey::from_bytes(bytes)));
			}
			"allowed_ip" => {
				let peer = current
					.as_mut()
					.ok_or(UapiError::OutsidePeerSection(lineno, "allowed_ip"))?;
				let net = value
					.parse()
					.map_err(|_| UapiError::InvalidValue(lineno, "allowed_ip", value.to_string()))?;
				peer.allowed_ip = Some(net);
			}
			"endpoint" => {
				let peer = current
					.as_mut()
					.ok_or(UapiError::OutsidePeerSection(lineno, "endpoint"))?;
				let addr = value
					.parse()
					.map_err(|_| UapiError::InvalidValue(lineno, "endpoint", value.to_string()))?;
				peer.endpoint = Some(addr);
			}
			"persistent_keepalive_interval" => {
				let peer = current
					.as_mut()
					.ok_or(UapiError::OutsidePeerSection(lineno, "persistent_keepalive_interval"))?;
				let secs = value.parse().map_err(|_| {
					UapiError::InvalidValue(lineno, "persistent_keepalive_interval", value.to_string())
				})?;
				peer.persistent_keepalive = Some(secs);
			}
			"remove" => {
				let peer = current
					.as_mut()
					.ok_or(UapiError::OutsidePeerSection(lineno, "remove"))?;
				peer.remove = value == "true";
			}
			other => return Err(UapiError::UnknownKey(lineno, other.to_string())),
		}
	}

	if let Some(peer) = current.take() {
		update.peers.push(peer);
	}

	Ok(update)
}

fn hex_key(lineno: usize, field: &'static str, value: &str) -> Result<[u8; 32]> {
	let bytes =
		hex::decode(value).map_err(|_| UapiError::InvalidValue(lineno, field, value.to_string()))?;
	bytes
		.try_into()
		.map_err(|_| UapiError::InvalidValue(lineno, field, value.to_string()))
}

pub fn format_device(private_key_hex: &str, listen_port: u16) -> String {
	format!("private_key={}\nlisten_port={}\n", private_key_hex, listen_port)
}

pub fn format_peer_add(public_key_hex: &str, allowed_ip: Ipv4Net) -> String {
	format!("public_key={}\nallowed_ip={}\n", public_key_hex, allowed_ip)
}

pub fn format_peer_remove(public_key_hex: &str) -> String {
	format!("public_key={}\nremove=true\n", public_key_hex)
}

#[cfg(test)]
mod tests {
	use super::*;
	use aegis_wg_common::WgKeyPair;

	#[test]
	fn parses_device_section() {
		let keypair = WgKeyPair::generate();
		let text = format_device(&keypair.private_key().to_hex(), 51820);

		let update = parse(&text).unwrap();
		assert_eq!(
			update.private_key,
			Some(*keypair.private_key().expose_bytes())
		);
		assert_eq!(update.listen_port, Some(51820));
		assert!(update.peers.is_empty());
	}

	#[test]
	fn parses_full_agent_config() {
		let server = WgKeyPair::generate();
		let agent = WgKeyPair::generate();
		let text = format!(
			"private_key={}\npublic_key={}\nallowed_ip=10.0.0.0/24\nendpoint=127.0.0.1:51820\npersistent_keepalive_interval=25\n",
			agent.private_key().to_hex(),
			server.public_key().to_hex(),
		);

		let update = parse(&text).unwrap();
		assert_eq!(update.peers.len(), 1);
		let peer = &update.peers[0];
		assert_eq!(peer.public_key, *server.public_key());
		assert_eq!(peer.allowed_ip, Some("10.0.0.0/24".parse().unwrap()));
		assert_eq!(peer.endpoint, Some("127.0.0.1:51820".parse().unwrap()));
		assert_eq!(peer.persistent_keepalive, Some(25));
		assert!(!peer.remove);
	}

	#[test]
	fn parses_multiple_peer_sections() {
		let a = WgKeyPair::generate();
		let b = WgKeyPair::generate();
		let text = format!(
			"{}{}",
			format_peer_add(&a.public_key().to_hex(), "10.0.0.2/32".parse().unwrap()),
			format_peer_remove(&b.public_key().to_hex()),
		);

		let update = parse(&text).unwrap();
		assert_eq!(update.peers.len(), 2);
		assert!(!update.peers[0].remove);
		assert!(update.peers[1].remove);
		assert_eq!(update.peers[1].public_key, *b.public_key());
	}

	#[test]
	fn blank_lines_are_ignored() {
		let keypair = WgKeyPair::generate();
		let text = format!("\nprivate_key={}\n\nlisten_port=51820\n\n", keypair.private_key().to_hex());
		let update = parse(&text).unwrap();
		assert_eq!(update.listen_port, Some(51820));
	}

	#[test]
	fn rejects_peer_keys_outside_section() {
		let err = parse("allowed_ip=10.0.0.2/32\n").unwrap_err();
		assert!(matches!(err, UapiError::OutsidePeerSection(1, _)));
	}

	#[test]
	fn rejects_unknown_keys() {
		let err = parse("fwmark=1234\n").unwrap_err();
		assert!(matches!(err, UapiError::UnknownKey(1, _)));
	}

	#[test]
	fn rejects_short_hex_key() {
		let err = parse("private_key=abcd\n").unwrap_err();
		assert!(matches!(err, UapiError::InvalidValue(1, "private_key", _)));
	}

	#[test]
	fn rejects_malformed_line() {
		let err = parse("private_key\n").unwrap_err();
		assert!(matches!(err, UapiError::Malformed(1, _)));
	}
}
