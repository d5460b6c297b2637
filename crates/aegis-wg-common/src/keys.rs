// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use base64::prelude::*;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};

pub const KEY_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
	#[error("invalid base64: {0}")]
	Base64(#[from] base64::DecodeError),

	#[error("invalid hex: {0}")]
	Hex(#[from] hex::FromHexError),

	#[error("invalid key length: expected 32 bytes, got {0}")]
	Length(usize),
}

pub type Result<T> = std::result::Result<T, KeyError>;

fn decode_b64(s: &str) -> Result<[u8; KEY_LEN]> {
	let bytes = BASE64_STANDARD.decode(s.trim())?;
	let len = bytes.len();
	bytes.try_into().map_err(|_| KeyError::Length(len))
}

fn decode_hex(s: &str) -> Result<[u8; KEY_LEN]> {
	let bytes = hex::decode(s.trim())?;
	let len = bytes.len();
	bytes.try_into().map_err(|_| KeyError::Length(len))
}

/// Clamp a scalar per the WireGuard/X25519 rules: clear the low three
/// bits of byte 0, clear the high bit of byte 31, set bit 6 of byte 31.
pub fn clamp(bytes: &mut [u8; KEY_LEN]) {
	bytes[0] &= 248;
	bytes[31] &= 127;
	bytes[31] |= 64;
}

/// An X25519 public key identifying a peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WgPublicKey([u8; KEY_LEN]);

impl WgPublicKey {
	pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
		Self(bytes)
	}

	pub fn from_base64(s: &str) -> Result<Self> {
		Ok(Self(decode_b64(s)?))
	}

	pub fn from_hex(s: &str) -> Result<Self> {
		Ok(Self(decode_hex(s)?))
	}

	pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
		&self.0
	}

	pub fn to_base64(&self) -> String {
		BASE64_STANDARD.encode(self.0)
	}

	pub fn to_hex(&self) -> String {
		hex::encode(self.0)
	}
}

impl fmt::Display for WgPublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.to_base64())
	}
}

impl fmt::Debug for WgPublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "WgPublicKey({})", self.to_base64())
	}
}

/// An X25519 private key. Never printed; `Debug` shows a placeholder.
#[derive(Clone)]
pub struct WgPrivateKey([u8; KEY_LEN]);

impl WgPrivateKey {
	pub fn from_bytes(mut bytes: [u8; KEY_LEN]) -> Self {
		clamp(&mut bytes);
		Self(bytes)
	}

	pub fn from_base64(s: &str) -> Result<Self> {
		Ok(Self::from_bytes(decode_b64(s)?))
	}

	pub fn from_hex(s: &str) -> Result<Self> {
		Ok(Self::from_bytes(decode_hex(s)?))
	}

	pub fn expose_bytes(&self) -> &[u8; KEY_LEN] {
		&self.0
	}

	pub fn to_base64(&self) -> String {
		BASE64_STANDARD.encode(self.0)
	}

	pub fn to_hex(&self) -> String {
		hex::encode(self.0)
	}

	pub fn public_key(&self) -> WgPublicKey {
		let secret = StaticSecret::from(self.0);
		WgPublicKey(*PublicKey::from(&secret).as_bytes())
	}
}

impl fmt::Debug for WgPrivateKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "WgPrivateKey(..)")
	}
}

/// A private/public keypair. Agents generate a fresh one per session.
#[derive(Debug, Clone)]
pub struct WgKeyPair {
	private: WgPrivateKey,
	public: WgPublicKey,
}

impl WgKeyPair {
	pub fn generate() -> Self {
		let mut bytes = [0u8; KEY_LEN];
		rand::rngs::OsRng.fill_bytes(&mut bytes);
		Self::from_private_key(WgPrivateKey::from_bytes(bytes))
	}

	pub fn from_private_key(private: WgPrivateKey) -> Self {
		let public = private.public_key();
		Self { private, public }
	}

	pub fn private_key(&self) -> &WgPrivateKey {
		&self.private
	}

	pub fn public_key(&self) -> &WgPublicKey {
		&self.public
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn generated_keys_are_clamped() {
		for _ in 0..32 {
			let keypair = WgKeyPair::generate();
			let bytes = keypair.private_key().expose_bytes();
			assert_eq!(bytes[0] & 7, 0);
			assert_eq!(bytes[31] & 128, 0);
			assert_eq!(bytes[31] & 64, 64);
		}
	}

	#[test]
	fn base64_roundtrip() {
		let keypair = WgKeyPair::generate();
		let b64 = keypair.public_key().to_base64();
		let parsed = WgPublicKey::from_base64(&b64).unwrap();
		assert_eq!(*keypair.public_key(), parsed);
	}

	#[test]
	fn hex_roundtrip() {
		let keypair = WgKeyPair::generate();
		let hex = keypair.public_key().to_hex();
		assert_eq!(hex.len(), 64);
		let parsed = WgPublicKey::from_hex(&hex).unwrap();
		assert_eq!(*keypair.public_key(), parsed);
	}

	#[test]
	fn private_key_roundtrips_through_base64() {
		let keypair = WgKeyPair::generate();
		let b64 = keypair.private_key().to_base64();
		let restored = WgKeyPair::from_private_key(WgPrivateKey::from_base64(&b64).unwrap());
		assert_eq!(keypair.public_key(), restored.public_key());
	}

	#[test]
	fn rejects_wrong_length() {
		assert!(matches!(
			WgPublicKey::from_base64("AAAA"),
			Err(KeyError::Length(3))
		));
	}

	#[test]
	fn rejects_invalid_encoding() {
		assert!(WgPublicKey::from_base64("not valid base64!!").is_err());
		assert!(WgPublicKey::from_hex("zz").is_err());
	}

	#[test]
	fn generated_keys_are_unique() {
		let a = WgKeyPair::generate();
		let b = WgKeyPair::generate();
		assert_ne!(a.public_key(), b.public_key());
	}

	#[test]
	fn debug_does_not_leak_private_key() {
		let keypair = WgKeyPair::generate();
		let debug = format!("{:?}", keypair.private_key());
		assert!(!debug.contains(&keypair.private_key().to_base64()));
	}
}
