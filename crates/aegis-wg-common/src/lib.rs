// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Key material shared between the AEGIS gateway and agents.
//!
//! WireGuard keys cross three boundaries in this system, each with its
//! own encoding: raw 32-byte arrays in memory, base64 on the HTTP
//! control surface, and hex on the device's line-oriented control
//! protocol. This crate owns the types and the transcoding so the
//! conversion points stay explicit.

pub mod keys;
pub mod keys_file;

pub use keys::{KeyError, WgKeyPair, WgPrivateKey, WgPublicKey};
pub use keys_file::{
	load_credential, load_key_from_file, save_credential, save_key_to_file, KeyFileError,
};
