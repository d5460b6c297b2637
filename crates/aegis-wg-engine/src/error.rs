// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
	#[error("device error: {0}")]
	Device(String),

	#[error("invalid key: {0}")]
	Key(#[from] aegis_wg_common::KeyError),

	#[error("control protocol error: {0}")]
	Uapi(#[from] crate::uapi::UapiError),

	#[error("device has no private key configured")]
	NotConfigured,

	#[error("transport error: {0}")]
	Transport(#[from] std::io::Error),

	#[error("overlay connection refused by {0}")]
	ConnectionRefused(std::net::SocketAddrV4),

	#[error("overlay dial to {0} timed out")]
	DialTimeout(std::net::SocketAddrV4),

	#[error("tcp connect failed: {0}")]
	TcpConnect(String),

	#[error("device already running")]
	AlreadyRunning,
}

pub type Result<T> = std::result::Result<T, EngineError>;
