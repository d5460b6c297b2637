// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
	#[error("HTTP error: {0}")]
	Http(#[from] reqwest::Error),

	#[error("key error: {0}")]
	Key(#[from] aegis_wg_common::KeyError),

	#[error("credential store error: {0}")]
	KeyFile(#[from] aegis_wg_common::KeyFileError),

	#[error("device error: {0}")]
	Engine(#[from] aegis_wg_engine::EngineError),

	#[error("tunnel error: {0}")]
	Tunnel(#[from] aegis_tunnel_ws::TunnelError),

	#[error("server returned status {0}")]
	ServerStatus(u16),

	#[error("device claim rejected by user")]
	ClaimRejected,

	#[error("timed out waiting for claim approval")]
	ClaimTimeout,

	#[error("too many consecutive heartbeat failures")]
	HeartbeatBudgetExhausted,

	#[error("invalid address: {0}")]
	Addr(#[from] std::net::AddrParseError),

	#[error("socket error: {0}")]
	Io(#[from] std::io::Error),

	#[error("invalid URL: {0}")]
	Url(#[from] url::ParseError),

	#[error("invalid server response: {0}")]
	InvalidResponse(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;
