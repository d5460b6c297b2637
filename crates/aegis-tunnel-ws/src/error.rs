// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunnelError {
	#[error("invalid tunnel URL: {0}")]
	Url(#[from] url::ParseError),

	#[error("WebSocket error: {0}")]
	WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

	#[error("TLS error: {0}")]
	Tls(#[from] native_tls::Error),

	#[error("socket error: {0}")]
	Io(#[from] std::io::Error),

	#[error("tunnel is not connected")]
	NotConnected,

	#[error("local UDP proxy is not started")]
	ProxyNotStarted,

	#[error("tunnel closed by remote")]
	Closed,
}

pub type Result<T> = std::result::Result<T, TunnelError>;
