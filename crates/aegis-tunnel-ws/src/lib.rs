// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! WebSocket firewall-bypass tunnel.
//!
//! Carries WireGuard's UDP datagrams inside a persistent WebSocket so
//! agents behind UDP-hostile networks still reach the gateway over
//! TCP/TLS/443. One datagram maps to exactly one binary frame; the
//! WebSocket's own message boundaries are the framing, so there is no
//! length prefix. Text frames are ignored, close frames end the
//! session. WireGuard handles reordering and loss itself, so the
//! tunnel only promises datagram-best-effort delivery.

pub mod client;
pub mod error;
pub mod server;

pub use client::WsTunnelClient;
pub use error::{Result, TunnelError};
pub use server::WsTunnelServer;

/// Largest datagram carried per frame. WireGuard datagrams never
/// exceed a UDP payload.
pub const MAX_DATAGRAM: usize = 65535;

/// UDP reads block at most this long so the pump can observe the
/// shutdown signal even on an idle tunnel.
pub const READ_DEADLINE: std::time::Duration = std::time::Duration::from_secs(30);
