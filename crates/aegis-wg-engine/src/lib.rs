// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Userspace WireGuard gateway.
//!
//! The device terminates WireGuard inside a smoltcp IPv4 stack, so no
//! kernel TUN interface or elevated privileges are required. Peers are
//! configured through the same line-oriented `key=value` text protocol
//! kernel WireGuard tooling speaks (hex keys, one section per peer),
//! and encrypted datagrams travel over a pluggable [`DatagramTransport`]
//! so direct UDP and tunnelled paths are interchangeable per session.

pub mod device;
pub mod engine;
pub mod error;
pub mod router;
pub mod transport;
pub mod uapi;

pub use device::{OverlayStack, OverlayTcpListener, OverlayTcpStream};
pub use engine::{WgDevice, WgDeviceConfig};
pub use error::{EngineError, Result};
pub use router::Router;
pub use transport::{channel_pair, ChannelTransport, DatagramTransport, UdpTransport};
pub use uapi::{DeviceUpdate, PeerUpdate, UapiError};
