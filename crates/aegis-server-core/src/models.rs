// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{CoreError, Result};
use aegis_server_db::{AgentRowTuple, ClaimRowTuple, HeartbeatRowTuple};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
	Online,
	Offline,
}

impl AgentStatus {
	fn parse(s: &str) -> Result<Self> {
		match s {
			"online" => Ok(Self::Online),
			"offline" => Ok(Self::Offline),
			other => Err(CoreError::Internal(format!("invalid agent status: {other}"))),
		}
	}
}

impl fmt::Display for AgentStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Online => write!(f, "online"),
			Self::Offline => write!(f, "offline"),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
	Pending,
	Approved,
	Rejected,
}

impl ClaimStatus {
	fn parse(s: &str) -> Result<Self> {
		match s {
			"pending" => Ok(Self::Pending),
			"approved" => Ok(Self::Approved),
			"rejected" => Ok(Self::Rejected),
			other => Err(CoreError::Internal(format!("invalid claim status: {other}"))),
		}
	}
}

impl fmt::Display for ClaimStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Pending => write!(f, "pending"),
			Self::Approved => write!(f, "approved"),
			Self::Rejected => write!(f, "rejected"),
		}
	}
}

/// Persistent record for an enrolled device.
#[derive(Debug, Clone, Serialize)]
pub struct Agent {
	pub id: Uuid,
	pub name: String,
	#[serde(skip_serializing_if = "String::is_empty")]
	pub api_key: String,
	pub public_key: String,
	pub ip: Option<Ipv4Addr>,
	pub status: AgentStatus,
	pub last_seen: Option<DateTime<Utc>>,
	pub user_id: Option<Uuid>,
	pub routes: serde_json::Value,
	pub created_at: DateTime<Utc>,
}

impl TryFrom<AgentRowTuple> for Agent {
	type Error = CoreError;

	fn try_from(row: AgentRowTuple) -> Result<Self> {
		let (id, name, api_key, public_key, ip, status, last_seen, user_id, routes, created_at) = row;

		Ok(Agent {
			id: id
				.parse()
				.map_err(|_| CoreError::Internal("invalid agent id".to_string()))?,
			name,
			api_key,
			public_key,
			ip: ip
				.map(|s| {
					s.parse()
						.map_err(|_| CoreError::Internal(format!("invalid overlay address: {s}")))
				})
				.transpose()?,
			status: AgentStatus::parse(&status)?,
			last_seen: last_seen.as_deref().map(parse_datetime).transpose()?,
			user_id: user_id
				.map(|s| {
					s.parse()
						.map_err(|_| CoreError::Internal("invalid user id".to_string()))
				})
				.transpose()?,
			routes: serde_json::from_str(&routes).unwrap_or(serde_json::Value::Array(vec![])),
			created_at: parse_datetime(&created_at)?,
		})
	}
}

/// Short-lived enrollment ticket.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceClaim {
	pub token: String,
	pub public_key: String,
	pub hostname: String,
	pub remote_ip: String,
	pub status: ClaimStatus,
	pub user_id: Option<Uuid>,
	pub created_at: DateTime<Utc>,
}

impl TryFrom<ClaimRowTuple> for DeviceClaim {
	type Error = CoreError;

	fn try_from(row: ClaimRowTuple) -> Result<Self> {
		let (token, public_key, hostname, remote_ip, status, user_id, created_at) = row;

		Ok(DeviceClaim {
			token,
			public_key,
			hostname,
			remote_ip,
			status: ClaimStatus::parse(&status)?,
			user_id: user_id
				.map(|s| {
					s.parse()
						.map_err(|_| CoreError::Internal("invalid user id".to_string()))
				})
				.transpose()?,
			created_at: parse_datetime(&created_at)?,
		})
	}
}

/// One heartbeat sample as returned by the metrics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatRow {
	pub id: i64,
	pub agent_id: Uuid,
	pub heartbeat_latency_ms: i64,
	pub bytes_sent: i64,
	pub bytes_received: i64,
	pub active_connections: i64,
	pub cpu_usage: f64,
	pub memory_usage: f64,
	pub created_at: DateTime<Utc>,
}

impl TryFrom<HeartbeatRowTuple> for HeartbeatRow {
	type Error = CoreError;

	fn try_from(row: HeartbeatRowTuple) -> Result<Self> {
		let (
			id,
			agent_id,
			latency_ms,
			bytes_sent,
			bytes_received,
			active_connections,
			cpu_usage,
			memory_usage,
			created_at,
		) = row;

		Ok(HeartbeatRow {
			id,
			agent_id: agent_id
				.parse()
				.map_err(|_| CoreError::Internal("invalid agent id".to_string()))?,
			heartbeat_latency_ms: latency_ms,
			bytes_sent,
			bytes_received,
			active_connections,
			cpu_usage,
			memory_usage,
			created_at: parse_datetime(&created_at)?,
		})
	}
}

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
	DateTime::parse_from_rfc3339(s)
		.map(|dt| dt.with_timezone(&Utc))
		.or_else(|_| {
			chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
				.map(|ndt| ndt.and_utc())
				.map_err(|_| CoreError::Internal(format!("invalid datetime: {s}")))
		})
}
