// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::Result;
use sqlx::SqlitePool;
use uuid::Uuid;

pub type HeartbeatRowTuple = (
	i64,    // id
	String, // agent_id
	i64,    // latency_ms
	i64,    // bytes_sent
	i64,    // bytes_received
	i64,    // active_connections
	f64,    // cpu_usage
	f64,    // memory_usage
	String, // created_at
);

pub type PostureRowTuple = (
	String,         // agent_id
	String,         // os_name
	String,         // os_version
	String,         // hostname
	Option<bool>,   // antivirus_enabled
	Option<String>, // antivirus_name
	Option<bool>,   // firewall_enabled
	Option<bool>,   // disk_encrypted
	Option<bool>,   // screen_lock_enabled
	i64,            // score
	Option<String>, // last_checked
);

#[derive(Debug, Clone, Default)]
pub struct PostureRecord {
	pub os_name: String,
	pub os_version: String,
	pub hostname: String,
	pub antivirus_enabled: Option<bool>,
	pub antivirus_name: Option<String>,
	pub firewall_enabled: Option<bool>,
	pub disk_encrypted: Option<bool>,
	pub screen_lock_enabled: Option<bool>,
	pub score: i64,
}

#[derive(Clone)]
pub struct TelemetryRepository {
	pool: SqlitePool,
}

impl TelemetryRepository {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	#[tracing::instrument(skip(self), fields(%agent_id))]
	#[allow(clippy::too_many_arguments)]
	pub async fn insert_heartbeat(
		&self,
		agent_id: Uuid,
		latency_ms: i64,
		bytes_sent: i64,
		bytes_received: i64,
		active_connections: i64,
		cpu_usage: f64,
		memory_usage: f64,
	) -> Result<()> {
		sqlx::query(
			"INSERT INTO heartbeats
			 (agent_id, latency_ms, bytes_sent, bytes_received, active_connections, cpu_usage, memory_usage, created_at)
			 VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
		)
		.bind(agent_id.to_string())
		.bind(latency_ms)
		.bind(bytes_sent)
		.bind(bytes_received)
		.bind(active_connections)
		.bind(cpu_usage)
		.bind(memory_usage)
		.execute(&self.pool)
		.await?;

		Ok(())
	}

	#[tracing::instrument(skip(self), fields(%agent_id, limit))]
	pub async fn list_heartbeats(&self, agent_id: Uuid, limit: i64) -> Result<Vec<HeartbeatRowTuple>> {
		let rows: Vec<HeartbeatRowTuple> = sqlx::query_as(
			"SELECT id, agent_id, latency_ms, bytes_sent, bytes_received, active_connections, cpu_usage, memory_usage, created_at
			 FROM heartbeats WHERE agent_id = ? ORDER BY id DESC LIMIT ?",
		)
		.bind(agent_id.to_string())
		.bind(limit)
		.fetch_all(&self.pool)
		.await?;

		Ok(rows)
	}

	/// Latest snapshot per agent; each report replaces the previous.
	/// NULL security booleans mean the agent could not determine the
	/// signal, which is distinct from a confirmed `false`.
	#[tracing::instrument(skip(self, posture), fields(%agent_id))]
	pub async fn upsert_posture(&self, agent_id: Uuid, posture: &PostureRecord) -> Result<()> {
		sqlx::query(
			"INSERT INTO device_postures
			 (agent_id, os_name, os_version, hostname, antivirus_enabled, antivirus_name,
			  firewall_enabled, disk_encrypted, screen_lock_enabled, score, last_checked)
			 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))
			 ON CONFLICT(agent_id) DO UPDATE SET
			  os_name = excluded.os_name,
			  os_version = excluded.os_version,
			  hostname = excluded.hostname,
			  antivirus_enabled = excluded.antivirus_enabled,
			  antivirus_name = excluded.antivirus_name,
			  firewall_enabled = excluded.firewall_enabled,
			  disk_encrypted = excluded.disk_encrypted,
			  screen_lock_enabled = excluded.screen_lock_enabled,
			  score = excluded.score,
			  last_checked = excluded.last_checked",
		)
		.bind(agent_id.to_string())
		.bind(&posture.os_name)
		.bind(&posture.os_version)
		.bind(&posture.hostname)
		.bind(posture.antivirus_enabled)
		.bind(&posture.antivirus_name)
		.bind(posture.firewall_enabled)
		.bind(posture.disk_encrypted)
		.bind(posture.screen_lock_enabled)
		.bind(posture.score)
		.execute(&self.pool)
		.await?;

		Ok(())
	}

	#[tracing::instrument(skip(self), fields(%agent_id))]
	pub async fn get_posture(&self, agent_id: Uuid) -> Result<Option<PostureRowTuple>> {
		let row: Option<PostureRowTuple> = sqlx::query_as(
			"SELECT agent_id, os_name, os_version, hostname, antivirus_enabled, antivirus_name,
			        firewall_enabled, disk_encrypted, screen_lock_enabled, score, last_checked
			 FROM device_postures WHERE agent_id = ?",
		)
		.bind(agent_id.to_string())
		.fetch_optional(&self.pool)
		.await?;

		Ok(row)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_pool;

	async fn make_repo() -> TelemetryRepository {
		TelemetryRepository::new(test_pool().await)
	}

	#[tokio::test]
	async fn heartbeats_append_and_list_newest_first() {
		let repo = make_repo().await;
		let agent = Uuid::new_v4();

		for i in 0..5 {
			repo
				.insert_heartbeat(agent, i, 0, 0, 0, 1.0, 2.0)
				.await
				.unwrap();
		}

		let rows = repo.list_heartbeats(agent, 3).await.unwrap();
		assert_eq!(rows.len(), 3);
		assert_eq!(rows[0].2, 4);
		assert_eq!(rows[2].2, 2);
	}

	#[tokio::test]
	async fn posture_upsert_replaces_snapshot() {
		let repo = make_repo().await;
		let agent = Uuid::new_v4();

		let mut posture = PostureRecord {
			os_name: "linux".into(),
			os_version: "6.8".into(),
			hostname: "box".into(),
			firewall_enabled: Some(true),
			score: 45,
			..Default::default()
		};
		repo.upsert_posture(agent, &posture).await.unwrap();

		posture.firewall_enabled = Some(false);
		posture.score = 20;
		repo.upsert_posture(agent, &posture).await.unwrap();

		let row = repo.get_posture(agent).await.unwrap().unwrap();
		assert_eq!(row.6, Some(false));
		assert_eq!(row.9, 20);
	}

	#[tokio::test]
	async fn unknown_signals_stay_null() {
		let repo = make_repo().await;
		let agent = Uuid::new_v4();

		let posture = PostureRecord {
			os_name: "linux".into(),
			os_version: "6.8".into(),
			hostname: "box".into(),
			score: 20,
			..Default::default()
		};
		repo.upsert_posture(agent, &posture).await.unwrap();

		let row = repo.get_posture(agent).await.unwrap().unwrap();
		assert_eq!(row.4, None);
		assert_eq!(row.6, None);
		assert_eq!(row.7, None);
	}
}
