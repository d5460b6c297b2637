// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{CoreError, Result};
use crate::models::{Agent, HeartbeatRow};
use aegis_server_db::{AgentRepository, PostureRecord, TelemetryRepository};
use serde::Deserialize;
use tracing::instrument;
use uuid::Uuid;

/// Wire shape of the posture block inside a heartbeat. The security
/// booleans are optional: an agent that cannot determine a signal
/// reports nothing, which is not the same as reporting `false`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PostureUpdate {
	#[serde(default)]
	pub os_name: String,
	#[serde(default)]
	pub os_version: String,
	#[serde(default)]
	pub hostname: String,
	#[serde(default)]
	pub antivirus_enabled: Option<bool>,
	#[serde(default)]
	pub antivirus_name: Option<String>,
	#[serde(default)]
	pub firewall_enabled: Option<bool>,
	#[serde(default)]
	pub disk_encrypted: Option<bool>,
	#[serde(default)]
	pub screen_lock_enabled: Option<bool>,
	#[serde(default)]
	pub posture_score: i64,
}

/// Wire shape of one heartbeat POST.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatSample {
	pub api_key: String,
	#[serde(default)]
	pub heartbeat_latency_ms: i64,
	#[serde(default)]
	pub bytes_sent: i64,
	#[serde(default)]
	pub bytes_received: i64,
	#[serde(default)]
	pub active_connections: i64,
	#[serde(default)]
	pub cpu_usage: f64,
	#[serde(default)]
	pub memory_usage: f64,
	#[serde(default)]
	pub posture: Option<PostureUpdate>,
}

#[derive(Clone)]
pub struct HeartbeatService {
	agents: AgentRepository,
	telemetry: TelemetryRepository,
}

impl HeartbeatService {
	pub fn new(agents: AgentRepository, telemetry: TelemetryRepository) -> Self {
		Self { agents, telemetry }
	}

	/// Apply one heartbeat: refresh liveness (this is the only online
	/// transition in the system), append the sample, upsert posture.
	/// Samples are applied in arrival order; `last_seen` is
	/// last-writer-wins, which tolerates reordering.
	#[instrument(skip(self, sample))]
	pub async fn record(&self, sample: &HeartbeatSample) -> Result<()> {
		let agent: Agent = self
			.agents
			.get_by_api_key(&sample.api_key)
			.await?
			.ok_or(CoreError::InvalidCredential)?
			.try_into()?;

		self.agents.mark_online(agent.id).await?;

		self
			.telemetry
			.insert_heartbeat(
				agent.id,
				sample.heartbeat_latency_ms,
				sample.bytes_sent,
				sample.bytes_received,
				sample.active_connections,
				sample.cpu_usage,
				sample.memory_usage,
			)
			.await?;

		if let Some(posture) = &sample.posture {
			let record = PostureRecord {
				os_name: posture.os_name.clone(),
				os_version: posture.os_version.clone(),
				hostname: posture.hostname.clone(),
				antivirus_enabled: posture.antivirus_enabled,
				antivirus_name: posture.antivirus_name.clone(),
				firewall_enabled: posture.firewall_enabled,
				disk_encrypted: posture.disk_encrypted,
				screen_lock_enabled: posture.screen_lock_enabled,
				score: posture.posture_score,
			};
			self.telemetry.upsert_posture(agent.id, &record).await?;
		}

		Ok(())
	}

	#[instrument(skip(self), fields(%agent_id, limit))]
	pub async fn list_samples(&self, agent_id: Uuid, limit: i64) -> Result<Vec<HeartbeatRow>> {
		let rows = self.telemetry.list_heartbeats(agent_id, limit).await?;
		rows.into_iter().map(HeartbeatRow::try_from).collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::models::AgentStatus;
	use crate::testing;

	async fn service() -> (HeartbeatService, AgentRepository, Uuid) {
		let pool = testing::pool().await;
		let agents = AgentRepository::new(pool.clone());
		let telemetry = TelemetryRepository::new(pool);

		let id = Uuid::new_v4();
		agents
			.insert(id, "laptop", "sk_live_hb", "", None)
			.await
			.unwrap();

		(HeartbeatService::new(agents.clone(), telemetry), agents, id)
	}

	fn sample(api_key: &str) -> HeartbeatSample {
		HeartbeatSample {
			api_key: api_key.to_string(),
			heartbeat_latency_ms: 12,
			bytes_sent: 100,
			bytes_received: 200,
			active_connections: 1,
			cpu_usage: 3.0,
			memory_usage: 42.5,
			posture: None,
		}
	}

	#[tokio::test]
	async fn heartbeat_marks_agent_online_and_appends_sample() {
		let (svc, agents, id) = service().await;

		svc.record(&sample("sk_live_hb")).await.unwrap();

		let agent: Agent = agents.get(id).await.unwrap().unwrap().try_into().unwrap();
		assert_eq!(agent.status, AgentStatus::Online);
		assert!(agent.last_seen.is_some());

		let rows = svc.list_samples(id, 10).await.unwrap();
		assert_eq!(rows.len(), 1);
		assert_eq!(rows[0].heartbeat_latency_ms, 12);
	}

	#[tokio::test]
	async fn heartbeat_rejects_bad_credential() {
		let (svc, _agents, _id) = service().await;

		let err = svc.record(&sample("sk_live_wrong")).await.unwrap_err();
		assert!(matches!(err, CoreError::InvalidCredential));
	}

	#[tokio::test]
	async fn posture_block_is_upserted_with_unknowns_preserved() {
		let (svc, _agents, id) = service().await;

		let mut hb = sample("sk_live_hb");
		hb.posture = Some(PostureUpdate {
			os_name: "linux".into(),
			os_version: "6.8".into(),
			hostname: "box".into(),
			firewall_enabled: Some(true),
			posture_score: 45,
			..Default::default()
		});
		svc.record(&hb).await.unwrap();

		let row = svc.telemetry.get_posture(id).await.unwrap().unwrap();
		assert_eq!(row.6, Some(true));
		assert_eq!(row.4, None, "unreported antivirus stays unknown");
		assert_eq!(row.9, 45);
	}

	#[tokio::test]
	async fn sample_json_decodes_with_posture() {
		let json = serde_json::json!({
			"api_key": "sk_live_x",
			"heartbeat_latency_ms": 7,
			"bytes_sent": 0,
			"bytes_received": 0,
			"active_connections": 0,
			"cpu_usage": 2.0,
			"memory_usage": 10.0,
			"posture": {
				"os_name": "linux",
				"os_version": "6.8",
				"hostname": "box",
				"firewall_enabled": true,
				"posture_score": 45
			}
		});

		let sample: HeartbeatSample = serde_json::from_value(json).unwrap();
		let posture = sample.posture.unwrap();
		assert_eq!(posture.firewall_enabled, Some(true));
		assert_eq!(posture.antivirus_enabled, None);
	}
}
