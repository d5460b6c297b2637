// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::Result;
use sqlx::SqlitePool;
use uuid::Uuid;

pub type AgentRowTuple = (
	String,         // id
	String,         // name
	String,         // api_key
	String,         // public_key
	Option<String>, // ip
	String,         // status
	Option<String>, // last_seen
	Option<String>, // user_id
	String,         // routes
	String,         // created_at
);

const AGENT_COLUMNS: &str =
	"id, name, api_key, public_key, ip, status, last_seen, user_id, routes, created_at";

#[derive(Clone)]
pub struct AgentRepository {
	pool: SqlitePool,
}

impl AgentRepository {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	#[tracing::instrument(skip(self, api_key), fields(%id, name))]
	pub async fn insert(
		&self,
		id: Uuid,
		name: &str,
		api_key: &str,
		public_key: &str,
		user_id: Option<Uuid>,
	) -> Result<()> {
		sqlx::query(
			"INSERT INTO agents (id, name, api_key, public_key, user_id, created_at)
			 VALUES (?, ?, ?, ?, ?, datetime('now'))",
		)
		.bind(id.to_string())
		.bind(name)
		.bind(api_key)
		.bind(public_key)
		.bind(user_id.map(|u| u.to_string()))
		.execute(&self.pool)
		.await?;

		Ok(())
	}

	#[tracing::instrument(skip(self), fields(%id))]
	pub async fn get(&self, id: Uuid) -> Result<Option<AgentRowTuple>> {
		let row: Option<AgentRowTuple> = sqlx::query_as(&format!(
			"SELECT {AGENT_COLUMNS} FROM agents WHERE id = ? AND deleted_at IS NULL"
		))
		.bind(id.to_string())
		.fetch_optional(&self.pool)
		.await?;

		Ok(row)
	}

	#[tracing::instrument(skip(self, api_key))]
	pub async fn get_by_api_key(&self, api_key: &str) -> Result<Option<AgentRowTuple>> {
		let row: Option<AgentRowTuple> = sqlx::query_as(&format!(
			"SELECT {AGENT_COLUMNS} FROM agents WHERE api_key = ? AND deleted_at IS NULL"
		))
		.bind(api_key)
		.fetch_optional(&self.pool)
		.await?;

		Ok(row)
	}

	#[tracing::instrument(skip(self, public_key))]
	pub async fn get_by_public_key(&self, public_key: &str) -> Result<Option<AgentRowTuple>> {
		let row: Option<AgentRowTuple> = sqlx::query_as(&format!(
			"SELECT {AGENT_COLUMNS} FROM agents WHERE public_key = ? AND deleted_at IS NULL"
		))
		.bind(public_key)
		.fetch_optional(&self.pool)
		.await?;

		Ok(row)
	}

	#[tracing::instrument(skip(self))]
	pub async fn list(&self) -> Result<Vec<AgentRowTuple>> {
		let rows: Vec<AgentRowTuple> = sqlx::query_as(&format!(
			"SELECT {AGENT_COLUMNS} FROM agents WHERE deleted_at IS NULL ORDER BY created_at"
		))
		.fetch_all(&self.pool)
		.await?;

		Ok(rows)
	}

	#[tracing::instrument(skip(self, public_key), fields(%id))]
	pub async fn update_public_key(&self, id: Uuid, public_key: &str) -> Result<u64> {
		let result = sqlx::query("UPDATE agents SET public_key = ? WHERE id = ?")
			.bind(public_key)
			.bind(id.to_string())
			.execute(&self.pool)
			.await?;

		Ok(result.rows_affected())
	}

	/// Bind the overlay address. The guard clause makes the assignment
	/// immutable: once an agent has an address it keeps it.
	#[tracing::instrument(skip(self), fields(%id, %ip))]
	pub async fn assign_ip(&self, id: Uuid, ip: &str) -> Result<u64> {
		let result = sqlx::query("UPDATE agents SET ip = ? WHERE id = ? AND ip IS NULL")
			.bind(ip)
			.bind(id.to_string())
			.execute(&self.pool)
			.await?;

		Ok(result.rows_affected())
	}

	/// The heartbeat handler is the only caller; this is the only
	/// statement that transitions an agent to online.
	#[tracing::instrument(skip(self), fields(%id))]
	pub async fn mark_online(&self, id: Uuid) -> Result<u64> {
		let result =
			sqlx::query("UPDATE agents SET status = 'online', last_seen = datetime('now') WHERE id = ?")
				.bind(id.to_string())
				.execute(&self.pool)
				.await?;

		Ok(result.rows_affected())
	}

	/// The liveness reaper is the only caller; this is the only
	/// statement that transitions agents to offline.
	#[tracing::instrument(skip(self))]
	pub async fn reap_stale(&self, window_secs: u64) -> Result<u64> {
		let modifier = format!("-{} seconds", window_secs);
		let result = sqlx::query(
			"UPDATE agents SET status = 'offline'
			 WHERE status = 'online' AND last_seen < datetime('now', ?) AND deleted_at IS NULL",
		)
		.bind(modifier)
		.execute(&self.pool)
		.await?;

		Ok(result.rows_affected())
	}

	#[tracing::instrument(skip(self, routes), fields(%id))]
	pub async fn update_routes(&self, id: Uuid, routes: &str) -> Result<u64> {
		let result = sqlx::query("UPDATE agents SET routes = ? WHERE id = ? AND deleted_at IS NULL")
			.bind(routes)
			.bind(id.to_string())
			.execute(&self.pool)
			.await?;

		Ok(result.rows_affected())
	}

	#[tracing::instrument(skip(self), fields(%id, %user_id))]
	pub async fn bind_user(&self, id: Uuid, user_id: Uuid) -> Result<u64> {
		let result = sqlx::query("UPDATE agents SET user_id = ? WHERE id = ? AND user_id IS NULL")
			.bind(user_id.to_string())
			.bind(id.to_string())
			.execute(&self.pool)
			.await?;

		Ok(result.rows_affected())
	}

	#[tracing::instrument(skip(self), fields(%id))]
	pub async fn soft_delete(&self, id: Uuid) -> Result<u64> {
		let result = sqlx::query(
			"UPDATE agents SET deleted_at = datetime('now') WHERE id = ? AND deleted_at IS NULL",
		)
		.bind(id.to_string())
		.execute(&self.pool)
		.await?;

		Ok(result.rows_affected())
	}

	/// Every address ever handed out, soft-deleted agents included.
	/// The allocator never re-issues one of these.
	#[tracing::instrument(skip(self))]
	pub async fn allocated_ips(&self) -> Result<Vec<(String,)>> {
		let rows: Vec<(String,)> = sqlx::query_as("SELECT ip FROM agents WHERE ip IS NOT NULL")
			.fetch_all(&self.pool)
			.await?;

		Ok(rows)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_pool;

	async fn make_repo() -> AgentRepository {
		AgentRepository::new(test_pool().await)
	}

	#[tokio::test]
	async fn insert_and_get_by_api_key() {
		let repo = make_repo().await;
		let id = Uuid::new_v4();

		repo
			.insert(id, "laptop", "sk_live_abc", "PUBKEY", None)
			.await
			.unwrap();

		let row = repo.get_by_api_key("sk_live_abc").await.unwrap().unwrap();
		assert_eq!(row.0, id.to_string());
		assert_eq!(row.1, "laptop");
		assert_eq!(row.3, "PUBKEY");
		assert_eq!(row.4, None);
		assert_eq!(row.5, "offline");
	}

	#[tokio::test]
	async fn api_keys_are_unique() {
		let repo = make_repo().await;

		repo
			.insert(Uuid::new_v4(), "a", "sk_live_dup", "", None)
			.await
			.unwrap();
		let err = repo
			.insert(Uuid::new_v4(), "b", "sk_live_dup", "", None)
			.await;
		assert!(err.is_err());
	}

	#[tokio::test]
	async fn ip_assignment_is_immutable() {
		let repo = make_repo().await;
		let id = Uuid::new_v4();
		repo.insert(id, "a", "sk_live_a", "", None).await.unwrap();

		assert_eq!(repo.assign_ip(id, "10.0.0.2").await.unwrap(), 1);
		assert_eq!(repo.assign_ip(id, "10.0.0.3").await.unwrap(), 0);

		let row = repo.get(id).await.unwrap().unwrap();
		assert_eq!(row.4.as_deref(), Some("10.0.0.2"));
	}

	#[tokio::test]
	async fn mark_online_sets_last_seen() {
		let repo = make_repo().await;
		let id = Uuid::new_v4();
		repo.insert(id, "a", "sk_live_a", "", None).await.unwrap();

		repo.mark_online(id).await.unwrap();

		let row = repo.get(id).await.unwrap().unwrap();
		assert_eq!(row.5, "online");
		assert!(row.6.is_some());
	}

	#[tokio::test]
	async fn reap_stale_only_touches_stale_online_agents() {
		let repo = make_repo().await;
		let fresh = Uuid::new_v4();
		let stale = Uuid::new_v4();
		repo.insert(fresh, "fresh", "sk_live_f", "", None).await.unwrap();
		repo.insert(stale, "stale", "sk_live_s", "", None).await.unwrap();

		repo.mark_online(fresh).await.unwrap();
		repo.mark_online(stale).await.unwrap();

		// Backdate the stale agent past any window.
		sqlx::query("UPDATE agents SET last_seen = datetime('now', '-120 seconds') WHERE id = ?")
			.bind(stale.to_string())
			.execute(&repo.pool)
			.await
			.unwrap();

		let reaped = repo.reap_stale(30).await.unwrap();
		assert_eq!(reaped, 1);

		assert_eq!(repo.get(fresh).await.unwrap().unwrap().5, "online");
		assert_eq!(repo.get(stale).await.unwrap().unwrap().5, "offline");

		// A second pass finds nothing: offline agents stay offline.
		assert_eq!(repo.reap_stale(30).await.unwrap(), 0);
	}

	#[tokio::test]
	async fn soft_deleted_agents_disappear_from_lookups_but_keep_their_ip() {
		let repo = make_repo().await;
		let id = Uuid::new_v4();
		repo.insert(id, "a", "sk_live_a", "", None).await.unwrap();
		repo.assign_ip(id, "10.0.0.2").await.unwrap();

		repo.soft_delete(id).await.unwrap();

		assert!(repo.get(id).await.unwrap().is_none());
		assert!(repo.get_by_api_key("sk_live_a").await.unwrap().is_none());

		let ips = repo.allocated_ips().await.unwrap();
		assert_eq!(ips, vec![("10.0.0.2".to_string(),)]);
	}

	#[tokio::test]
	async fn bind_user_only_fills_empty_slot() {
		let repo = make_repo().await;
		let id = Uuid::new_v4();
		let first = Uuid::new_v4();
		let second = Uuid::new_v4();
		repo.insert(id, "a", "sk_live_a", "", None).await.unwrap();

		assert_eq!(repo.bind_user(id, first).await.unwrap(), 1);
		assert_eq!(repo.bind_user(id, second).await.unwrap(), 0);

		let row = repo.get(id).await.unwrap().unwrap();
		assert_eq!(row.7, Some(first.to_string()));
	}
}
