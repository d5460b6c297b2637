// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::Result;
use sqlx::SqlitePool;
use uuid::Uuid;

pub type ClaimRowTuple = (
	String,         // token
	String,         // public_key
	String,         // hostname
	String,         // remote_ip
	String,         // status
	Option<String>, // user_id
	String,         // created_at
);

const CLAIM_COLUMNS: &str = "token, public_key, hostname, remote_ip, status, user_id, created_at";

#[derive(Clone)]
pub struct ClaimRepository {
	pool: SqlitePool,
}

impl ClaimRepository {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	#[tracing::instrument(skip(self, token, public_key))]
	pub async fn insert(
		&self,
		token: &str,
		public_key: &str,
		hostname: &str,
		remote_ip: &str,
	) -> Result<()> {
		sqlx::query(
			"INSERT INTO device_claims (token, public_key, hostname, remote_ip, status, created_at)
			 VALUES (?, ?, ?, ?, 'pending', datetime('now'))",
		)
		.bind(token)
		.bind(public_key)
		.bind(hostname)
		.bind(remote_ip)
		.execute(&self.pool)
		.await?;

		Ok(())
	}

	#[tracing::instrument(skip(self, token))]
	pub async fn get(&self, token: &str) -> Result<Option<ClaimRowTuple>> {
		let row: Option<ClaimRowTuple> = sqlx::query_as(&format!(
			"SELECT {CLAIM_COLUMNS} FROM device_claims WHERE token = ?"
		))
		.bind(token)
		.fetch_optional(&self.pool)
		.await?;

		Ok(row)
	}

	/// Conditional transition to `approved`. The `status = 'pending'`
	/// guard serializes concurrent approvals: exactly one caller sees
	/// a row change.
	#[tracing::instrument(skip(self, token), fields(%user_id))]
	pub async fn approve(&self, token: &str, user_id: Uuid) -> Result<u64> {
		let result = sqlx::query(
			"UPDATE device_claims SET status = 'approved', user_id = ?
			 WHERE token = ? AND status = 'pending'",
		)
		.bind(user_id.to_string())
		.bind(token)
		.execute(&self.pool)
		.await?;

		Ok(result.rows_affected())
	}

	#[tracing::instrument(skip(self, token))]
	pub async fn reject(&self, token: &str) -> Result<u64> {
		let result = sqlx::query(
			"UPDATE device_claims SET status = 'rejected'
			 WHERE token = ? AND status = 'pending'",
		)
		.bind(token)
		.execute(&self.pool)
		.await?;

		Ok(result.rows_affected())
	}

	/// Garbage-collect claims past their TTL, whatever their state.
	#[tracing::instrument(skip(self))]
	pub async fn delete_expired(&self, ttl_secs: u64) -> Result<u64> {
		let modifier = format!("-{} seconds", ttl_secs);
		let result = sqlx::query("DELETE FROM device_claims WHERE created_at < datetime('now', ?)")
			.bind(modifier)
			.execute(&self.pool)
			.await?;

		Ok(result.rows_affected())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_pool;

	async fn make_repo() -> ClaimRepository {
		ClaimRepository::new(test_pool().await)
	}

	#[tokio::test]
	async fn insert_and_get() {
		let repo = make_repo().await;
		repo
			.insert("tok123", "PUBKEY", "laptop", "192.0.2.1")
			.await
			.unwrap();

		let row = repo.get("tok123").await.unwrap().unwrap();
		assert_eq!(row.1, "PUBKEY");
		assert_eq!(row.2, "laptop");
		assert_eq!(row.3, "192.0.2.1");
		assert_eq!(row.4, "pending");
		assert_eq!(row.5, None);
	}

	#[tokio::test]
	async fn approve_transitions_exactly_once() {
		let repo = make_repo().await;
		repo.insert("tok", "PK", "host", "ip").await.unwrap();

		let user = Uuid::new_v4();
		assert_eq!(repo.approve("tok", user).await.unwrap(), 1);
		assert_eq!(repo.approve("tok", Uuid::new_v4()).await.unwrap(), 0);

		let row = repo.get("tok").await.unwrap().unwrap();
		assert_eq!(row.4, "approved");
		assert_eq!(row.5, Some(user.to_string()));
	}

	#[tokio::test]
	async fn concurrent_approvals_serialize() {
		let repo = make_repo().await;
		repo.insert("tok", "PK", "host", "ip").await.unwrap();

		let a = repo.clone();
		let b = repo.clone();
		let (ra, rb) = tokio::join!(
			a.approve("tok", Uuid::new_v4()),
			b.approve("tok", Uuid::new_v4())
		);

		let wins = ra.unwrap() + rb.unwrap();
		assert_eq!(wins, 1, "exactly one approval must win");
	}

	#[tokio::test]
	async fn reject_is_terminal_too() {
		let repo = make_repo().await;
		repo.insert("tok", "PK", "host", "ip").await.unwrap();

		assert_eq!(repo.reject("tok").await.unwrap(), 1);
		assert_eq!(repo.approve("tok", Uuid::new_v4()).await.unwrap(), 0);
		assert_eq!(repo.get("tok").await.unwrap().unwrap().4, "rejected");
	}

	#[tokio::test]
	async fn approve_unknown_token_touches_nothing() {
		let repo = make_repo().await;
		assert_eq!(repo.approve("missing", Uuid::new_v4()).await.unwrap(), 0);
	}

	#[tokio::test]
	async fn expired_claims_are_deleted() {
		let repo = make_repo().await;
		repo.insert("old", "PK", "host", "ip").await.unwrap();
		repo.insert("new", "PK", "host", "ip").await.unwrap();

		sqlx::query(
			"UPDATE device_claims SET created_at = datetime('now', '-3600 seconds') WHERE token = 'old'",
		)
		.execute(&repo.pool)
		.await
		.unwrap();

		assert_eq!(repo.delete_expired(900).await.unwrap(), 1);
		assert!(repo.get("old").await.unwrap().is_none());
		assert!(repo.get("new").await.unwrap().is_some());
	}
}
