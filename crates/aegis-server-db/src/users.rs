// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{DbError, Result};
use sqlx::SqlitePool;
use uuid::Uuid;

pub type UserRowTuple = (
	String, // id
	String, // email
	String, // provider
	String, // role
	String, // created_at
);

#[derive(Clone)]
pub struct UserRepository {
	pool: SqlitePool,
}

impl UserRepository {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	/// Resolve the approving identity. `INSERT OR IGNORE` keeps this
	/// race-free against concurrent approvals by the same email.
	#[tracing::instrument(skip(self), fields(email))]
	pub async fn find_or_create(&self, email: &str, provider: &str, role: &str) -> Result<UserRowTuple> {
		sqlx::query(
			"INSERT OR IGNORE INTO users (id, email, provider, role, created_at)
			 VALUES (?, ?, ?, ?, datetime('now'))",
		)
		.bind(Uuid::new_v4().to_string())
		.bind(email)
		.bind(provider)
		.bind(role)
		.execute(&self.pool)
		.await?;

		let row: Option<UserRowTuple> = sqlx::query_as(
			"SELECT id, email, provider, role, created_at FROM users WHERE email = ?",
		)
		.bind(email)
		.fetch_optional(&self.pool)
		.await?;

		row.ok_or_else(|| DbError::Internal(format!("user vanished after upsert: {email}")))
	}

	#[tracing::instrument(skip(self), fields(%id))]
	pub async fn get(&self, id: Uuid) -> Result<Option<UserRowTuple>> {
		let row: Option<UserRowTuple> = sqlx::query_as(
			"SELECT id, email, provider, role, created_at FROM users WHERE id = ?",
		)
		.bind(id.to_string())
		.fetch_optional(&self.pool)
		.await?;

		Ok(row)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_pool;

	#[tokio::test]
	async fn find_or_create_is_stable_for_same_email() {
		let repo = UserRepository::new(test_pool().await);

		let first = repo.find_or_create("a@b", "mock", "user").await.unwrap();
		let second = repo.find_or_create("a@b", "mock", "user").await.unwrap();

		assert_eq!(first.0, second.0);
		assert_eq!(first.1, "a@b");
	}

	#[tokio::test]
	async fn distinct_emails_get_distinct_users() {
		let repo = UserRepository::new(test_pool().await);

		let a = repo.find_or_create("a@b", "mock", "user").await.unwrap();
		let b = repo.find_or_create("c@d", "mock", "user").await.unwrap();

		assert_ne!(a.0, b.0);
	}
}
