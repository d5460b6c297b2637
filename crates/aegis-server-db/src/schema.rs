// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::Result;
use sqlx::SqlitePool;
use tracing::instrument;

/// Apply the schema. Every statement is idempotent, so startup can run
/// this unconditionally.
#[instrument(skip(pool))]
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
	sqlx::query(
		r#"
		CREATE TABLE IF NOT EXISTS users (
			id TEXT PRIMARY KEY,
			email TEXT NOT NULL UNIQUE,
			provider TEXT NOT NULL DEFAULT 'mock',
			role TEXT NOT NULL DEFAULT 'user',
			created_at TEXT NOT NULL
		)
		"#,
	)
	.execute(pool)
	.await?;

	sqlx::query(
		r#"
		CREATE TABLE IF NOT EXISTS agents (
			id TEXT PRIMARY KEY,
			name TEXT NOT NULL,
			api_key TEXT NOT NULL UNIQUE,
			public_key TEXT NOT NULL DEFAULT '',
			ip TEXT,
			status TEXT NOT NULL DEFAULT 'offline',
			last_seen TEXT,
			user_id TEXT,
			routes TEXT NOT NULL DEFAULT '[]',
			created_at TEXT NOT NULL,
			deleted_at TEXT
		)
		"#,
	)
	.execute(pool)
	.await?;

	sqlx::query(
		r#"
		CREATE TABLE IF NOT EXISTS device_claims (
			token TEXT PRIMARY KEY,
			public_key TEXT NOT NULL,
			hostname TEXT NOT NULL,
			remote_ip TEXT NOT NULL,
			status TEXT NOT NULL DEFAULT 'pending',
			user_id TEXT,
			created_at TEXT NOT NULL
		)
		"#,
	)
	.execute(pool)
	.await?;

	sqlx::query(
		r#"
		CREATE TABLE IF NOT EXISTS heartbeats (
			id INTEGER PRIMARY KEY AUTOINCREMENT,
			agent_id TEXT NOT NULL,
			latency_ms INTEGER NOT NULL,
			bytes_sent INTEGER NOT NULL,
			bytes_received INTEGER NOT NULL,
			active_connections INTEGER NOT NULL,
			cpu_usage REAL NOT NULL,
			memory_usage REAL NOT NULL,
			created_at TEXT NOT NULL
		)
		"#,
	)
	.execute(pool)
	.await?;

	sqlx::query("CREATE INDEX IF NOT EXISTS idx_heartbeats_agent ON heartbeats (agent_id, created_at)")
		.execute(pool)
		.await?;

	sqlx::query(
		r#"
		CREATE TABLE IF NOT EXISTS device_postures (
			agent_id TEXT PRIMARY KEY,
			os_name TEXT NOT NULL,
			os_version TEXT NOT NULL,
			hostname TEXT NOT NULL,
			antivirus_enabled INTEGER,
			antivirus_name TEXT,
			firewall_enabled INTEGER,
			disk_encrypted INTEGER,
			screen_lock_enabled INTEGER,
			score INTEGER NOT NULL,
			last_checked TEXT
		)
		"#,
	)
	.execute(pool)
	.await?;

	Ok(())
}
