// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! SQLite persistence for the control server.
//!
//! Repositories return plain row tuples; the service layer owns the
//! typed models and conversions. State transitions that must be
//! exactly-once (claim approval, liveness reaping) are single
//! conditional UPDATE statements so correctness does not depend on
//! the connection's isolation level.

pub mod agents;
pub mod claims;
pub mod error;
pub mod schema;
pub mod telemetry;
pub mod users;

pub use agents::{AgentRepository, AgentRowTuple};
pub use claims::{ClaimRepository, ClaimRowTuple};
pub use error::{DbError, Result};
pub use schema::apply_schema;
pub use telemetry::{HeartbeatRowTuple, PostureRecord, PostureRowTuple, TelemetryRepository};
pub use users::{UserRepository, UserRowTuple};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

/// Open (and create if missing) the server database.
pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
	let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

	let pool = SqlitePoolOptions::new().connect_with(options).await?;

	Ok(pool)
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
	let options = SqliteConnectOptions::from_str(":memory:")
		.unwrap()
		.create_if_missing(true);

	let pool = SqlitePoolOptions::new()
		.max_connections(1)
		.connect_with(options)
		.await
		.expect("failed to create test pool");

	apply_schema(&pool).await.expect("failed to apply schema");

	pool
}
