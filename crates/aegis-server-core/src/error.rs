// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
	#[error("database error: {0}")]
	Db(#[from] aegis_server_db::DbError),

	#[error("gateway error: {0}")]
	Engine(#[from] aegis_wg_engine::EngineError),

	#[error("invalid credential")]
	InvalidCredential,

	#[error("invalid public key: {0}")]
	InvalidPublicKey(#[from] aegis_wg_common::KeyError),

	#[error("agent not found")]
	AgentNotFound,

	#[error("claim not found")]
	ClaimNotFound,

	#[error("claim invalid or already processed")]
	ClaimAlreadyProcessed,

	#[error("overlay address pool exhausted")]
	PoolExhausted,

	#[error("overlay network not initialized")]
	OverlayUnavailable,

	#[error("overlay dial failed: {0}")]
	OverlayDial(String),

	#[error("invalid request: {0}")]
	InvalidRequest(String),

	#[error("internal: {0}")]
	Internal(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
