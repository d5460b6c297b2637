// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use aegis_server_core::CoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
	#[error(transparent)]
	Core(#[from] CoreError),

	#[error("{0}")]
	BadRequest(String),
}

impl ServerError {
	fn status(&self) -> StatusCode {
		match self {
			Self::BadRequest(_) => StatusCode::BAD_REQUEST,
			Self::Core(core) => match core {
				CoreError::InvalidCredential => StatusCode::UNAUTHORIZED,
				CoreError::AgentNotFound | CoreError::ClaimNotFound => StatusCode::NOT_FOUND,
				CoreError::ClaimAlreadyProcessed => StatusCode::NOT_FOUND,
				CoreError::InvalidPublicKey(_) | CoreError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
				CoreError::OverlayUnavailable | CoreError::PoolExhausted => {
					StatusCode::SERVICE_UNAVAILABLE
				}
				CoreError::OverlayDial(_) => StatusCode::BAD_GATEWAY,
				CoreError::Db(_) | CoreError::Engine(_) | CoreError::Internal(_) => {
					StatusCode::INTERNAL_SERVER_ERROR
				}
			},
		}
	}
}

impl IntoResponse for ServerError {
	fn into_response(self) -> Response {
		let status = self.status();

		if status.is_server_error() {
			tracing::error!(error = %self, "request failed");
		} else {
			tracing::debug!(error = %self, "request rejected");
		}

		(status, Json(json!({ "error": self.to_string() }))).into_response()
	}
}

pub type Result<T> = std::result::Result<T, ServerError>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn core_errors_map_to_client_statuses() {
		assert_eq!(
			ServerError::from(CoreError::InvalidCredential).status(),
			StatusCode::UNAUTHORIZED
		);
		assert_eq!(
			ServerError::from(CoreError::ClaimNotFound).status(),
			StatusCode::NOT_FOUND
		);
		assert_eq!(
			ServerError::from(CoreError::OverlayUnavailable).status(),
			StatusCode::SERVICE_UNAVAILABLE
		);
		assert_eq!(
			ServerError::from(CoreError::OverlayDial("x".into())).status(),
			StatusCode::BAD_GATEWAY
		);
		assert_eq!(
			ServerError::BadRequest("x".into()).status(),
			StatusCode::BAD_REQUEST
		);
	}
}
