// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Device-claim state machine.
//!
//! A claim is a single-use bridge between an agent's public key and a
//! human approver. It is born `pending` and transitions exactly once,
//! to `approved` or `rejected`; both are terminal. The credential
//! handed to the polling agent always belongs to the Agent record tied
//! to the claim's public key, created on first approval if necessary.

use crate::error::{CoreError, Result};
use crate::models::{ClaimStatus, DeviceClaim};
use aegis_server_db::{AgentRepository, ClaimRepository, UserRepository};
use rand::RngCore;
use tokio::sync::watch;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const TOKEN_BYTES: usize = 32;
const CREDENTIAL_BYTES: usize = 32;
const CREDENTIAL_PREFIX: &str = "sk_live_";

#[derive(Debug, Clone)]
pub struct StartedClaim {
	pub token: String,
	pub claim_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimState {
	Pending,
	Approved { api_key: String },
	Rejected,
}

#[derive(Clone)]
pub struct ClaimService {
	claims: ClaimRepository,
	agents: AgentRepository,
	users: UserRepository,
	dashboard_url: String,
}

impl ClaimService {
	pub fn new(
		claims: ClaimRepository,
		agents: AgentRepository,
		users: UserRepository,
		dashboard_url: String,
	) -> Self {
		Self {
			claims,
			agents,
			users,
			dashboard_url,
		}
	}

	/// Agent begins enrollment. The token carries 256 bits of entropy;
	/// the URL directs a human to the dashboard approval page.
	#[instrument(skip(self, public_key), fields(hostname, remote_ip))]
	pub async fn start_claim(
		&self,
		public_key: &str,
		hostname: &str,
		remote_ip: &str,
	) -> Result<StartedClaim> {
		let token = generate_token();

		self
			.claims
			.insert(&token, public_key, hostname, remote_ip)
			.await?;

		let claim_url = format!("{}/claim?token={}", self.dashboard_url, token);

		info!(hostname, "device claim started");

		Ok(StartedClaim { token, claim_url })
	}

	/// Agent polls. On the first approved poll the Agent record for the
	/// claim's public key is created (or its user binding completed) and
	/// its credential returned.
	#[instrument(skip(self, token))]
	pub async fn status(&self, token: &str) -> Result<ClaimState> {
		let claim: DeviceClaim = self
			.claims
			.get(token)
			.await?
			.ok_or(CoreError::ClaimNotFound)?
			.try_into()?;

		match claim.status {
			ClaimStatus::Pending => Ok(ClaimState::Pending),
			ClaimStatus::Rejected => Ok(ClaimState::Rejected),
			ClaimStatus::Approved => {
				let api_key = self.credential_for(&claim).await?;
				Ok(ClaimState::Approved { api_key })
			}
		}
	}

	async fn credential_for(&self, claim: &DeviceClaim) -> Result<String> {
		if let Some(row) = self.agents.get_by_public_key(&claim.public_key).await? {
			let agent: crate::models::Agent = row.try_into()?;
			if agent.user_id.is_none() {
				if let Some(user_id) = claim.user_id {
					self.agents.bind_user(agent.id, user_id).await?;
				}
			}
			return Ok(agent.api_key);
		}

		let api_key = generate_credential();
		self
			.agents
			.insert(
				Uuid::new_v4(),
				&claim.hostname,
				&api_key,
				&claim.public_key,
				claim.user_id,
			)
			.await?;

		info!(hostname = %claim.hostname, "created agent for approved claim");

		Ok(api_key)
	}

	/// Claim info for the dashboard approval page.
	#[instrument(skip(self, token))]
	pub async fn details(&self, token: &str) -> Result<DeviceClaim> {
		self
			.claims
			.get(token)
			.await?
			.ok_or(CoreError::ClaimNotFound)?
			.try_into()
	}

	/// Atomic conditional approval. The second of two concurrent
	/// approvals observes `ClaimAlreadyProcessed`.
	#[instrument(skip(self, token), fields(email))]
	pub async fn approve(&self, token: &str, email: &str) -> Result<String> {
		let user = self.users.find_or_create(email, "mock", "user").await?;
		let user_id: Uuid = user
			.0
			.parse()
			.map_err(|_| CoreError::Internal("invalid user id".to_string()))?;

		let rows = self.claims.approve(token, user_id).await?;
		if rows == 0 {
			return Err(CoreError::ClaimAlreadyProcessed);
		}

		info!("device claim approved");
		Ok(user.1)
	}

	#[instrument(skip(self, token))]
	pub async fn reject(&self, token: &str) -> Result<()> {
		let rows = self.claims.reject(token).await?;
		if rows == 0 {
			return Err(CoreError::ClaimAlreadyProcessed);
		}

		info!("device claim rejected");
		Ok(())
	}

	#[instrument(skip(self))]
	pub async fn sweep_expired(&self, ttl_secs: u64) -> Result<u64> {
		let deleted = self.claims.delete_expired(ttl_secs).await?;
		if deleted > 0 {
			info!(deleted, "garbage-collected expired claims");
		}
		Ok(deleted)
	}

	/// Periodic expiry sweep, one select loop per server process.
	pub fn spawn_sweeper(
		self,
		interval: std::time::Duration,
		ttl_secs: u64,
		mut shutdown_rx: watch::Receiver<bool>,
	) -> tokio::task::JoinHandle<()> {
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

			loop {
				tokio::select! {
					biased;

					_ = shutdown_rx.changed() => {
						if *shutdown_rx.borrow() {
							info!("claim sweeper shutting down");
							break;
						}
					}

					_ = ticker.tick() => {
						if let Err(e) = self.sweep_expired(ttl_secs).await {
							warn!(error = %e, "claim sweep failed");
						}
					}
				}
			}
		})
	}
}

fn generate_token() -> String {
	let mut bytes = [0u8; TOKEN_BYTES];
	rand::rngs::OsRng.fill_bytes(&mut bytes);
	hex::encode(bytes)
}

fn generate_credential() -> String {
	let mut bytes = [0u8; CREDENTIAL_BYTES];
	rand::rngs::OsRng.fill_bytes(&mut bytes);
	format!("{}{}", CREDENTIAL_PREFIX, hex::encode(bytes))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing;
	use aegis_server_db::{AgentRepository, ClaimRepository, UserRepository};

	async fn service() -> ClaimService {
		let pool = testing::pool().await;
		ClaimService::new(
			ClaimRepository::new(pool.clone()),
			AgentRepository::new(pool.clone()),
			UserRepository::new(pool),
			"http://localhost:3001".to_string(),
		)
	}

	#[test]
	fn tokens_are_long_and_unique() {
		let a = generate_token();
		let b = generate_token();
		assert_eq!(a.len(), 64);
		assert_ne!(a, b);
	}

	#[test]
	fn credentials_carry_the_live_prefix() {
		let cred = generate_credential();
		assert!(cred.starts_with("sk_live_"));
		assert_eq!(cred.len(), "sk_live_".len() + 64);
	}

	#[tokio::test]
	async fn happy_path_creates_agent_bound_to_user() {
		let svc = service().await;

		let started = svc.start_claim("PUBKEY_P", "laptop", "192.0.2.9").await.unwrap();
		assert!(started.claim_url.contains(&started.token));

		assert_eq!(svc.status(&started.token).await.unwrap(), ClaimState::Pending);

		let email = svc.approve(&started.token, "a@b").await.unwrap();
		assert_eq!(email, "a@b");

		let state = svc.status(&started.token).await.unwrap();
		let ClaimState::Approved { api_key } = state else {
			panic!("expected approved claim");
		};
		assert!(api_key.starts_with("sk_live_"));

		let agent: crate::models::Agent = svc
			.agents
			.get_by_public_key("PUBKEY_P")
			.await
			.unwrap()
			.unwrap()
			.try_into()
			.unwrap();
		assert_eq!(agent.name, "laptop");
		assert!(agent.user_id.is_some());
	}

	#[tokio::test]
	async fn polling_twice_returns_the_same_credential() {
		let svc = service().await;
		let started = svc.start_claim("PK", "host", "ip").await.unwrap();
		svc.approve(&started.token, "a@b").await.unwrap();

		let first = svc.status(&started.token).await.unwrap();
		let second = svc.status(&started.token).await.unwrap();
		assert_eq!(first, second);
	}

	#[tokio::test]
	async fn existing_agent_keeps_its_credential() {
		let svc = service().await;

		let agent_id = Uuid::new_v4();
		svc
			.agents
			.insert(agent_id, "existing", "sk_live_original", "PK", None)
			.await
			.unwrap();

		let started = svc.start_claim("PK", "host", "ip").await.unwrap();
		svc.approve(&started.token, "a@b").await.unwrap();

		let ClaimState::Approved { api_key } = svc.status(&started.token).await.unwrap() else {
			panic!("expected approved");
		};
		assert_eq!(api_key, "sk_live_original");
	}

	#[tokio::test]
	async fn second_approval_observes_already_processed() {
		let svc = service().await;
		let started = svc.start_claim("PK", "host", "ip").await.unwrap();

		svc.approve(&started.token, "a@b").await.unwrap();
		let err = svc.approve(&started.token, "c@d").await.unwrap_err();
		assert!(matches!(err, CoreError::ClaimAlreadyProcessed));
	}

	#[tokio::test]
	async fn rejected_claims_stay_rejected() {
		let svc = service().await;
		let started = svc.start_claim("PK", "host", "ip").await.unwrap();

		svc.reject(&started.token).await.unwrap();
		assert_eq!(svc.status(&started.token).await.unwrap(), ClaimState::Rejected);

		let err = svc.approve(&started.token, "a@b").await.unwrap_err();
		assert!(matches!(err, CoreError::ClaimAlreadyProcessed));
	}

	#[tokio::test]
	async fn unknown_token_is_not_found() {
		let svc = service().await;
		assert!(matches!(
			svc.status("missing").await.unwrap_err(),
			CoreError::ClaimNotFound
		));
	}
}
