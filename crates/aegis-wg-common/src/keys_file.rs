// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::keys::{WgKeyPair, WgPrivateKey};
use std::path::Path;
use thiserror::Error;
use tokio::fs;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum KeyFileError {
	#[error("failed to read key file: {0}")]
	Read(#[from] std::io::Error),

	#[error("invalid key format: {0}")]
	InvalidFormat(#[from] crate::keys::KeyError),
}

pub type Result<T> = std::result::Result<T, KeyFileError>;

#[instrument(skip_all, fields(path = %path.as_ref().display()))]
pub async fn load_key_from_file(path: impl AsRef<Path>) -> Result<WgKeyPair> {
	let content = fs::read_to_string(path.as_ref()).await?;
	let private = WgPrivateKey::from_base64(content.trim())?;
	Ok(WgKeyPair::from_private_key(private))
}

#[instrument(skip(key), fields(path = %path.as_ref().display()))]
pub async fn save_key_to_file(key: &WgKeyPair, path: impl AsRef<Path>) -> Result<()> {
	write_secret(path.as_ref(), &key.private_key().to_base64()).await
}

/// Load an opaque agent credential persisted by a previous claim flow.
#[instrument(skip_all, fields(path = %path.as_ref().display()))]
pub async fn load_credential(path: impl AsRef<Path>) -> Result<Option<String>> {
	match fs::read_to_string(path.as_ref()).await {
		Ok(content) => {
			let trimmed = content.trim();
			if trimmed.is_empty() {
				Ok(None)
			} else {
				Ok(Some(trimmed.to_string()))
			}
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(e.into()),
	}
}

#[instrument(skip(credential), fields(path = %path.as_ref().display()))]
pub async fn save_credential(credential: &str, path: impl AsRef<Path>) -> Result<()> {
	write_secret(path.as_ref(), credential).await
}

async fn write_secret(path: &Path, value: &str) -> Result<()> {
	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent).await?;
	}

	let content = format!("{}\n", value);

	#[cfg(unix)]
	{
		use tokio::fs::OpenOptions;
		use tokio::io::AsyncWriteExt;

		let mut file = OpenOptions::new()
			.write(true)
			.create(true)
			.truncate(true)
			.mode(0o600)
			.open(path)
			.await?;
		file.write_all(content.as_bytes()).await?;
	}

	#[cfg(not(unix))]
	{
		fs::write(path, content).await?;
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[tokio::test]
	async fn save_and_load_key() {
		let temp_dir = TempDir::new().unwrap();
		let key_path = temp_dir.path().join("wg-key");

		let keypair = WgKeyPair::generate();
		save_key_to_file(&keypair, &key_path).await.unwrap();

		let loaded = load_key_from_file(&key_path).await.unwrap();
		assert_eq!(keypair.public_key(), loaded.public_key());
	}

	#[tokio::test]
	#[cfg(unix)]
	async fn saved_secrets_are_owner_only() {
		use std::os::unix::fs::PermissionsExt;

		let temp_dir = TempDir::new().unwrap();
		let path = temp_dir.path().join("credential");

		save_credential("sk_live_test", &path).await.unwrap();

		let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
		assert_eq!(mode, 0o600);
	}

	#[tokio::test]
	async fn credential_roundtrip() {
		let temp_dir = TempDir::new().unwrap();
		let path = temp_dir.path().join("nested").join("credential");

		assert_eq!(load_credential(&path).await.unwrap(), None);

		save_credential("sk_live_abc123", &path).await.unwrap();
		assert_eq!(
			load_credential(&path).await.unwrap(),
			Some("sk_live_abc123".to_string())
		);
	}

	#[tokio::test]
	async fn empty_credential_file_reads_as_none() {
		let temp_dir = TempDir::new().unwrap();
		let path = temp_dir.path().join("credential");
		fs::write(&path, "\n").await.unwrap();

		assert_eq!(load_credential(&path).await.unwrap(), None);
	}
}
