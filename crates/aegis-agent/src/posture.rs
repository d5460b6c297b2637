// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Device posture collection hook.
//!
//! Every security signal is tri-state: confirmed on, confirmed off, or
//! unknown when the probing tool is missing. Unknown never counts as
//! disabled, and only confirmed-on signals score points.

use serde::Serialize;
use tokio::process::Command;

#[derive(Debug, Clone, Serialize, Default)]
pub struct PostureSnapshot {
	pub os_name: String,
	pub os_version: String,
	pub hostname: String,
	pub antivirus_enabled: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub antivirus_name: Option<String>,
	pub firewall_enabled: Option<bool>,
	pub disk_encrypted: Option<bool>,
	pub screen_lock_enabled: Option<bool>,
	pub posture_score: i64,
}

pub async fn collect() -> PostureSnapshot {
	let mut posture = PostureSnapshot {
		os_name: std::env::consts::OS.to_string(),
		os_version: os_version().await,
		hostname: hostname::get()
			.ok()
			.and_then(|h| h.into_string().ok())
			.unwrap_or_else(|| "unknown".to_string()),
		..Default::default()
	};

	#[cfg(target_os = "linux")]
	{
		posture.firewall_enabled = check_linux_firewall().await;
	}

	#[cfg(target_os = "macos")]
	{
		posture.firewall_enabled = check_macos_firewall().await;
		posture.disk_encrypted = check_macos_filevault().await;
		if std::path::Path::new("/Library/Apple/System/Library/CoreServices/XProtect.bundle")
			.exists()
		{
			posture.antivirus_enabled = Some(true);
			posture.antivirus_name = Some("XProtect".to_string());
		}
	}

	posture.posture_score = score(&posture);
	posture
}

/// 0-100: 20 for a validated connection, 25 firewall, 25 disk
/// encryption, 20 antivirus, 10 screen lock. Unknown signals earn
/// nothing.
pub fn score(posture: &PostureSnapshot) -> i64 {
	let mut score = 20;

	if posture.firewall_enabled == Some(true) {
		score += 25;
	}
	if posture.disk_encrypted == Some(true) {
		score += 25;
	}
	if posture.antivirus_enabled == Some(true) {
		score += 20;
	}
	if posture.screen_lock_enabled == Some(true) {
		score += 10;
	}

	score
}

async fn os_version() -> String {
	let probe = match std::env::consts::OS {
		"linux" => Some(("uname", vec!["-r"])),
		"macos" => Some(("sw_vers", vec!["-productVersion"])),
		_ => None,
	};

	if let Some((program, args)) = probe {
		if let Ok(output) = Command::new(program).args(&args).output().await {
			if output.status.success() {
				return String::from_utf8_lossy(&output.stdout).trim().to_string();
			}
		}
	}

	std::env::consts::ARCH.to_string()
}

/// Runs a command and maps "couldn't even run it" to `None` so a
/// missing tool reads as unknown rather than disabled.
#[cfg(any(target_os = "linux", target_os = "macos"))]
async fn command_stdout(program: &str, args: &[&str]) -> Option<String> {
	let output = Command::new(program).args(args).output().await.ok()?;
	if !output.status.success() {
		return None;
	}
	Some(String::from_utf8_lossy(&output.stdout).to_string())
}

#[cfg(target_os = "linux")]
async fn check_linux_firewall() -> Option<bool> {
	if let Some(out) = command_stdout("ufw", &["status"]).await {
		return Some(out.contains("active"));
	}

	// iptables with a populated ruleset is the weaker fallback signal.
	if let Some(out) = command_stdout("iptables", &["-L", "-n"]).await {
		return Some(out.len() > 100);
	}

	None
}

#[cfg(target_os = "macos")]
async fn check_macos_firewall() -> Option<bool> {
	command_stdout(
		"/usr/libexec/ApplicationFirewall/socketfilterfw",
		&["--getglobalstate"],
	)
	.await
	.map(|out| out.contains("enabled"))
}

#[cfg(target_os = "macos")]
async fn check_macos_filevault() -> Option<bool> {
	command_stdout("fdesetup", &["status"])
		.await
		.map(|out| out.contains("FileVault is On"))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unknown_signals_score_only_the_base() {
		let posture = PostureSnapshot::default();
		assert_eq!(score(&posture), 20);
	}

	#[test]
	fn confirmed_off_scores_the_same_as_unknown() {
		let posture = PostureSnapshot {
			firewall_enabled: Some(false),
			disk_encrypted: Some(false),
			..Default::default()
		};
		assert_eq!(score(&posture), 20);
	}

	#[test]
	fn full_marks_at_one_hundred() {
		let posture = PostureSnapshot {
			firewall_enabled: Some(true),
			disk_encrypted: Some(true),
			antivirus_enabled: Some(true),
			screen_lock_enabled: Some(true),
			..Default::default()
		};
		assert_eq!(score(&posture), 100);
	}

	#[test]
	fn partial_signals_add_up() {
		let posture = PostureSnapshot {
			firewall_enabled: Some(true),
			antivirus_enabled: Some(true),
			..Default::default()
		};
		assert_eq!(score(&posture), 65);
	}

	#[tokio::test]
	async fn collect_fills_identity_fields() {
		let posture = collect().await;
		assert!(!posture.os_name.is_empty());
		assert!(!posture.hostname.is_empty());
		assert!(posture.posture_score >= 20);
	}

	#[test]
	fn snapshot_serializes_unknowns_as_null() {
		let posture = PostureSnapshot {
			firewall_enabled: Some(true),
			..Default::default()
		};
		let json = serde_json::to_value(&posture).unwrap();
		assert_eq!(json["firewall_enabled"], serde_json::json!(true));
		assert!(json["antivirus_enabled"].is_null());
		assert!(json.get("antivirus_name").is_none());
	}
}
