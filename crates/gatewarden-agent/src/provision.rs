//! Applying a provisioned bundle: atomic cert swaps with fsync-on-dir
//! semantics, a VPN restart through the init system, and the persistent
//! config-version marker that makes recovery idempotent.

use std::path::Path;

use tokio::process::Command;
use tracing::{info, warn};
use warden_core::error::{Error, Result};
use warden_core::proto::ProvisionResponse;

use crate::config::AgentConfig;

pub const CA_FILE: &str = "ca.crt";
pub const SERVER_CERT_FILE: &str = "server.crt";
pub const SERVER_KEY_FILE: &str = "server.key";
pub const TLS_AUTH_FILE: &str = "ta.key";

/// The last applied fingerprint, empty when this gateway has never been
/// provisioned. Read once at startup so a restart does not re-provision
/// spuriously.
pub fn read_version(cfg: &AgentConfig) -> String {
	match fs_err::read_to_string(cfg.version_file()) {
		Ok(raw) => raw.trim().to_string(),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
		Err(e) => {
			warn!("unreadable config-version marker, assuming unprovisioned: {e}");
			String::new()
		},
	}
}

fn write_atomic(dir: &Path, name: &str, contents: &str, mode: u32) -> Result<()> {
	use std::io::Write;
	let mut tmp = tempfile::NamedTempFile::new_in(dir)
		.map_err(|e| Error::internal(format!("temp file for {name}: {e}")))?;
	tmp
		.write_all(contents.as_bytes())
		.and_then(|_| tmp.as_file().sync_all())
		.map_err(|e| Error::internal(format!("write {name}: {e}")))?;
	#[cfg(unix)]
	{
		use std::os::unix::fs::PermissionsExt;
		std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(mode))
			.map_err(|e| Error::internal(format!("chmod {name}: {e}")))?;
	}
	#[cfg(not(unix))]
	let _ = mode;
	tmp
		.persist(dir.join(name))
		.map_err(|e| Error::internal(format!("persist {name}: {e}")))?;
	Ok(())
}

fn fsync_dir(dir: &Path) -> Result<()> {
	#[cfg(unix)]
	{
		let handle =
			fs_err::File::open(dir).map_err(|e| Error::internal(format!("open dir: {e}")))?;
		handle
			.sync_all()
			.map_err(|e| Error::internal(format!("fsync dir: {e}")))?;
	}
	#[cfg(not(unix))]
	let _ = dir;
	Ok(())
}

/// Swap the bundle into place, restart the VPN daemon, then record the new
/// version. A failed restart is fatal to the attempt: the marker keeps the
/// old version so the next heartbeat retries the whole sequence.
pub async fn apply(cfg: &AgentConfig, bundle: &ProvisionResponse) -> Result<()> {
	let dir = cfg.etc_dir.as_path();
	fs_err::create_dir_all(dir).map_err(|e| Error::internal(format!("create etc dir: {e}")))?;

	write_atomic(dir, CA_FILE, &bundle.full_ca_chain, 0o644)?;
	write_atomic(dir, SERVER_CERT_FILE, &bundle.server_cert, 0o644)?;
	write_atomic(dir, SERVER_KEY_FILE, &bundle.server_key, 0o600)?;
	match (&bundle.tls_auth_key, bundle.tls_auth_enabled) {
		(Some(key), true) => write_atomic(dir, TLS_AUTH_FILE, key, 0o600)?,
		_ => match std::fs::remove_file(dir.join(TLS_AUTH_FILE)) {
			Ok(()) => {},
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
			Err(e) => return Err(Error::internal(format!("remove stale ta.key: {e}"))),
		},
	}
	fsync_dir(dir)?;

	restart_vpn(cfg).await?;

	write_atomic(dir, ".config_version", &bundle.config_version, 0o644)?;
	fsync_dir(dir)?;
	info!(version = %bundle.config_version, "applied provisioned bundle");
	Ok(())
}

async fn restart_vpn(cfg: &AgentConfig) -> Result<()> {
	let Some((program, args)) = cfg.vpn_restart_command.split_first() else {
		// Explicitly configured empty: nothing manages the daemon here.
		return Ok(());
	};
	let status = Command::new(program)
		.args(args)
		.status()
		.await
		.map_err(|e| Error::unavailable(format!("spawn {program}: {e}")))?;
	if !status.success() {
		return Err(Error::unavailable(format!(
			"vpn restart exited {status}"
		)));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use warden_core::proto::{CryptoProfile, VpnProtocol};

	use super::*;

	fn config(etc_dir: &Path, restart: Vec<String>) -> AgentConfig {
		AgentConfig {
			control_url: "http://127.0.0.1:1".into(),
			token: "tok".into(),
			etc_dir: etc_dir.to_path_buf(),
			drop_dir: etc_dir.join("clients"),
			heartbeat_interval_secs: 30,
			rule_refresh_interval_secs: 10,
			request_timeout_secs: 10,
			vpn_restart_command: restart,
			firewall: crate::config::FirewallKind::Memory,
		}
	}

	fn bundle(version: &str, tls_auth_key: Option<&str>) -> ProvisionResponse {
		ProvisionResponse {
			full_ca_chain: "CHAIN".into(),
			server_cert: "CERT".into(),
			server_key: "KEY".into(),
			tls_auth_enabled: tls_auth_key.is_some(),
			tls_auth_key: tls_auth_key.map(str::to_string),
			vpn_port: 1194,
			vpn_protocol: VpnProtocol::Udp,
			vpn_subnet: "10.8.0.0/24".parse().unwrap(),
			crypto_profile: CryptoProfile::Modern,
			config_version: version.into(),
		}
	}

	#[tokio::test]
	async fn apply_writes_bundle_and_version_marker() {
		let dir = tempfile::tempdir().unwrap();
		let cfg = config(dir.path(), vec!["true".into()]);

		apply(&cfg, &bundle("aabbccdd00112233", Some("STATIC"))).await.unwrap();
		assert_eq!(
			fs_err::read_to_string(dir.path().join(CA_FILE)).unwrap(),
			"CHAIN"
		);
		assert_eq!(
			fs_err::read_to_string(dir.path().join(TLS_AUTH_FILE)).unwrap(),
			"STATIC"
		);
		assert_eq!(read_version(&cfg), "aabbccdd00112233");

		#[cfg(unix)]
		{
			use std::os::unix::fs::PermissionsExt;
			let mode = std::fs::metadata(dir.path().join(SERVER_KEY_FILE))
				.unwrap()
				.permissions()
				.mode();
			assert_eq!(mode & 0o777, 0o600);
		}

		// Disabling tls-auth removes the stale key on the next apply.
		apply(&cfg, &bundle("ffeeddcc00112233", None)).await.unwrap();
		assert!(!dir.path().join(TLS_AUTH_FILE).exists());
		assert_eq!(read_version(&cfg), "ffeeddcc00112233");
	}

	#[tokio::test]
	async fn failed_restart_keeps_the_old_version() {
		let dir = tempfile::tempdir().unwrap();
		let cfg = config(dir.path(), vec!["false".into()]);

		let err = apply(&cfg, &bundle("aabbccdd00112233", None))
			.await
			.unwrap_err();
		assert_eq!(err.kind(), warden_core::Kind::Unavailable);
		// The marker was never written: the next tick replays provisioning.
		assert_eq!(read_version(&cfg), "");
	}

	#[tokio::test]
	async fn missing_marker_reads_as_unprovisioned() {
		let dir = tempfile::tempdir().unwrap();
		let cfg = config(dir.path(), vec![]);
		assert_eq!(read_version(&cfg), "");
	}
}
