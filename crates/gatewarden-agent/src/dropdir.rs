//! The connected-client drop directory: the message channel between the
//! VPN's short-lived exec-hooks and the long-running agent. One JSON file
//! per tunnel IP; the agent reconciles the directory every refresh tick.

use std::collections::HashMap;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use tracing::warn;
use warden_core::error::{Error, Result};
use warden_core::proto::ConnectedClient;

fn dashed(ip: IpAddr) -> String {
	ip.to_string().replace(['.', ':'], "-")
}

pub fn client_file(dir: &Path, ip: IpAddr) -> PathBuf {
	dir.join(format!("{}.json", dashed(ip)))
}

/// Atomically publish a connected client: temp file in the same directory,
/// then rename over the target.
pub fn write_client(dir: &Path, client: &ConnectedClient) -> Result<()> {
	fs_err::create_dir_all(dir).map_err(|e| Error::internal(format!("create drop dir: {e}")))?;
	let path = client_file(dir, client.vpn_ip);
	let mut tmp = tempfile::NamedTempFile::new_in(dir)
		.map_err(|e| Error::internal(format!("temp file in drop dir: {e}")))?;
	serde_json::to_writer_pretty(&mut tmp, client)
		.map_err(|e| Error::internal(format!("encode client record: {e}")))?;
	tmp
		.write_all(b"\n")
		.and_then(|_| tmp.flush())
		.map_err(|e| Error::internal(format!("flush client record: {e}")))?;
	#[cfg(unix)]
	{
		use std::os::unix::fs::PermissionsExt;
		let _ = std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o644));
	}
	tmp
		.persist(&path)
		.map_err(|e| Error::internal(format!("persist client record: {e}")))?;
	Ok(())
}

/// Remove a client record; absent files are fine (hooks can race the
/// reconciler).
pub fn remove_client(dir: &Path, ip: IpAddr) -> Result<()> {
	match std::fs::remove_file(client_file(dir, ip)) {
		Ok(()) => Ok(()),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
		Err(e) => Err(Error::internal(format!("remove client record: {e}"))),
	}
}

/// Current contents of the drop directory. Records that fail to parse are
/// skipped with a warning; a malformed file must never turn into a
/// fabricated identity.
pub fn scan(dir: &Path) -> Result<HashMap<IpAddr, ConnectedClient>> {
	let mut out = HashMap::new();
	let entries = match fs_err::read_dir(dir) {
		Ok(entries) => entries,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
		Err(e) => return Err(Error::internal(format!("read drop dir: {e}"))),
	};
	for entry in entries {
		let entry = entry.map_err(|e| Error::internal(format!("read drop dir entry: {e}")))?;
		let path = entry.path();
		if path.extension().and_then(|e| e.to_str()) != Some("json") {
			continue;
		}
		let raw = match fs_err::read_to_string(&path) {
			Ok(raw) => raw,
			Err(e) => {
				warn!(path = %path.display(), "unreadable client record, skipping: {e}");
				continue;
			},
		};
		match serde_json::from_str::<ConnectedClient>(&raw) {
			Ok(client) => {
				out.insert(client.vpn_ip, client);
			},
			Err(e) => {
				warn!(path = %path.display(), "malformed client record, skipping: {e}");
			},
		}
	}
	Ok(out)
}

#[cfg(test)]
mod tests {
	use chrono::Utc;
	use uuid::Uuid;

	use super::*;

	fn client(ip: &str) -> ConnectedClient {
		ConnectedClient {
			vpn_ip: ip.parse().unwrap(),
			user_id: Uuid::new_v4(),
			user_email: "u@x.test".into(),
			groups: vec!["eng".into()],
			connected_at: Utc::now(),
		}
	}

	#[test]
	fn write_scan_remove_round_trip() {
		let dir = tempfile::tempdir().unwrap();
		let c = client("10.8.0.42");
		write_client(dir.path(), &c).unwrap();

		assert!(dir.path().join("10-8-0-42.json").exists());
		let scanned = scan(dir.path()).unwrap();
		assert_eq!(scanned.len(), 1);
		assert_eq!(scanned[&c.vpn_ip], c);

		remove_client(dir.path(), c.vpn_ip).unwrap();
		assert!(scan(dir.path()).unwrap().is_empty());
		// Removing again is a no-op.
		remove_client(dir.path(), c.vpn_ip).unwrap();
	}

	#[test]
	fn malformed_records_are_skipped_not_invented() {
		let dir = tempfile::tempdir().unwrap();
		write_client(dir.path(), &client("10.8.0.42")).unwrap();
		std::fs::write(dir.path().join("10-8-0-43.json"), "{\"user_id\": \"nope\"}").unwrap();
		std::fs::write(dir.path().join("notes.txt"), "ignore me").unwrap();

		let scanned = scan(dir.path()).unwrap();
		assert_eq!(scanned.len(), 1, "only the valid record survives");
	}

	#[test]
	fn missing_directory_scans_empty() {
		let dir = tempfile::tempdir().unwrap();
		let missing = dir.path().join("nope");
		assert!(scan(&missing).unwrap().is_empty());
	}

	#[test]
	fn rewrite_replaces_in_place() {
		let dir = tempfile::tempdir().unwrap();
		let mut c = client("10.8.0.42");
		write_client(dir.path(), &c).unwrap();
		c.groups = vec!["ops".into()];
		write_client(dir.path(), &c).unwrap();

		let scanned = scan(dir.path()).unwrap();
		assert_eq!(scanned[&c.vpn_ip].groups, vec!["ops".to_string()]);
	}
}
