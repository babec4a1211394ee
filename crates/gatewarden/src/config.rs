//! Control-plane configuration, loaded from a YAML file.

use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::KeyAlgorithm;

fn default_listen() -> SocketAddr {
	"0.0.0.0:8080".parse().expect("valid default listen addr")
}

fn default_organization() -> String {
	"Gatewarden".to_string()
}

fn default_root_validity_days() -> u32 {
	3650
}

fn default_sub_validity_days() -> u32 {
	1825
}

fn default_server_validity_days() -> u32 {
	825
}

fn default_client_cert_hours() -> u32 {
	24
}

fn default_offline_after_secs() -> u64 {
	90
}

fn default_gc_retention_hours() -> u32 {
	24
}

fn default_audit_retention_days() -> u32 {
	90
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaSettings {
	#[serde(default = "default_organization")]
	pub organization: String,
	#[serde(default = "default_root_validity_days")]
	pub root_validity_days: u32,
	#[serde(default = "default_sub_validity_days")]
	pub sub_validity_days: u32,
	#[serde(default = "default_server_validity_days")]
	pub server_validity_days: u32,
	#[serde(default)]
	pub key_algorithm: KeyAlgorithm,
}

impl Default for CaSettings {
	fn default() -> Self {
		CaSettings {
			organization: default_organization(),
			root_validity_days: default_root_validity_days(),
			sub_validity_days: default_sub_validity_days(),
			server_validity_days: default_server_validity_days(),
			key_algorithm: KeyAlgorithm::default(),
		}
	}
}

impl CaSettings {
	pub fn root_validity(&self) -> chrono::Duration {
		chrono::Duration::days(self.root_validity_days as i64)
	}

	pub fn sub_validity(&self) -> chrono::Duration {
		chrono::Duration::days(self.sub_validity_days as i64)
	}

	pub fn server_validity(&self) -> chrono::Duration {
		chrono::Duration::days(self.server_validity_days as i64)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
	#[serde(default = "default_listen")]
	pub listen: SocketAddr,
	#[serde(default)]
	pub ca: CaSettings,
	/// Validity of issued client certs and their configs.
	#[serde(default = "default_client_cert_hours")]
	pub client_cert_hours: u32,
	/// A tenant or spoke missing heartbeats for this long is flipped
	/// offline/disconnected by the janitor.
	#[serde(default = "default_offline_after_secs")]
	pub offline_after_secs: u64,
	/// Expired configs are kept this long before the hourly GC deletes them.
	#[serde(default = "default_gc_retention_hours")]
	pub gc_retention_hours: u32,
	#[serde(default = "default_audit_retention_days")]
	pub audit_retention_days: u32,
}

impl Default for Settings {
	fn default() -> Self {
		Settings {
			listen: default_listen(),
			ca: CaSettings::default(),
			client_cert_hours: default_client_cert_hours(),
			offline_after_secs: default_offline_after_secs(),
			gc_retention_hours: default_gc_retention_hours(),
			audit_retention_days: default_audit_retention_days(),
		}
	}
}

impl Settings {
	pub fn from_file(path: &Path) -> anyhow::Result<Self> {
		let raw = std::fs::read_to_string(path)?;
		Ok(serde_yaml::from_str(&raw)?)
	}

	pub fn client_cert_validity(&self) -> chrono::Duration {
		chrono::Duration::hours(self.client_cert_hours as i64)
	}

	pub fn offline_cutoff(&self) -> chrono::Duration {
		chrono::Duration::seconds(self.offline_after_secs as i64)
	}
}
