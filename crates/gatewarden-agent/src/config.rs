//! Agent configuration, loaded from YAML. `WARDEN_AGENT_CONFIG` overrides
//! the path so the hook subprocesses find the same file as the agent.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const CONFIG_ENV: &str = "WARDEN_AGENT_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/tenant/agent.yaml";

fn default_etc_dir() -> PathBuf {
	PathBuf::from("/etc/tenant")
}

fn default_drop_dir() -> PathBuf {
	PathBuf::from("/var/run/agent/clients")
}

fn default_heartbeat_secs() -> u64 {
	30
}

fn default_rule_refresh_secs() -> u64 {
	10
}

fn default_request_timeout_secs() -> u64 {
	10
}

fn default_vpn_restart_command() -> Vec<String> {
	vec![
		"systemctl".to_string(),
		"restart".to_string(),
		"openvpn-server@tenant".to_string(),
	]
}

fn default_firewall_backend() -> FirewallKind {
	FirewallKind::Nftables
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirewallKind {
	Nftables,
	/// In-memory backend; enforcement is a no-op. For development only.
	Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
	/// Base URL of the control plane, e.g. `https://warden.example.com`.
	pub control_url: String,
	/// Tenant bearer token.
	pub token: String,
	/// Where the provisioned bundle lands (`ca.crt`, `server.crt`, ...).
	#[serde(default = "default_etc_dir")]
	pub etc_dir: PathBuf,
	/// Connected-client drop directory shared with the VPN exec-hooks.
	#[serde(default = "default_drop_dir")]
	pub drop_dir: PathBuf,
	#[serde(default = "default_heartbeat_secs")]
	pub heartbeat_interval_secs: u64,
	#[serde(default = "default_rule_refresh_secs")]
	pub rule_refresh_interval_secs: u64,
	#[serde(default = "default_request_timeout_secs")]
	pub request_timeout_secs: u64,
	/// Invoked after a provisioned bundle is swapped in.
	#[serde(default = "default_vpn_restart_command")]
	pub vpn_restart_command: Vec<String>,
	#[serde(default = "default_firewall_backend")]
	pub firewall: FirewallKind,
}

impl AgentConfig {
	pub fn from_file(path: &Path) -> anyhow::Result<Self> {
		let raw = std::fs::read_to_string(path)?;
		Ok(serde_yaml::from_str(&raw)?)
	}

	pub fn config_path_from_env() -> PathBuf {
		std::env::var(CONFIG_ENV)
			.map(PathBuf::from)
			.unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
	}

	pub fn heartbeat_interval(&self) -> Duration {
		Duration::from_secs(self.heartbeat_interval_secs)
	}

	pub fn rule_refresh_interval(&self) -> Duration {
		Duration::from_secs(self.rule_refresh_interval_secs)
	}

	pub fn request_timeout(&self) -> Duration {
		Duration::from_secs(self.request_timeout_secs)
	}

	/// Persistent marker recording the last applied config fingerprint.
	pub fn version_file(&self) -> PathBuf {
		self.etc_dir.join(".config_version")
	}
}
