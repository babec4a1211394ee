//! nftables backend. Each client gets its own chain, dispatched from the
//! base forward chain through a verdict map keyed by tunnel address; every
//! mutation is a single `nft -f` batch, which nftables applies atomically.

use std::collections::HashMap;
use std::net::IpAddr;
use std::process::Stdio;
use std::sync::Arc;

use ipnet::IpNet;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;
use warden_core::error::{Error, Result};
use warden_core::proto::{PortRange, Protocol};

use super::{FirewallBackend, RuleSpec};

const TABLE: &str = "gatewarden";
const DISPATCH_MAP: &str = "client_dispatch";

pub struct NftBackend {
	nft_bin: String,
	/// Tunnel address per installed connection id; rebuilt from scratch on
	/// every start because `initialize` recreates the table.
	installed: Mutex<HashMap<String, IpAddr>>,
	/// Serialises mutations per connection id.
	locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl NftBackend {
	pub fn new() -> Self {
		NftBackend {
			nft_bin: "nft".to_string(),
			installed: Mutex::new(HashMap::new()),
			locks: Mutex::new(HashMap::new()),
		}
	}

	fn lock_for(&self, connection_id: &str) -> Arc<tokio::sync::Mutex<()>> {
		self.locks
			.lock()
			.entry(connection_id.to_string())
			.or_default()
			.clone()
	}

	async fn run_batch(&self, batch: &str) -> Result<()> {
		debug!(batch, "nft batch");
		let mut child = Command::new(&self.nft_bin)
			.args(["-f", "-"])
			.stdin(Stdio::piped())
			.stdout(Stdio::null())
			.stderr(Stdio::piped())
			.spawn()
			.map_err(|e| Error::unavailable(format!("spawn nft: {e}")))?;
		child
			.stdin
			.take()
			.expect("stdin was piped")
			.write_all(batch.as_bytes())
			.await
			.map_err(|e| Error::unavailable(format!("write nft batch: {e}")))?;
		let output = child
			.wait_with_output()
			.await
			.map_err(|e| Error::unavailable(format!("wait for nft: {e}")))?;
		if !output.status.success() {
			let stderr = String::from_utf8_lossy(&output.stderr);
			return Err(Error::unavailable(format!(
				"nft exited {}: {}",
				output.status,
				stderr.trim()
			)));
		}
		Ok(())
	}
}

impl Default for NftBackend {
	fn default() -> Self {
		Self::new()
	}
}

fn render_rule(chain: &str, spec: &RuleSpec) -> Vec<String> {
	let daddr = match spec.network {
		IpNet::V4(net) => format!("ip daddr {net}"),
		IpNet::V6(net) => format!("ip6 daddr {net}"),
	};
	let port = match spec.port {
		PortRange::Any => None,
		PortRange::Single(p) => Some(p.to_string()),
		PortRange::Range(lo, hi) => Some(format!("{lo}-{hi}")),
	};
	let prefix = format!("add rule inet {TABLE} {chain} {daddr}");
	match (spec.protocol, port) {
		(Protocol::Any, None) => vec![format!("{prefix} accept")],
		// A bare port constrains both TCP and UDP.
		(Protocol::Any, Some(p)) => vec![
			format!("{prefix} tcp dport {p} accept"),
			format!("{prefix} udp dport {p} accept"),
		],
		(Protocol::Tcp, None) => vec![format!("{prefix} meta l4proto tcp accept")],
		(Protocol::Tcp, Some(p)) => vec![format!("{prefix} tcp dport {p} accept")],
		(Protocol::Udp, None) => vec![format!("{prefix} meta l4proto udp accept")],
		(Protocol::Udp, Some(p)) => vec![format!("{prefix} udp dport {p} accept")],
		// Ports are meaningless for icmp.
		(Protocol::Icmp, _) => vec![format!("{prefix} meta l4proto icmp accept")],
	}
}

#[async_trait::async_trait]
impl FirewallBackend for NftBackend {
	async fn initialize(&self) -> Result<()> {
		// Recreate the table wholesale: a crash-restart starts from a clean
		// slate and repairs per-client state from the drop directory.
		let batch = format!(
			"destroy table inet {TABLE}\n\
			 add table inet {TABLE}\n\
			 add map inet {TABLE} {DISPATCH_MAP} {{ type ipv4_addr : verdict ; }}\n\
			 add chain inet {TABLE} forward {{ type filter hook forward priority 0 ; policy drop ; }}\n\
			 add rule inet {TABLE} forward ct state established,related accept\n\
			 add rule inet {TABLE} forward ip saddr vmap @{DISPATCH_MAP}\n"
		);
		self.run_batch(&batch).await?;
		self.installed.lock().clear();
		Ok(())
	}

	async fn apply_rules(
		&self,
		connection_id: &str,
		_user_id: Uuid,
		tunnel_ip: IpAddr,
		rules: &[RuleSpec],
	) -> Result<()> {
		if !tunnel_ip.is_ipv4() {
			return Err(Error::invalid(format!(
				"tunnel address {tunnel_ip} is not in the v4 vpn subnet"
			)));
		}
		let lock = self.lock_for(connection_id);
		let _guard = lock.lock().await;

		let mut batch = String::new();
		batch.push_str(&format!("add chain inet {TABLE} {connection_id}\n"));
		batch.push_str(&format!("flush chain inet {TABLE} {connection_id}\n"));
		for spec in rules {
			for line in render_rule(connection_id, spec) {
				batch.push_str(&line);
				batch.push('\n');
			}
		}
		batch.push_str(&format!(
			"destroy element inet {TABLE} {DISPATCH_MAP} {{ {tunnel_ip} }}\n\
			 add element inet {TABLE} {DISPATCH_MAP} {{ {tunnel_ip} : jump {connection_id} }}\n"
		));
		self.run_batch(&batch).await?;
		self
			.installed
			.lock()
			.insert(connection_id.to_string(), tunnel_ip);
		Ok(())
	}

	async fn remove_rules(&self, connection_id: &str) -> Result<()> {
		let lock = self.lock_for(connection_id);
		let _guard = lock.lock().await;

		let Some(tunnel_ip) = self.installed.lock().get(connection_id).copied() else {
			return Ok(());
		};
		let batch = format!(
			"destroy element inet {TABLE} {DISPATCH_MAP} {{ {tunnel_ip} }}\n\
			 destroy chain inet {TABLE} {connection_id}\n"
		);
		self.run_batch(&batch).await?;
		self.installed.lock().remove(connection_id);
		Ok(())
	}

	async fn cleanup(&self) -> Result<()> {
		if let Err(e) = self.run_batch(&format!("destroy table inet {TABLE}\n")).await {
			warn!("firewall cleanup failed: {e}");
			return Err(e);
		}
		self.installed.lock().clear();
		Ok(())
	}
}
