//! Firewall backend abstraction: per-client rule sets keyed by a
//! deterministic connection id, with replace semantics and idempotent
//! install/remove.

use std::net::IpAddr;

use ipnet::IpNet;
use uuid::Uuid;
use warden_core::error::Result;
use warden_core::proto::{PortRange, Protocol};

pub mod nft;
pub mod testing;

/// One concrete allow rule after DNS expansion: a network plus its port and
/// protocol selectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSpec {
	pub network: IpNet,
	pub port: PortRange,
	pub protocol: Protocol,
}

/// Deterministic tag for one client's rule set, derived from the tunnel IP
/// so a crash-restart reclaims the same keys without drift.
pub fn connection_id(tunnel_ip: IpAddr) -> String {
	format!("client-{}", tunnel_ip.to_string().replace(['.', ':'], "-"))
}

/// Maps `(connection_id, user, tunnel_ip, rules)` into packet-filter state.
///
/// Contracts:
/// - `apply_rules` replaces any existing set under the same id, atomically:
///   either the new set is fully installed or the prior state persists.
/// - `remove_rules` is a no-op for unknown ids.
/// - mutations for the same id are serialised by the backend; different ids
///   are independent.
#[async_trait::async_trait]
pub trait FirewallBackend: Send + Sync {
	/// Create the top-level chain and default rules (established/related
	/// accept, default drop). Idempotent.
	async fn initialize(&self) -> Result<()>;
	async fn apply_rules(
		&self,
		connection_id: &str,
		user_id: Uuid,
		tunnel_ip: IpAddr,
		rules: &[RuleSpec],
	) -> Result<()>;
	async fn remove_rules(&self, connection_id: &str) -> Result<()>;
	/// Remove every rule this agent instance installed. Called at shutdown.
	async fn cleanup(&self) -> Result<()>;
}
