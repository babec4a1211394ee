//! In-memory firewall backend: records exactly what a real backend would
//! install, for tests and development.

use std::collections::HashMap;
use std::net::IpAddr;

use parking_lot::Mutex;
use uuid::Uuid;
use warden_core::error::{Error, Result};

use super::{FirewallBackend, RuleSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledSet {
	pub user_id: Uuid,
	pub tunnel_ip: IpAddr,
	pub rules: Vec<RuleSpec>,
}

#[derive(Default)]
struct State {
	initialized: bool,
	sets: HashMap<String, InstalledSet>,
}

#[derive(Default)]
pub struct MemBackend {
	state: Mutex<State>,
}

impl MemBackend {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn installed(&self, connection_id: &str) -> Option<InstalledSet> {
		self.state.lock().sets.get(connection_id).cloned()
	}

	pub fn connection_ids(&self) -> Vec<String> {
		let mut ids: Vec<String> = self.state.lock().sets.keys().cloned().collect();
		ids.sort();
		ids
	}

	pub fn is_empty(&self) -> bool {
		self.state.lock().sets.is_empty()
	}
}

#[async_trait::async_trait]
impl FirewallBackend for MemBackend {
	async fn initialize(&self) -> Result<()> {
		self.state.lock().initialized = true;
		Ok(())
	}

	async fn apply_rules(
		&self,
		connection_id: &str,
		user_id: Uuid,
		tunnel_ip: IpAddr,
		rules: &[RuleSpec],
	) -> Result<()> {
		let mut state = self.state.lock();
		if !state.initialized {
			return Err(Error::unavailable("firewall backend not initialized"));
		}
		// Replace semantics: the previous set for this id vanishes entirely.
		state.sets.insert(
			connection_id.to_string(),
			InstalledSet {
				user_id,
				tunnel_ip,
				rules: rules.to_vec(),
			},
		);
		Ok(())
	}

	async fn remove_rules(&self, connection_id: &str) -> Result<()> {
		self.state.lock().sets.remove(connection_id);
		Ok(())
	}

	async fn cleanup(&self) -> Result<()> {
		self.state.lock().sets.clear();
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use warden_core::proto::{PortRange, Protocol};

	use super::*;

	fn spec(net: &str, port: PortRange, protocol: Protocol) -> RuleSpec {
		RuleSpec {
			network: net.parse().unwrap(),
			port,
			protocol,
		}
	}

	#[tokio::test]
	async fn apply_is_idempotent() {
		let backend = MemBackend::new();
		backend.initialize().await.unwrap();
		let ip: IpAddr = "10.8.0.42".parse().unwrap();
		let rules = vec![spec("10.1.1.5/32", PortRange::Any, Protocol::Any)];

		backend
			.apply_rules("client-10-8-0-42", Uuid::nil(), ip, &rules)
			.await
			.unwrap();
		let first = backend.installed("client-10-8-0-42").unwrap();
		backend
			.apply_rules("client-10-8-0-42", Uuid::nil(), ip, &rules)
			.await
			.unwrap();
		assert_eq!(backend.installed("client-10-8-0-42").unwrap(), first);
		assert_eq!(backend.connection_ids().len(), 1);
	}

	#[tokio::test]
	async fn apply_replaces_the_previous_set() {
		let backend = MemBackend::new();
		backend.initialize().await.unwrap();
		let ip: IpAddr = "10.8.0.42".parse().unwrap();

		let set_a = vec![
			spec("10.1.1.5/32", PortRange::Any, Protocol::Any),
			spec("10.2.0.0/16", PortRange::Single(443), Protocol::Tcp),
		];
		let set_b = vec![spec("10.3.0.0/24", PortRange::Single(22), Protocol::Tcp)];

		backend
			.apply_rules("client-10-8-0-42", Uuid::nil(), ip, &set_a)
			.await
			.unwrap();
		backend
			.apply_rules("client-10-8-0-42", Uuid::nil(), ip, &set_b)
			.await
			.unwrap();

		let installed = backend.installed("client-10-8-0-42").unwrap();
		assert_eq!(installed.rules, set_b, "exactly the rules for the second set");
	}

	#[tokio::test]
	async fn remove_is_a_noop_when_absent() {
		let backend = MemBackend::new();
		backend.initialize().await.unwrap();
		backend.remove_rules("client-10-8-0-42").await.unwrap();
		assert!(backend.is_empty());
	}

	#[tokio::test]
	async fn cleanup_clears_every_set() {
		let backend = MemBackend::new();
		backend.initialize().await.unwrap();
		for ip in ["10.8.0.2", "10.8.0.3"] {
			let addr: IpAddr = ip.parse().unwrap();
			backend
				.apply_rules(&super::super::connection_id(addr), Uuid::nil(), addr, &[])
				.await
				.unwrap();
		}
		assert_eq!(backend.connection_ids().len(), 2);
		backend.cleanup().await.unwrap();
		assert!(backend.is_empty());
	}
}
