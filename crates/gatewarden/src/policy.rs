//! Resolve (user, groups, tenant) into the ordered allow-list a gateway
//! enforces for one client, plus the route CIDRs pushed into the client
//! config.

use std::collections::HashSet;
use std::net::IpAddr;

use ipnet::IpNet;
use tracing::warn;
use uuid::Uuid;
use warden_core::proto::{AllowedDestination, RuleType};

use crate::store::Store;
use crate::types::User;

#[derive(Debug, Clone, Default)]
pub struct CompiledPolicy {
	/// Ordered, deduplicated. Empty means deny-all for this client.
	pub destinations: Vec<AllowedDestination>,
	/// CIDRs the client should route into the tunnel. Hostname rules
	/// contribute nothing here; the gateway resolves them at enforcement
	/// time.
	pub routes: Vec<IpNet>,
}

/// Union user-direct and group rules, scope to the tenant's networks, order
/// by rule name for stability.
pub fn compile(store: &dyn Store, user: &User, tenant_id: Uuid) -> CompiledPolicy {
	if !user.is_active {
		return CompiledPolicy::default();
	}

	let tenant_networks = store.tenant_networks(tenant_id);
	let mut rules = store.rules_for(user.id, &user.groups);
	rules.retain(|r| r.is_active);
	// Networks are gateway-scoped; rules pinned to a network another
	// gateway owns must never leak cross-gateway routes.
	rules.retain(|r| match r.network_id {
		None => true,
		Some(network_id) => {
			tenant_networks.contains(&network_id)
				&& store
					.network(network_id)
					.map(|n| n.is_active)
					.unwrap_or(false)
		},
	});
	rules.sort_by(|a, b| a.name.cmp(&b.name));

	let mut seen = HashSet::new();
	let mut destinations = Vec::new();
	let mut routes = Vec::new();
	for rule in rules {
		let dest = AllowedDestination {
			rule_type: rule.rule_type,
			value: rule.value.clone(),
			port: rule.port_range,
			protocol: rule.protocol,
		};
		if !seen.insert((
			dest.rule_type,
			dest.value.clone(),
			dest.port.to_string(),
			dest.protocol,
		)) {
			continue;
		}
		match rule.rule_type {
			RuleType::Ip => match rule.value.parse::<IpAddr>() {
				Ok(ip) => routes.push(IpNet::from(ip)),
				Err(_) => {
					warn!(rule = %rule.name, value = %rule.value, "unparseable ip in rule, skipping route");
				},
			},
			RuleType::Cidr => match rule.value.parse::<IpNet>() {
				Ok(net) => routes.push(net),
				Err(_) => {
					warn!(rule = %rule.name, value = %rule.value, "unparseable cidr in rule, skipping route");
				},
			},
			// Resolution happens on the gateway; no client route.
			RuleType::Hostname | RuleType::HostnameWildcard => {},
		}
		destinations.push(dest);
	}

	routes.sort();
	routes.dedup();
	CompiledPolicy {
		destinations,
		routes,
	}
}
