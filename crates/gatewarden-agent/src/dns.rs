//! Hostname expansion for compiled destinations. The gateway's resolver is
//! authoritative: the control plane ships hostnames, we turn them into host
//! routes just before each apply.

use std::net::IpAddr;

use ipnet::IpNet;
use tracing::warn;
use warden_core::error::{Error, Result};
use warden_core::proto::{AllowedDestination, RuleType};

use crate::firewall::RuleSpec;

#[async_trait::async_trait]
pub trait Resolve: Send + Sync {
	async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// System resolver backed by hickory.
pub struct SystemResolver {
	resolver: hickory_resolver::TokioResolver,
}

impl SystemResolver {
	pub fn new() -> anyhow::Result<Self> {
		let resolver = hickory_resolver::TokioResolver::builder_tokio()?.build();
		Ok(SystemResolver { resolver })
	}
}

#[async_trait::async_trait]
impl Resolve for SystemResolver {
	async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>> {
		let lookup = self
			.resolver
			.lookup_ip(host)
			.await
			.map_err(|e| Error::unavailable(format!("resolve {host}: {e}")))?;
		Ok(lookup.iter().collect())
	}
}

/// Fixed-answer resolver for tests and offline development.
#[derive(Default)]
pub struct StaticResolver {
	answers: parking_lot::Mutex<std::collections::HashMap<String, Vec<IpAddr>>>,
}

impl StaticResolver {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn set(&self, host: &str, ips: Vec<IpAddr>) {
		self.answers.lock().insert(host.to_string(), ips);
	}

	pub fn clear(&self, host: &str) {
		self.answers.lock().remove(host);
	}
}

#[async_trait::async_trait]
impl Resolve for StaticResolver {
	async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>> {
		self
			.answers
			.lock()
			.get(host)
			.cloned()
			.ok_or_else(|| Error::unavailable(format!("no answer for {host}")))
	}
}

fn host_route(ip: IpAddr) -> IpNet {
	// value/32 per resolved IPv4, value/128 per IPv6.
	IpNet::from(ip)
}

/// Expand destinations into concrete rule specs. Resolution failures
/// degrade to "no networks from this rule" with a warning; they never fail
/// the whole apply.
pub async fn expand(dests: &[AllowedDestination], resolver: &dyn Resolve) -> Vec<RuleSpec> {
	let mut out = Vec::new();
	for dest in dests {
		match dest.rule_type {
			RuleType::Ip => match dest.value.parse::<IpAddr>() {
				Ok(ip) => out.push(RuleSpec {
					network: host_route(ip),
					port: dest.port,
					protocol: dest.protocol,
				}),
				Err(_) => warn!(value = %dest.value, "unparseable ip destination, skipping"),
			},
			RuleType::Cidr => match dest.value.parse::<IpNet>() {
				Ok(net) => out.push(RuleSpec {
					network: net,
					port: dest.port,
					protocol: dest.protocol,
				}),
				Err(_) => warn!(value = %dest.value, "unparseable cidr destination, skipping"),
			},
			RuleType::Hostname | RuleType::HostnameWildcard => {
				// Wildcards resolve on their apex; DNS cannot enumerate a
				// zone, so that is the best a packet filter can enforce.
				let host = dest
					.value
					.strip_prefix("*.")
					.unwrap_or(dest.value.as_str());
				match resolver.lookup(host).await {
					Ok(ips) => {
						for ip in ips {
							out.push(RuleSpec {
								network: host_route(ip),
								port: dest.port,
								protocol: dest.protocol,
							});
						}
					},
					Err(e) => {
						warn!(host, "dns lookup failed, no networks from this rule: {e}");
					},
				}
			},
		}
	}
	out
}

#[cfg(test)]
mod tests {
	use warden_core::proto::{PortRange, Protocol};

	use super::*;

	fn resolver_with(host: &str, ips: &[&str]) -> StaticResolver {
		let resolver = StaticResolver::new();
		resolver.set(host, ips.iter().map(|s| s.parse().unwrap()).collect());
		resolver
	}

	fn dest(rule_type: RuleType, value: &str) -> AllowedDestination {
		AllowedDestination {
			rule_type,
			value: value.into(),
			port: PortRange::Single(443),
			protocol: Protocol::Tcp,
		}
	}

	#[tokio::test]
	async fn hostname_expands_to_host_routes() {
		let resolver = resolver_with("api.internal", &["192.0.2.10", "192.0.2.11"]);
		let specs = expand(&[dest(RuleType::Hostname, "api.internal")], &resolver).await;
		let nets: Vec<String> = specs.iter().map(|s| s.network.to_string()).collect();
		assert_eq!(nets, vec!["192.0.2.10/32", "192.0.2.11/32"]);
		assert!(specs.iter().all(|s| s.port == PortRange::Single(443)));
	}

	#[tokio::test]
	async fn failed_lookup_degrades_to_nothing() {
		let resolver = StaticResolver::new();
		let specs = expand(
			&[
				dest(RuleType::Hostname, "gone.internal"),
				dest(RuleType::Ip, "10.1.1.5"),
			],
			&resolver,
		)
		.await;
		// The broken hostname contributes nothing; the ip rule survives.
		assert_eq!(specs.len(), 1);
		assert_eq!(specs[0].network.to_string(), "10.1.1.5/32");
	}

	#[tokio::test]
	async fn wildcard_resolves_its_apex() {
		let resolver = resolver_with("internal.example", &["203.0.113.5"]);
		let specs = expand(
			&[dest(RuleType::HostnameWildcard, "*.internal.example")],
			&resolver,
		)
		.await;
		assert_eq!(specs.len(), 1);
		assert_eq!(specs[0].network.to_string(), "203.0.113.5/32");
	}

	#[tokio::test]
	async fn ipv6_gets_a_128() {
		let resolver = resolver_with("v6.internal", &["2001:db8::10"]);
		let specs = expand(&[dest(RuleType::Hostname, "v6.internal")], &resolver).await;
		assert_eq!(specs[0].network.to_string(), "2001:db8::10/128");
	}
}
