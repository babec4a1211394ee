//! Spoke provisioning: a relay behind a hub gets a client identity under
//! the hub's Sub-CA and a tunnel address allocated from the hub's subnet.

use std::net::Ipv4Addr;

use chrono::Utc;
use ipnet::Ipv4Net;
use tracing::info;
use uuid::Uuid;
use warden_core::error::{Error, Kind, Result};

use crate::Settings;
use crate::pki::{self, rotation};
use crate::store::{Store, mint_token};
use crate::types::{Spoke, SpokeStatus};

/// First free host address in `subnet`, skipping the hub's own `.1`.
/// Every spoke gets a distinct address; exhaustion is a hard `Conflict`.
fn allocate_tunnel_ip(subnet: Ipv4Net, taken: &[Ipv4Addr]) -> Result<Ipv4Addr> {
	let hub_addr = subnet.hosts().next();
	for candidate in subnet.hosts() {
		if Some(candidate) == hub_addr {
			continue;
		}
		if !taken.contains(&candidate) {
			return Ok(candidate);
		}
	}
	Err(Error::conflict(format!("subnet {subnet} is exhausted")))
}

/// Create a spoke under `hub_id`: allocate a tunnel IP, issue a client cert
/// under the hub's Sub-CA, mint its bearer token. The spoke starts
/// `pending` and flips to `connected` on its first heartbeat.
pub fn create(
	store: &dyn Store,
	settings: &Settings,
	hub_id: Uuid,
	name: &str,
	local_networks: Vec<Ipv4Net>,
) -> Result<Spoke> {
	let (hub, _) = rotation::ensure_tenant_sub_ca(store, settings, hub_id)?;
	let sub_ca_cert = hub
		.sub_ca_cert
		.as_deref()
		.ok_or_else(|| Error::unavailable("hub has no sub-CA"))?;
	let sub_ca_key = hub
		.sub_ca_key
		.as_deref()
		.ok_or_else(|| Error::unavailable("hub has no sub-CA key"))?;

	// The allocate-then-insert pair can race with another create; the store's
	// unique constraint on (hub, tunnel_ip) arbitrates, so retry a few times.
	for _ in 0..3 {
		let taken: Vec<Ipv4Addr> = store
			.spokes_of(hub.id)
			.iter()
			.map(|s| s.tunnel_ip)
			.collect();
		let tunnel_ip = allocate_tunnel_ip(hub.vpn_subnet, &taken)?;
		let identity = pki::generate_client_cert(
			sub_ca_cert,
			sub_ca_key,
			&format!("{name}@spokes.internal"),
			settings.ca.server_validity(),
			hub.key_algorithm,
		)?;
		let spoke = Spoke {
			id: Uuid::new_v4(),
			hub_id: hub.id,
			name: name.to_string(),
			local_networks: local_networks.clone(),
			tunnel_ip,
			client_cert: identity.cert_pem,
			client_key: identity.key_pem,
			token: mint_token(),
			status: SpokeStatus::Pending,
			last_seen: None,
		};
		match store.create_spoke(spoke.clone()) {
			Ok(()) => {
				info!(hub = %hub.name, spoke = name, tunnel_ip = %tunnel_ip, "created spoke");
				return Ok(spoke);
			},
			Err(e) if e.kind() == Kind::Conflict && e.message.contains("tunnel ip") => continue,
			Err(e) => return Err(e),
		}
	}
	Err(Error::conflict("could not allocate a distinct tunnel ip"))
}

/// Record a spoke heartbeat by token; flips `pending → connected`.
pub fn heartbeat(store: &dyn Store, token: &str) -> Result<Spoke> {
	let spoke = store
		.spoke_by_token(token)
		.ok_or_else(|| Error::unauthorized("invalid token"))?;
	store.record_spoke_seen(spoke.id, Utc::now())?;
	store.spoke(spoke.id)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::MemStore;
	use crate::types::Tenant;

	fn hub(store: &MemStore, subnet: &str) -> Tenant {
		rotation::ensure_root(store, &Settings::default()).unwrap();
		let mut t = Tenant::new("hub-1", "hub.example.com");
		t.vpn_subnet = subnet.parse().unwrap();
		store.create_tenant(t.clone()).unwrap();
		t
	}

	#[test]
	fn spokes_get_distinct_ips_from_the_hub_subnet() {
		let store = MemStore::new();
		let hub = hub(&store, "172.30.0.0/29");
		let settings = Settings::default();

		// /29 leaves .1...6 usable; .1 is the hub, so three spokes fit at
		// .2, .3, .4.
		let a = create(&store, &settings, hub.id, "spoke-a", vec![]).unwrap();
		let b = create(&store, &settings, hub.id, "spoke-b", vec![]).unwrap();
		let c = create(&store, &settings, hub.id, "spoke-c", vec![]).unwrap();
		assert_eq!(a.tunnel_ip, "172.30.0.2".parse::<Ipv4Addr>().unwrap());
		assert_eq!(b.tunnel_ip, "172.30.0.3".parse::<Ipv4Addr>().unwrap());
		assert_eq!(c.tunnel_ip, "172.30.0.4".parse::<Ipv4Addr>().unwrap());

		// Spoke certs chain to the hub's sub-CA.
		let hub = store.tenant(hub.id).unwrap();
		assert!(
			pki::verify_signed_by(&a.client_cert, hub.sub_ca_cert.as_deref().unwrap()).unwrap()
		);
	}

	#[test]
	fn exhausted_subnet_conflicts() {
		let store = MemStore::new();
		let hub = hub(&store, "172.30.0.0/30");
		let settings = Settings::default();

		// /30 has hosts .1 and .2; the hub owns .1.
		create(&store, &settings, hub.id, "spoke-a", vec![]).unwrap();
		let err = create(&store, &settings, hub.id, "spoke-b", vec![]).unwrap_err();
		assert_eq!(err.kind(), Kind::Conflict);
	}

	#[test]
	fn heartbeat_connects_pending_spoke() {
		let store = MemStore::new();
		let hub = hub(&store, "172.30.0.0/24");
		let spoke = create(&store, &Settings::default(), hub.id, "spoke-a", vec![]).unwrap();
		assert_eq!(spoke.status, SpokeStatus::Pending);

		let seen = heartbeat(&store, &spoke.token).unwrap();
		assert_eq!(seen.status, SpokeStatus::Connected);
		assert!(seen.last_seen.is_some());

		assert!(heartbeat(&store, "bogus").is_err());
	}
}
