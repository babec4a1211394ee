//! Config-version fingerprint: a short deterministic hash over the tenant
//! fields a remote must reprovision for. Not a counter; remotes compare
//! for inequality only.

use crate::pki;
use crate::types::Tenant;

/// First 4 bytes of sha256, hex; empty input hashes to the empty string so
/// "no key" and "key present" always differ.
fn short_hash(input: Option<&str>) -> String {
	match input {
		None => String::new(),
		Some(s) => {
			let digest = aws_lc_rs::digest::digest(&aws_lc_rs::digest::SHA256, s.as_bytes());
			hex::encode(&digest.as_ref()[..4])
		},
	}
}

/// Deterministic fingerprint over the ordered tuple of provisioning-relevant
/// tenant fields, sha256-hashed and truncated to 8 bytes (hex).
pub fn config_version(tenant: &Tenant) -> String {
	let tuple = format!(
		"{}|{}|{}|{}|{}|{}|{}",
		tenant.vpn_port,
		tenant.vpn_protocol,
		tenant.vpn_subnet,
		tenant.crypto_profile,
		tenant.tls_auth_enabled,
		short_hash(tenant.tls_auth_key.as_deref()),
		short_hash(tenant.sub_ca_cert.as_deref()),
	);
	let digest = pki::sha256_hex(tuple.as_bytes());
	digest[..16].to_string()
}

#[cfg(test)]
mod tests {
	use warden_core::proto::{CryptoProfile, VpnProtocol};

	use super::*;
	use crate::types::Tenant;

	fn tenant() -> Tenant {
		Tenant::new("gw-1", "vpn.example.com")
	}

	#[test]
	fn fingerprint_is_8_bytes_hex() {
		let v = config_version(&tenant());
		assert_eq!(v.len(), 16);
		assert!(v.chars().all(|c| c.is_ascii_hexdigit()));
	}

	#[test]
	fn fingerprint_is_stable() {
		let t = tenant();
		assert_eq!(config_version(&t), config_version(&t));
	}

	#[test]
	fn tracked_fields_move_the_fingerprint() {
		let base = tenant();
		let v0 = config_version(&base);

		let mut t = base.clone();
		t.vpn_port = 1195;
		assert_ne!(config_version(&t), v0, "vpn_port is tracked");

		let mut t = base.clone();
		t.vpn_protocol = VpnProtocol::Tcp;
		assert_ne!(config_version(&t), v0, "vpn_protocol is tracked");

		let mut t = base.clone();
		t.vpn_subnet = "10.9.0.0/24".parse().unwrap();
		assert_ne!(config_version(&t), v0, "vpn_subnet is tracked");

		let mut t = base.clone();
		t.crypto_profile = CryptoProfile::Fips;
		assert_ne!(config_version(&t), v0, "crypto_profile is tracked");

		let mut t = base.clone();
		t.tls_auth_enabled = true;
		assert_ne!(config_version(&t), v0, "tls_auth_enabled is tracked");

		let mut t = base.clone();
		t.tls_auth_key = Some("-----BEGIN OpenVPN Static key V1-----".into());
		assert_ne!(config_version(&t), v0, "tls_auth_key is tracked");

		let mut t = base.clone();
		t.sub_ca_cert = Some("-----BEGIN CERTIFICATE-----".into());
		assert_ne!(config_version(&t), v0, "sub_ca_cert is tracked");
	}

	#[test]
	fn untracked_fields_do_not_move_the_fingerprint() {
		let base = tenant();
		let v0 = config_version(&base);

		let mut t = base.clone();
		t.status_message = Some("degraded".into());
		t.last_heartbeat = Some(chrono::Utc::now());
		t.api_token = "different".into();
		t.server_cert = Some("-----BEGIN CERTIFICATE-----".into());
		assert_eq!(config_version(&t), v0);
	}
}
