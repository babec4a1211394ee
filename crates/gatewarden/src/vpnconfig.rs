//! Client config assembly: issue an ephemeral identity cert under the
//! tenant's Sub-CA, bind a revocable auth token to it, and render a
//! `.ovpn`-compatible artifact with the full trust chain inline.
//!
//! The rendered layout is deterministic; golden tests depend on it.

use chrono::Utc;
use ipnet::IpNet;
use tracing::info;
use uuid::Uuid;
use warden_core::error::{Error, Result};
use warden_core::proto::CryptoProfile;

use crate::pki::{self, rotation};
use crate::policy;
use crate::store::{Store, mint_token};
use crate::types::{AuditKind, IssuedConfig, Tenant, TenantStatus, User};
use crate::{Settings, drift};

/// OpenVPN directive set for one crypto profile.
#[derive(Debug, Clone, Copy)]
pub struct CryptoDirectives {
	pub cipher: &'static str,
	pub data_ciphers: &'static str,
	pub auth: &'static str,
	pub tls_version_min: &'static str,
	pub tls_cipher: Option<&'static str>,
}

pub fn crypto_directives(profile: CryptoProfile) -> CryptoDirectives {
	match profile {
		CryptoProfile::Modern => CryptoDirectives {
			cipher: "AES-256-GCM",
			data_ciphers: "AES-256-GCM:CHACHA20-POLY1305",
			auth: "SHA256",
			tls_version_min: "1.2",
			tls_cipher: Some(
				"TLS-ECDHE-ECDSA-WITH-AES-256-GCM-SHA384:TLS-ECDHE-RSA-WITH-AES-256-GCM-SHA384:TLS-ECDHE-ECDSA-WITH-CHACHA20-POLY1305-SHA256:TLS-ECDHE-RSA-WITH-CHACHA20-POLY1305-SHA256",
			),
		},
		CryptoProfile::Fips => CryptoDirectives {
			cipher: "AES-256-GCM",
			data_ciphers: "AES-256-GCM:AES-128-GCM",
			auth: "SHA384",
			tls_version_min: "1.2",
			tls_cipher: Some(
				"TLS-ECDHE-ECDSA-WITH-AES-256-GCM-SHA384:TLS-ECDHE-RSA-WITH-AES-256-GCM-SHA384:TLS-RSA-WITH-AES-256-GCM-SHA384",
			),
		},
		CryptoProfile::Compatible => CryptoDirectives {
			cipher: "AES-256-CBC",
			data_ciphers: "AES-256-GCM:AES-128-GCM:AES-256-CBC:AES-128-CBC",
			auth: "SHA256",
			tls_version_min: "1.0",
			tls_cipher: None,
		},
	}
}

/// Everything the renderer needs, fully resolved. Kept separate from
/// [`generate`] so the layout can be pinned by tests with fixed inputs.
pub(crate) struct RenderInput<'a> {
	pub tenant: &'a Tenant,
	pub email: &'a str,
	pub auth_token: &'a str,
	pub ca_chain: &'a str,
	pub client_cert: &'a str,
	pub client_key: &'a str,
	pub routes: &'a [IpNet],
}

fn push_block(out: &mut String, tag: &str, body: &str) {
	out.push('<');
	out.push_str(tag);
	out.push_str(">\n");
	out.push_str(body.trim_end());
	out.push_str("\n</");
	out.push_str(tag);
	out.push_str(">\n");
}

pub(crate) fn render(input: &RenderInput<'_>) -> String {
	let tenant = input.tenant;
	let crypto = crypto_directives(tenant.crypto_profile);
	let mut out = String::new();
	out.push_str("client\n");
	out.push_str("dev tun\n");
	out.push_str(&format!("proto {}\n", tenant.vpn_protocol));
	out.push_str(&format!(
		"remote {} {}\n",
		tenant.public_endpoint, tenant.vpn_port
	));
	out.push_str("resolv-retry infinite\n");
	out.push_str("nobind\n");
	out.push_str("persist-key\n");
	out.push_str("persist-tun\n");
	out.push_str("remote-cert-tls server\n");
	out.push_str("auth-nocache\n");
	out.push_str("verb 3\n");
	out.push_str(&format!("cipher {}\n", crypto.cipher));
	out.push_str(&format!("data-ciphers {}\n", crypto.data_ciphers));
	out.push_str(&format!("auth {}\n", crypto.auth));
	out.push_str(&format!("tls-version-min {}\n", crypto.tls_version_min));
	if let Some(tls_cipher) = crypto.tls_cipher {
		out.push_str(&format!("tls-cipher {tls_cipher}\n"));
	}
	for route in input.routes {
		match route {
			IpNet::V4(net) => {
				out.push_str(&format!("route {} {}\n", net.network(), net.netmask()));
			},
			IpNet::V6(net) => {
				out.push_str(&format!("route-ipv6 {net}\n"));
			},
		}
	}
	for dns in &tenant.dns_servers {
		out.push_str(&format!("dhcp-option DNS {dns}\n"));
	}
	push_block(&mut out, "ca", input.ca_chain);
	push_block(&mut out, "cert", input.client_cert);
	push_block(&mut out, "key", input.client_key);
	push_block(
		&mut out,
		"auth-user-pass",
		&format!("{}\n{}", input.email, input.auth_token),
	);
	if tenant.tls_auth_enabled {
		if let Some(key) = &tenant.tls_auth_key {
			push_block(&mut out, "tls-auth", key);
			out.push_str("key-direction 1\n");
		}
	}
	out
}

/// Suggested download filename for a generated config.
pub fn filename(tenant: &Tenant, user: &User) -> String {
	let safe: String = user
		.email
		.chars()
		.map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
		.collect();
	format!("{}-{}.ovpn", tenant.name, safe)
}

/// Issue a client identity and assemble the downloadable config.
///
/// Issuance failures surface immediately; nothing here retries silently
/// except the store-level serial/token collision, which regenerates.
pub fn generate(
	store: &dyn Store,
	settings: &Settings,
	user: &User,
	tenant_id: Uuid,
) -> Result<IssuedConfig> {
	let tenant = store.tenant(tenant_id)?;
	if tenant.status != TenantStatus::Online {
		return Err(Error::unavailable(format!(
			"tenant {} is {}",
			tenant.name, tenant.status
		)));
	}
	if !store.user_has_tenant(user, tenant.id) {
		return Err(Error::forbidden(format!(
			"user {} has no binding to tenant {}",
			user.email, tenant.name
		)));
	}

	// Re-checks the Sub-CA against the active root; a rotated-away Sub-CA is
	// replaced here, which is what makes leaf re-issuance lazy.
	let (tenant, _) = rotation::ensure_tenant_sub_ca(store, settings, tenant.id)?;
	let sub_ca_cert = tenant
		.sub_ca_cert
		.as_deref()
		.ok_or_else(|| Error::unavailable("tenant has no sub-CA"))?;
	let sub_ca_key = tenant
		.sub_ca_key
		.as_deref()
		.ok_or_else(|| Error::unavailable("tenant has no sub-CA key"))?;
	let root = rotation::active_root(store)?;

	let policy = policy::compile(store, user, tenant.id);
	let ca_chain = format!(
		"{}\n{}",
		sub_ca_cert.trim_end(),
		root.cert_pem.trim_end()
	);

	// Serial and token collisions are store-level unique constraints;
	// regenerate the whole leaf on conflict.
	for _ in 0..3 {
		let leaf = pki::generate_client_cert(
			sub_ca_cert,
			sub_ca_key,
			&user.email,
			settings.client_cert_validity(),
			tenant.key_algorithm,
		)?;
		let auth_token = mint_token();
		let blob = render(&RenderInput {
			tenant: &tenant,
			email: &user.email,
			auth_token: &auth_token,
			ca_chain: &ca_chain,
			client_cert: &leaf.cert_pem,
			client_key: &leaf.key_pem,
			routes: &policy.routes,
		});
		let config = IssuedConfig {
			id: Uuid::new_v4(),
			user_id: user.id,
			tenant_id: tenant.id,
			serial: leaf.serial,
			fingerprint: leaf.fingerprint,
			auth_token,
			config_blob: blob,
			created_at: Utc::now(),
			expires_at: leaf.not_after,
			is_revoked: false,
			revoked_at: None,
			revoked_reason: None,
			downloaded_at: None,
		};
		match store.insert_config(config.clone()) {
			Ok(()) => {
				info!(
					user = %user.email,
					tenant = %tenant.name,
					serial = %config.serial,
					"issued client config"
				);
				store.append_audit(
					AuditKind::ConfigIssued,
					format!("user {} tenant {} serial {}", user.email, tenant.name, config.serial),
				);
				return Ok(config);
			},
			Err(e) if e.kind() == warden_core::Kind::Conflict => continue,
			Err(e) => return Err(e),
		}
	}
	Err(Error::internal("serial collision persisted across retries"))
}

/// The current config-version fingerprint for a tenant, recomputed from the
/// fields the remote provisions from.
pub fn expected_version(tenant: &Tenant) -> String {
	drift::config_version(tenant)
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use warden_core::proto::VpnProtocol;

	use super::*;
	use crate::store::MemStore;
	use crate::types::IdentityAssertion;

	fn fixed_tenant() -> Tenant {
		let mut t = Tenant::new("gw-1", "vpn.example.com");
		t.vpn_port = 1194;
		t.vpn_protocol = VpnProtocol::Udp;
		t.crypto_profile = CryptoProfile::Modern;
		t
	}

	#[test]
	fn rendered_layout_is_stable() {
		let tenant = fixed_tenant();
		let routes = vec![
			"10.1.1.5/32".parse::<IpNet>().unwrap(),
			"10.2.0.0/16".parse().unwrap(),
		];
		let blob = render(&RenderInput {
			tenant: &tenant,
			email: "u@x.test",
			auth_token: "tok-fixed",
			ca_chain: "SUBCA\nROOTCA",
			client_cert: "CERT",
			client_key: "KEY",
			routes: &routes,
		});
		let expected = "\
client
dev tun
proto udp
remote vpn.example.com 1194
resolv-retry infinite
nobind
persist-key
persist-tun
remote-cert-tls server
auth-nocache
verb 3
cipher AES-256-GCM
data-ciphers AES-256-GCM:CHACHA20-POLY1305
auth SHA256
tls-version-min 1.2
tls-cipher TLS-ECDHE-ECDSA-WITH-AES-256-GCM-SHA384:TLS-ECDHE-RSA-WITH-AES-256-GCM-SHA384:TLS-ECDHE-ECDSA-WITH-CHACHA20-POLY1305-SHA256:TLS-ECDHE-RSA-WITH-CHACHA20-POLY1305-SHA256
route 10.1.1.5 255.255.255.255
route 10.2.0.0 255.255.0.0
<ca>
SUBCA
ROOTCA
</ca>
<cert>
CERT
</cert>
<key>
KEY
</key>
<auth-user-pass>
u@x.test
tok-fixed
</auth-user-pass>
";
		assert_eq!(blob, expected);
	}

	#[test]
	fn compatible_profile_has_no_tls_cipher() {
		let mut tenant = fixed_tenant();
		tenant.crypto_profile = CryptoProfile::Compatible;
		let blob = render(&RenderInput {
			tenant: &tenant,
			email: "u@x.test",
			auth_token: "tok",
			ca_chain: "CA",
			client_cert: "CERT",
			client_key: "KEY",
			routes: &[],
		});
		assert!(blob.contains("cipher AES-256-CBC\n"));
		assert!(blob.contains("tls-version-min 1.0\n"));
		assert!(!blob.contains("tls-cipher"));
	}

	#[test]
	fn tls_auth_block_carries_key_direction() {
		let mut tenant = fixed_tenant();
		tenant.tls_auth_enabled = true;
		tenant.tls_auth_key = Some("STATICKEY".into());
		let blob = render(&RenderInput {
			tenant: &tenant,
			email: "u@x.test",
			auth_token: "tok",
			ca_chain: "CA",
			client_cert: "CERT",
			client_key: "KEY",
			routes: &[],
		});
		assert!(blob.contains("<tls-auth>\nSTATICKEY\n</tls-auth>\nkey-direction 1\n"));
	}

	fn online_tenant_with_user(store: &MemStore) -> (Tenant, User) {
		crate::pki::rotation::ensure_root(store, &Settings::default()).unwrap();
		let mut tenant = fixed_tenant();
		tenant.status = TenantStatus::Online;
		store.create_tenant(tenant.clone()).unwrap();
		let user = store.upsert_user(IdentityAssertion {
			external_id: "ext-1".into(),
			provider: "oidc".into(),
			email: "u@x.test".into(),
			groups: vec![],
			is_admin: false,
		});
		store.bind_user_tenant(user.id, tenant.id).unwrap();
		(tenant, user)
	}

	#[test]
	fn generate_rejects_offline_tenant_and_unbound_user() {
		let store = MemStore::new();
		let (tenant, user) = online_tenant_with_user(&store);

		let mut offline = store.tenant(tenant.id).unwrap();
		offline.status = TenantStatus::Offline;
		store.update_tenant(offline).unwrap();
		let err = generate(&store, &Settings::default(), &user, tenant.id).unwrap_err();
		assert_eq!(err.kind(), warden_core::Kind::Unavailable);

		let mut online = store.tenant(tenant.id).unwrap();
		online.status = TenantStatus::Online;
		store.update_tenant(online).unwrap();
		let stranger = store.upsert_user(IdentityAssertion {
			external_id: "ext-2".into(),
			provider: "oidc".into(),
			email: "other@x.test".into(),
			groups: vec![],
			is_admin: false,
		});
		let err = generate(&store, &Settings::default(), &stranger, tenant.id).unwrap_err();
		assert_eq!(err.kind(), warden_core::Kind::Forbidden);
	}

	#[test]
	fn generate_produces_verifiable_identity() {
		let store = MemStore::new();
		let (tenant, user) = online_tenant_with_user(&store);

		let config = generate(&store, &Settings::default(), &user, tenant.id).unwrap();
		assert_eq!(config.serial.len(), 32);
		assert!(config.config_blob.starts_with("client\n"));
		assert!(config.config_blob.contains(&config.auth_token));
		assert!(config.expires_at > Utc::now());

		// The embedded chain is Sub-CA then root, and the issued cert chains
		// to the tenant's Sub-CA.
		let tenant = store.tenant(tenant.id).unwrap();
		let sub = tenant.sub_ca_cert.unwrap();
		assert!(config.config_blob.contains(sub.trim_end()));
	}

	#[test]
	fn parallel_generation_yields_distinct_serials_and_tokens() {
		let store = Arc::new(MemStore::new());
		let (tenant, user) = online_tenant_with_user(&store);
		let tenant_id = tenant.id;

		let mut handles = Vec::new();
		for _ in 0..8 {
			let store = store.clone();
			let user = user.clone();
			handles.push(std::thread::spawn(move || {
				generate(store.as_ref(), &Settings::default(), &user, tenant_id).unwrap()
			}));
		}
		let configs: Vec<IssuedConfig> = handles.into_iter().map(|h| h.join().unwrap()).collect();
		let serials: std::collections::HashSet<_> =
			configs.iter().map(|c| c.serial.clone()).collect();
		let tokens: std::collections::HashSet<_> =
			configs.iter().map(|c| c.auth_token.clone()).collect();
		assert_eq!(serials.len(), 8);
		assert_eq!(tokens.len(), 8);
	}
}
