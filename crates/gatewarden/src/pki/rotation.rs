//! CA lifecycle and graceful rotation.
//!
//! The store holds the durable CA set; this module drives the status
//! machine (pending → active → retired → revoked), assembles the trust
//! bundle verifiers must install, and detects tenants whose Sub-CA no
//! longer chains to the active root.

use tracing::{info, warn};
use uuid::Uuid;
use warden_core::error::{Error, Result};

use crate::Settings;
use crate::pki;
use crate::store::Store;
use crate::types::{AuditKind, Ca, CaStatus, Tenant};

/// The active root, or `Unavailable` while the PKI is uninitialised.
pub fn active_root(store: &dyn Store) -> Result<Ca> {
	store
		.active_ca()
		.ok_or_else(|| Error::unavailable("pki is not initialised"))
}

/// First-boot bootstrap: if no CA exists at all, generate a root and
/// activate it immediately.
pub fn ensure_root(store: &dyn Store, settings: &Settings) -> Result<Ca> {
	if let Some(ca) = store.active_ca() {
		return Ok(ca);
	}
	if !store.cas().is_empty() {
		// CAs exist but none is active; an operator got us here, do not guess.
		return Err(Error::unavailable("no active ca"));
	}
	let ca = new_root(store, settings, "bootstrap root")?;
	store.activate_ca(ca.id)?;
	info!(fingerprint = %ca.fingerprint, "initialised root CA");
	store.append_audit(
		AuditKind::CaActivated,
		format!("bootstrap activation of {}", ca.fingerprint),
	);
	store.ca(ca.id)
}

fn new_root(store: &dyn Store, settings: &Settings, description: &str) -> Result<Ca> {
	let generated = pki::generate_root_ca(
		&settings.ca.organization,
		settings.ca.root_validity(),
		settings.ca.key_algorithm,
	)?;
	let ca = Ca {
		id: Uuid::new_v4(),
		cert_pem: generated.cert_pem,
		private_key_pem: generated.key_pem,
		serial: generated.serial,
		not_before: generated.not_before,
		not_after: generated.not_after,
		status: CaStatus::Pending,
		fingerprint: generated.fingerprint,
		description: description.to_string(),
	};
	store.insert_ca(ca.clone())?;
	Ok(ca)
}

/// Create the next root in `pending`. Issuance is unaffected until
/// [`activate`].
pub fn prepare_rotation(store: &dyn Store, settings: &Settings) -> Result<Ca> {
	let ca = new_root(store, settings, "prepared rotation")?;
	store.append_audit(
		AuditKind::CaPrepared,
		format!("prepared {}", ca.fingerprint),
	);
	Ok(ca)
}

/// Atomically retire the current active root and promote `id`.
pub fn activate(store: &dyn Store, id: Uuid) -> Result<Ca> {
	let rotation = store.activate_ca(id)?;
	let old = rotation
		.retired
		.as_ref()
		.map(|c| c.fingerprint.clone())
		.unwrap_or_default();
	info!(
		old_fingerprint = %old,
		new_fingerprint = %rotation.activated.fingerprint,
		"root CA activated"
	);
	store.append_audit(
		AuditKind::CaActivated,
		format!(
			"{{\"old_fingerprint\":\"{}\",\"new_fingerprint\":\"{}\"}}",
			old, rotation.activated.fingerprint
		),
	);
	Ok(rotation.activated)
}

/// Drop a CA from the trust bundle permanently.
pub fn revoke(store: &dyn Store, id: Uuid) -> Result<Ca> {
	let ca = store.revoke_ca(id)?;
	store.append_audit(AuditKind::CaRevoked, format!("revoked {}", ca.fingerprint));
	Ok(ca)
}

/// All CAs verifiers must trust right now: active first, then pending,
/// then retired. Revoked CAs are never returned.
pub fn trust_bundle(store: &dyn Store) -> Vec<Ca> {
	let mut bundle: Vec<Ca> = store
		.cas()
		.into_iter()
		.filter(|c| c.status != CaStatus::Revoked)
		.collect();
	bundle.sort_by_key(|c| match c.status {
		CaStatus::Active => 0,
		CaStatus::Pending => 1,
		CaStatus::Retired => 2,
		CaStatus::Revoked => 3,
	});
	bundle
}

/// The bundle as concatenated PEM, the form remotes write to disk.
pub fn trust_bundle_pem(store: &dyn Store) -> String {
	let mut out = String::new();
	for ca in trust_bundle(store) {
		let pem = ca.cert_pem.trim_end();
		out.push_str(pem);
		out.push('\n');
	}
	out
}

/// Make sure `tenant` has a Sub-CA chained to the active root, regenerating
/// it (and the server cert) when the root has rotated away underneath it.
/// Returns the up-to-date tenant and whether material was regenerated.
///
/// Leaf certs issued under a replaced Sub-CA are not touched here; they are
/// re-issued lazily on the next config request.
pub fn ensure_tenant_sub_ca(
	store: &dyn Store,
	settings: &Settings,
	tenant_id: Uuid,
) -> Result<(Tenant, bool)> {
	let root = active_root(store)?;
	let tenant = store.tenant(tenant_id)?;

	let expected = match (&tenant.sub_ca_cert, &tenant.sub_ca_key) {
		(Some(cert), Some(_)) if tenant.server_cert.is_some() => {
			if sub_ca_is_current(cert, &root)? {
				return Ok((tenant, false));
			}
			warn!(tenant = %tenant.name, "sub-CA no longer chains to active root, regenerating");
			Some(pki::fingerprint(cert).map_err(warden_core::Error::from)?)
		},
		(Some(cert), Some(_)) => Some(pki::fingerprint(cert).map_err(warden_core::Error::from)?),
		_ => None,
	};

	// Key generation is slow; do all of it before touching the store again.
	let sub = pki::generate_sub_ca(
		&root.cert_pem,
		&root.private_key_pem,
		&tenant.name,
		settings.ca.sub_validity(),
		tenant.key_algorithm,
	)?;
	let server = pki::generate_server_cert(
		&sub.cert_pem,
		&sub.key_pem,
		&tenant.public_endpoint,
		&[tenant.public_endpoint.clone()],
		settings.ca.server_validity(),
		tenant.key_algorithm,
	)?;

	let installed = store.install_tenant_pki(
		tenant.id,
		expected.as_deref(),
		sub.cert_pem.clone(),
		sub.key_pem,
		server.cert_pem,
		server.key_pem,
	)?;
	if !installed {
		// A concurrent provision won the swap; its material is just as good.
		return Ok((store.tenant(tenant_id)?, false));
	}

	store.append_audit(
		AuditKind::SubCaRegenerated,
		format!("tenant {} sub-CA {}", tenant.name, sub.fingerprint),
	);
	Ok((store.tenant(tenant_id)?, true))
}

fn sub_ca_is_current(sub_ca_cert: &str, root: &Ca) -> Result<bool> {
	let aki = pki::authority_key_id_hex(sub_ca_cert).map_err(warden_core::Error::from)?;
	let ski = pki::subject_key_id_hex(&root.cert_pem).map_err(warden_core::Error::from)?;
	if aki.is_none() || aki != ski {
		return Ok(false);
	}
	Ok(pki::verify_signed_by(sub_ca_cert, &root.cert_pem).map_err(warden_core::Error::from)?)
}

/// Generate and persist a `tls-auth` key for tenants that enabled it but
/// have none yet.
pub fn ensure_tls_auth_key(store: &dyn Store, tenant: &Tenant) -> Result<Tenant> {
	if !tenant.tls_auth_enabled || tenant.tls_auth_key.is_some() {
		return Ok(tenant.clone());
	}
	store.set_tls_auth_key(tenant.id, pki::generate_tls_auth_key())?;
	store.tenant(tenant.id)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::MemStore;
	use crate::types::KeyAlgorithm;

	fn settings() -> Settings {
		Settings::default()
	}

	fn bootstrapped() -> (MemStore, Ca) {
		let store = MemStore::new();
		let root = ensure_root(&store, &settings()).unwrap();
		(store, root)
	}

	fn tenant(store: &dyn Store) -> Tenant {
		let t = Tenant::new("gw-1", "vpn.example.com");
		store.create_tenant(t.clone()).unwrap();
		t
	}

	#[test]
	fn retired_root_keeps_verifying_old_leaves() {
		let (store, root_a) = bootstrapped();
		let t = tenant(&store);
		let (t, regenerated) = ensure_tenant_sub_ca(&store, &settings(), t.id).unwrap();
		assert!(regenerated);
		let old_sub = t.sub_ca_cert.clone().unwrap();
		let leaf = pki::generate_client_cert(
			&old_sub,
			&t.sub_ca_key.clone().unwrap(),
			"u@x.test",
			chrono::Duration::hours(24),
			KeyAlgorithm::EcdsaP256,
		)
		.unwrap();

		// Rotate.
		let root_b = prepare_rotation(&store, &settings()).unwrap();
		activate(&store, root_b.id).unwrap();
		assert_eq!(store.ca(root_a.id).unwrap().status, CaStatus::Retired);

		// The retired root stays in the bundle, so old leaves still verify.
		let bundle = trust_bundle(&store);
		assert_eq!(bundle[0].id, root_b.id, "active CA must come first");
		assert!(bundle.iter().any(|c| c.id == root_a.id));
		assert!(pki::verify_signed_by(&old_sub, &root_a.cert_pem).unwrap());
		assert!(pki::verify_signed_by(&leaf.cert_pem, &old_sub).unwrap());

		// Detector regenerates the sub-CA under the new root.
		let (t, regenerated) = ensure_tenant_sub_ca(&store, &settings(), t.id).unwrap();
		assert!(regenerated);
		let new_sub = t.sub_ca_cert.unwrap();
		let new_aki = pki::authority_key_id_hex(&new_sub).unwrap();
		let b_ski = pki::subject_key_id_hex(&store.ca(root_b.id).unwrap().cert_pem).unwrap();
		assert_eq!(new_aki, b_ski);
	}

	#[test]
	fn revoked_ca_leaves_the_bundle() {
		let (store, root_a) = bootstrapped();
		let root_b = prepare_rotation(&store, &settings()).unwrap();
		activate(&store, root_b.id).unwrap();
		revoke(&store, root_a.id).unwrap();

		let bundle = trust_bundle(&store);
		assert!(bundle.iter().all(|c| c.id != root_a.id));
		assert_eq!(bundle.len(), 1);
	}

	#[test]
	fn ensure_sub_ca_is_idempotent_while_root_is_stable() {
		let (store, _) = bootstrapped();
		let t = tenant(&store);
		let (t1, first) = ensure_tenant_sub_ca(&store, &settings(), t.id).unwrap();
		let (t2, second) = ensure_tenant_sub_ca(&store, &settings(), t.id).unwrap();
		assert!(first);
		assert!(!second);
		assert_eq!(t1.sub_ca_cert, t2.sub_ca_cert);
	}

	#[test]
	fn activation_audits_both_fingerprints() {
		let (store, root_a) = bootstrapped();
		let root_b = prepare_rotation(&store, &settings()).unwrap();
		activate(&store, root_b.id).unwrap();

		let audit = store.audit();
		let event = audit
			.iter()
			.rfind(|e| e.kind == AuditKind::CaActivated)
			.unwrap();
		assert!(event.detail.contains(&root_a.fingerprint));
		assert!(event.detail.contains(&root_b.fingerprint));
	}

	#[test]
	fn tls_auth_key_minted_once() {
		let (store, _) = bootstrapped();
		let mut t = Tenant::new("gw-1", "vpn.example.com");
		t.tls_auth_enabled = true;
		store.create_tenant(t.clone()).unwrap();

		let t1 = ensure_tls_auth_key(&store, &store.tenant(t.id).unwrap()).unwrap();
		let t2 = ensure_tls_auth_key(&store, &t1).unwrap();
		assert!(t1.tls_auth_key.is_some());
		assert_eq!(t1.tls_auth_key, t2.tls_auth_key);
	}
}
