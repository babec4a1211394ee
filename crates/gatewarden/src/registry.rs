//! Issued-artifact registry: lookup, revocation and expiry semantics for
//! generated client configs. `by_auth_token` is the single source of truth
//! for the VPN's password-verify hook.

use chrono::{DateTime, Utc};
use uuid::Uuid;
use warden_core::error::{Error, Result};

use crate::store::Store;
use crate::types::{AuditKind, IssuedConfig};

/// The record, only while it is live. Revoked or expired configs are `Gone`
/// (with the revocation reason when there is one).
pub fn get(store: &dyn Store, id: Uuid, now: DateTime<Utc>) -> Result<IssuedConfig> {
	let config = store.config(id)?;
	live(config, now)
}

/// Resolve an auth token to its owning `(user_id, config_id)`. Unknown
/// tokens are `NotFound`; revoked/expired ones are `Gone`.
pub fn by_auth_token(store: &dyn Store, token: &str, now: DateTime<Utc>) -> Result<(Uuid, Uuid)> {
	let config = store
		.config_by_auth_token(token)
		.ok_or_else(|| Error::not_found("auth token"))?;
	let config = live(config, now)?;
	Ok((config.user_id, config.id))
}

fn live(config: IssuedConfig, now: DateTime<Utc>) -> Result<IssuedConfig> {
	if config.is_revoked {
		let reason = config.revoked_reason.as_deref().unwrap_or("revoked");
		return Err(Error::gone(format!("revoked: {reason}")));
	}
	if now >= config.expires_at {
		return Err(Error::gone("expired"));
	}
	Ok(config)
}

/// Revoke once; a second call reports "not found or already revoked".
pub fn revoke(store: &dyn Store, id: Uuid, reason: &str) -> Result<()> {
	store.revoke_config(id, reason, Utc::now())?;
	store.append_audit(AuditKind::ConfigRevoked, format!("config {id}: {reason}"));
	Ok(())
}

/// Delete configs whose expiry predates `now - older_than`. Runs hourly
/// from the janitor.
pub fn gc(store: &dyn Store, older_than: chrono::Duration, now: DateTime<Utc>) -> usize {
	store.purge_configs_expired_before(now - older_than)
}
