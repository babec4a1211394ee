//! The store owns every persistent entity. The trait is the set of
//! operations the rest of the control plane is allowed to perform; the
//! in-memory implementation keeps all tables behind one lock so multi-row
//! invariants (CA activation, Sub-CA swap) commit atomically.

use std::collections::{HashMap, HashSet};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::Rng;
use uuid::Uuid;
use warden_core::error::{Error, Result};

use crate::types::{
	AccessRule, AuditEvent, AuditKind, Ca, CaStatus, IdentityAssertion, IssuedConfig, Network,
	Spoke, SpokeStatus, Tenant, TenantStatus, User,
};

/// 256-bit URL-safe bearer token.
pub fn mint_token() -> String {
	let mut buf = [0u8; 32];
	rand::rng().fill_bytes(&mut buf);
	URL_SAFE_NO_PAD.encode(buf)
}

/// Result of an atomic CA activation.
#[derive(Debug, Clone)]
pub struct CaRotation {
	pub retired: Option<Ca>,
	pub activated: Ca,
}

pub trait Store: Send + Sync {
	// CAs
	fn insert_ca(&self, ca: Ca) -> Result<()>;
	fn ca(&self, id: Uuid) -> Result<Ca>;
	fn cas(&self) -> Vec<Ca>;
	fn active_ca(&self) -> Option<Ca>;
	/// Atomic: the current `active` (if any) becomes `retired`, `id` becomes
	/// `active`. Rejects unless `id` is `pending`.
	fn activate_ca(&self, id: Uuid) -> Result<CaRotation>;
	fn revoke_ca(&self, id: Uuid) -> Result<Ca>;

	// Tenants
	fn create_tenant(&self, tenant: Tenant) -> Result<()>;
	fn tenant(&self, id: Uuid) -> Result<Tenant>;
	fn tenants(&self) -> Vec<Tenant>;
	fn tenant_by_token(&self, token: &str) -> Option<Tenant>;
	fn update_tenant(&self, tenant: Tenant) -> Result<()>;
	fn record_heartbeat(
		&self,
		id: Uuid,
		status_message: Option<String>,
		at: DateTime<Utc>,
	) -> Result<()>;
	/// Flip tenants whose last heartbeat predates `cutoff` to offline.
	fn mark_tenants_offline(&self, cutoff: DateTime<Utc>) -> Vec<Uuid>;
	/// Compare-and-swap install of tenant PKI material. `expected_sub_ca`
	/// is the fingerprint of the Sub-CA the caller based its decision on
	/// (`None` = tenant had none). On mismatch another writer won; returns
	/// `Ok(false)` and changes nothing.
	#[allow(clippy::too_many_arguments)]
	fn install_tenant_pki(
		&self,
		id: Uuid,
		expected_sub_ca: Option<&str>,
		sub_ca_cert: String,
		sub_ca_key: String,
		server_cert: String,
		server_key: String,
	) -> Result<bool>;
	fn set_tls_auth_key(&self, id: Uuid, key: String) -> Result<()>;

	// Spokes
	fn create_spoke(&self, spoke: Spoke) -> Result<()>;
	fn spoke(&self, id: Uuid) -> Result<Spoke>;
	fn spokes_of(&self, hub_id: Uuid) -> Vec<Spoke>;
	fn spoke_by_token(&self, token: &str) -> Option<Spoke>;
	fn record_spoke_seen(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;
	fn mark_spokes_disconnected(&self, cutoff: DateTime<Utc>) -> Vec<Uuid>;

	// Users and sessions
	fn upsert_user(&self, assertion: IdentityAssertion) -> User;
	fn user(&self, id: Uuid) -> Result<User>;
	fn user_by_email(&self, email: &str) -> Option<User>;
	fn create_session(&self, user_id: Uuid) -> String;
	fn user_by_session(&self, token: &str) -> Option<User>;

	// Networks, rules and bindings
	fn create_network(&self, network: Network) -> Result<()>;
	fn network(&self, id: Uuid) -> Result<Network>;
	fn create_rule(&self, rule: AccessRule) -> Result<()>;
	fn rule(&self, id: Uuid) -> Result<AccessRule>;
	fn bind_user_rule(&self, user_id: Uuid, rule_id: Uuid) -> Result<()>;
	fn bind_group_rule(&self, group: &str, rule_id: Uuid) -> Result<()>;
	fn bind_user_tenant(&self, user_id: Uuid, tenant_id: Uuid) -> Result<()>;
	fn bind_group_tenant(&self, group: &str, tenant_id: Uuid) -> Result<()>;
	fn bind_network_tenant(&self, network_id: Uuid, tenant_id: Uuid) -> Result<()>;
	/// Union of user-direct rules and rules bound to any of `groups`.
	fn rules_for(&self, user_id: Uuid, groups: &[String]) -> Vec<AccessRule>;
	fn tenant_networks(&self, tenant_id: Uuid) -> HashSet<Uuid>;
	fn user_has_tenant(&self, user: &User, tenant_id: Uuid) -> bool;
	fn tenants_for_user(&self, user: &User) -> Vec<Tenant>;

	// Issued configs
	fn insert_config(&self, config: IssuedConfig) -> Result<()>;
	fn config(&self, id: Uuid) -> Result<IssuedConfig>;
	fn config_by_auth_token(&self, token: &str) -> Option<IssuedConfig>;
	/// Idempotence contract: revoking a missing or already-revoked config is
	/// `NotFound` ("not found or already revoked").
	fn revoke_config(&self, id: Uuid, reason: &str, at: DateTime<Utc>) -> Result<()>;
	fn mark_downloaded(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;
	fn purge_configs_expired_before(&self, cutoff: DateTime<Utc>) -> usize;

	// Audit
	fn append_audit(&self, kind: AuditKind, detail: String);
	fn audit(&self) -> Vec<AuditEvent>;
	fn prune_audit_before(&self, cutoff: DateTime<Utc>) -> usize;
}

#[derive(Default)]
struct Tables {
	cas: HashMap<Uuid, Ca>,
	tenants: HashMap<Uuid, Tenant>,
	spokes: HashMap<Uuid, Spoke>,
	users: HashMap<Uuid, User>,
	sessions: HashMap<String, Uuid>,
	networks: HashMap<Uuid, Network>,
	rules: HashMap<Uuid, AccessRule>,
	user_rules: HashSet<(Uuid, Uuid)>,
	group_rules: HashSet<(String, Uuid)>,
	user_tenants: HashSet<(Uuid, Uuid)>,
	group_tenants: HashSet<(String, Uuid)>,
	network_tenants: HashSet<(Uuid, Uuid)>,
	configs: HashMap<Uuid, IssuedConfig>,
	audit: Vec<AuditEvent>,
}

/// In-memory store. One lock over all tables: every trait operation is a
/// transaction.
#[derive(Default)]
pub struct MemStore {
	tables: RwLock<Tables>,
}

impl MemStore {
	pub fn new() -> Self {
		Self::default()
	}
}

impl Store for MemStore {
	fn insert_ca(&self, ca: Ca) -> Result<()> {
		let mut t = self.tables.write();
		if t.cas.contains_key(&ca.id) {
			return Err(Error::conflict(format!("ca {}", ca.id)));
		}
		t.cas.insert(ca.id, ca);
		Ok(())
	}

	fn ca(&self, id: Uuid) -> Result<Ca> {
		self.tables
			.read()
			.cas
			.get(&id)
			.cloned()
			.ok_or_else(|| Error::not_found(format!("ca {id}")))
	}

	fn cas(&self) -> Vec<Ca> {
		let mut cas: Vec<Ca> = self.tables.read().cas.values().cloned().collect();
		cas.sort_by_key(|c| c.not_before);
		cas
	}

	fn active_ca(&self) -> Option<Ca> {
		self.tables
			.read()
			.cas
			.values()
			.find(|c| c.status == CaStatus::Active)
			.cloned()
	}

	fn activate_ca(&self, id: Uuid) -> Result<CaRotation> {
		let mut t = self.tables.write();
		match t.cas.get(&id) {
			None => return Err(Error::not_found(format!("ca {id}"))),
			Some(ca) if ca.status != CaStatus::Pending => {
				return Err(Error::invalid(format!(
					"ca {id} is {}, only pending CAs can be activated",
					ca.status
				)));
			},
			Some(_) => {},
		}
		let retired = t
			.cas
			.values_mut()
			.find(|c| c.status == CaStatus::Active)
			.map(|c| {
				c.status = CaStatus::Retired;
				c.clone()
			});
		let activated = t.cas.get_mut(&id).expect("checked above");
		activated.status = CaStatus::Active;
		Ok(CaRotation {
			retired,
			activated: activated.clone(),
		})
	}

	fn revoke_ca(&self, id: Uuid) -> Result<Ca> {
		let mut t = self.tables.write();
		let ca = t
			.cas
			.get_mut(&id)
			.ok_or_else(|| Error::not_found(format!("ca {id}")))?;
		ca.status = CaStatus::Revoked;
		Ok(ca.clone())
	}

	fn create_tenant(&self, tenant: Tenant) -> Result<()> {
		let mut t = self.tables.write();
		if t.tenants.values().any(|x| x.name == tenant.name) {
			return Err(Error::conflict(format!("tenant name {:?}", tenant.name)));
		}
		t.tenants.insert(tenant.id, tenant);
		Ok(())
	}

	fn tenant(&self, id: Uuid) -> Result<Tenant> {
		self.tables
			.read()
			.tenants
			.get(&id)
			.cloned()
			.ok_or_else(|| Error::not_found(format!("tenant {id}")))
	}

	fn tenants(&self) -> Vec<Tenant> {
		let mut out: Vec<Tenant> = self.tables.read().tenants.values().cloned().collect();
		out.sort_by(|a, b| a.name.cmp(&b.name));
		out
	}

	fn tenant_by_token(&self, token: &str) -> Option<Tenant> {
		self.tables
			.read()
			.tenants
			.values()
			.find(|t| t.api_token == token)
			.cloned()
	}

	fn update_tenant(&self, tenant: Tenant) -> Result<()> {
		let mut t = self.tables.write();
		if !t.tenants.contains_key(&tenant.id) {
			return Err(Error::not_found(format!("tenant {}", tenant.id)));
		}
		t.tenants.insert(tenant.id, tenant);
		Ok(())
	}

	fn record_heartbeat(
		&self,
		id: Uuid,
		status_message: Option<String>,
		at: DateTime<Utc>,
	) -> Result<()> {
		let mut t = self.tables.write();
		let tenant = t
			.tenants
			.get_mut(&id)
			.ok_or_else(|| Error::not_found(format!("tenant {id}")))?;
		tenant.status = TenantStatus::Online;
		tenant.status_message = status_message;
		tenant.last_heartbeat = Some(at);
		Ok(())
	}

	fn mark_tenants_offline(&self, cutoff: DateTime<Utc>) -> Vec<Uuid> {
		let mut t = self.tables.write();
		let mut flipped = Vec::new();
		for tenant in t.tenants.values_mut() {
			if tenant.status == TenantStatus::Online
				&& tenant.last_heartbeat.is_none_or(|hb| hb < cutoff)
			{
				tenant.status = TenantStatus::Offline;
				flipped.push(tenant.id);
			}
		}
		flipped
	}

	fn install_tenant_pki(
		&self,
		id: Uuid,
		expected_sub_ca: Option<&str>,
		sub_ca_cert: String,
		sub_ca_key: String,
		server_cert: String,
		server_key: String,
	) -> Result<bool> {
		let mut t = self.tables.write();
		let tenant = t
			.tenants
			.get_mut(&id)
			.ok_or_else(|| Error::not_found(format!("tenant {id}")))?;
		let current = tenant
			.sub_ca_cert
			.as_deref()
			.map(crate::pki::fingerprint)
			.transpose()
			.map_err(|e| Error::internal(e.to_string()))?;
		if current.as_deref() != expected_sub_ca {
			return Ok(false);
		}
		tenant.sub_ca_cert = Some(sub_ca_cert);
		tenant.sub_ca_key = Some(sub_ca_key);
		tenant.server_cert = Some(server_cert);
		tenant.server_key = Some(server_key);
		Ok(true)
	}

	fn set_tls_auth_key(&self, id: Uuid, key: String) -> Result<()> {
		let mut t = self.tables.write();
		let tenant = t
			.tenants
			.get_mut(&id)
			.ok_or_else(|| Error::not_found(format!("tenant {id}")))?;
		tenant.tls_auth_key = Some(key);
		Ok(())
	}

	fn create_spoke(&self, spoke: Spoke) -> Result<()> {
		let mut t = self.tables.write();
		if t.spokes
			.values()
			.any(|s| s.hub_id == spoke.hub_id && s.name == spoke.name)
		{
			return Err(Error::conflict(format!("spoke name {:?}", spoke.name)));
		}
		if t.spokes
			.values()
			.any(|s| s.hub_id == spoke.hub_id && s.tunnel_ip == spoke.tunnel_ip)
		{
			return Err(Error::conflict(format!("spoke tunnel ip {}", spoke.tunnel_ip)));
		}
		t.spokes.insert(spoke.id, spoke);
		Ok(())
	}

	fn spoke(&self, id: Uuid) -> Result<Spoke> {
		self.tables
			.read()
			.spokes
			.get(&id)
			.cloned()
			.ok_or_else(|| Error::not_found(format!("spoke {id}")))
	}

	fn spokes_of(&self, hub_id: Uuid) -> Vec<Spoke> {
		let mut out: Vec<Spoke> = self
			.tables
			.read()
			.spokes
			.values()
			.filter(|s| s.hub_id == hub_id)
			.cloned()
			.collect();
		out.sort_by(|a, b| a.name.cmp(&b.name));
		out
	}

	fn spoke_by_token(&self, token: &str) -> Option<Spoke> {
		self.tables
			.read()
			.spokes
			.values()
			.find(|s| s.token == token)
			.cloned()
	}

	fn record_spoke_seen(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
		let mut t = self.tables.write();
		let spoke = t
			.spokes
			.get_mut(&id)
			.ok_or_else(|| Error::not_found(format!("spoke {id}")))?;
		spoke.status = SpokeStatus::Connected;
		spoke.last_seen = Some(at);
		Ok(())
	}

	fn mark_spokes_disconnected(&self, cutoff: DateTime<Utc>) -> Vec<Uuid> {
		let mut t = self.tables.write();
		let mut flipped = Vec::new();
		for spoke in t.spokes.values_mut() {
			if spoke.status == SpokeStatus::Connected
				&& spoke.last_seen.is_none_or(|seen| seen < cutoff)
			{
				spoke.status = SpokeStatus::Disconnected;
				flipped.push(spoke.id);
			}
		}
		flipped
	}

	fn upsert_user(&self, assertion: IdentityAssertion) -> User {
		let mut t = self.tables.write();
		let existing = t
			.users
			.values()
			.find(|u| u.external_id == assertion.external_id && u.provider == assertion.provider)
			.map(|u| u.id);
		match existing {
			Some(id) => {
				let user = t.users.get_mut(&id).expect("looked up above");
				user.email = assertion.email;
				// Group membership replaces wholesale on each login.
				user.groups = assertion.groups;
				user.is_admin = assertion.is_admin;
				user.clone()
			},
			None => {
				let user = User {
					id: Uuid::new_v4(),
					external_id: assertion.external_id,
					provider: assertion.provider,
					email: assertion.email,
					groups: assertion.groups,
					is_admin: assertion.is_admin,
					is_active: true,
				};
				t.users.insert(user.id, user.clone());
				user
			},
		}
	}

	fn user(&self, id: Uuid) -> Result<User> {
		self.tables
			.read()
			.users
			.get(&id)
			.cloned()
			.ok_or_else(|| Error::not_found(format!("user {id}")))
	}

	fn user_by_email(&self, email: &str) -> Option<User> {
		self.tables
			.read()
			.users
			.values()
			.find(|u| u.email == email)
			.cloned()
	}

	fn create_session(&self, user_id: Uuid) -> String {
		let token = mint_token();
		self.tables.write().sessions.insert(token.clone(), user_id);
		token
	}

	fn user_by_session(&self, token: &str) -> Option<User> {
		let t = self.tables.read();
		let user_id = t.sessions.get(token)?;
		t.users.get(user_id).filter(|u| u.is_active).cloned()
	}

	fn create_network(&self, network: Network) -> Result<()> {
		let mut t = self.tables.write();
		if t.networks.values().any(|n| n.name == network.name) {
			return Err(Error::conflict(format!("network name {:?}", network.name)));
		}
		t.networks.insert(network.id, network);
		Ok(())
	}

	fn network(&self, id: Uuid) -> Result<Network> {
		self.tables
			.read()
			.networks
			.get(&id)
			.cloned()
			.ok_or_else(|| Error::not_found(format!("network {id}")))
	}

	fn create_rule(&self, rule: AccessRule) -> Result<()> {
		let mut t = self.tables.write();
		if t.rules.values().any(|r| r.name == rule.name) {
			return Err(Error::conflict(format!("rule name {:?}", rule.name)));
		}
		t.rules.insert(rule.id, rule);
		Ok(())
	}

	fn rule(&self, id: Uuid) -> Result<AccessRule> {
		self.tables
			.read()
			.rules
			.get(&id)
			.cloned()
			.ok_or_else(|| Error::not_found(format!("rule {id}")))
	}

	fn bind_user_rule(&self, user_id: Uuid, rule_id: Uuid) -> Result<()> {
		let mut t = self.tables.write();
		if !t.rules.contains_key(&rule_id) {
			return Err(Error::not_found(format!("rule {rule_id}")));
		}
		t.user_rules.insert((user_id, rule_id));
		Ok(())
	}

	fn bind_group_rule(&self, group: &str, rule_id: Uuid) -> Result<()> {
		let mut t = self.tables.write();
		if !t.rules.contains_key(&rule_id) {
			return Err(Error::not_found(format!("rule {rule_id}")));
		}
		t.group_rules.insert((group.to_string(), rule_id));
		Ok(())
	}

	fn bind_user_tenant(&self, user_id: Uuid, tenant_id: Uuid) -> Result<()> {
		let mut t = self.tables.write();
		if !t.tenants.contains_key(&tenant_id) {
			return Err(Error::not_found(format!("tenant {tenant_id}")));
		}
		t.user_tenants.insert((user_id, tenant_id));
		Ok(())
	}

	fn bind_group_tenant(&self, group: &str, tenant_id: Uuid) -> Result<()> {
		let mut t = self.tables.write();
		if !t.tenants.contains_key(&tenant_id) {
			return Err(Error::not_found(format!("tenant {tenant_id}")));
		}
		t.group_tenants.insert((group.to_string(), tenant_id));
		Ok(())
	}

	fn bind_network_tenant(&self, network_id: Uuid, tenant_id: Uuid) -> Result<()> {
		let mut t = self.tables.write();
		if !t.networks.contains_key(&network_id) {
			return Err(Error::not_found(format!("network {network_id}")));
		}
		if !t.tenants.contains_key(&tenant_id) {
			return Err(Error::not_found(format!("tenant {tenant_id}")));
		}
		t.network_tenants.insert((network_id, tenant_id));
		Ok(())
	}

	fn rules_for(&self, user_id: Uuid, groups: &[String]) -> Vec<AccessRule> {
		let t = self.tables.read();
		let mut ids: HashSet<Uuid> = t
			.user_rules
			.iter()
			.filter(|(u, _)| *u == user_id)
			.map(|(_, r)| *r)
			.collect();
		for (group, rule_id) in &t.group_rules {
			if groups.iter().any(|g| g == group) {
				ids.insert(*rule_id);
			}
		}
		ids.into_iter()
			.filter_map(|id| t.rules.get(&id).cloned())
			.collect()
	}

	fn tenant_networks(&self, tenant_id: Uuid) -> HashSet<Uuid> {
		self.tables
			.read()
			.network_tenants
			.iter()
			.filter(|(_, t)| *t == tenant_id)
			.map(|(n, _)| *n)
			.collect()
	}

	fn user_has_tenant(&self, user: &User, tenant_id: Uuid) -> bool {
		let t = self.tables.read();
		if t.user_tenants.contains(&(user.id, tenant_id)) {
			return true;
		}
		user
			.groups
			.iter()
			.any(|g| t.group_tenants.contains(&(g.clone(), tenant_id)))
	}

	fn tenants_for_user(&self, user: &User) -> Vec<Tenant> {
		let t = self.tables.read();
		let mut out: Vec<Tenant> = t
			.tenants
			.values()
			.filter(|tenant| {
				t.user_tenants.contains(&(user.id, tenant.id))
					|| user
						.groups
						.iter()
						.any(|g| t.group_tenants.contains(&(g.clone(), tenant.id)))
			})
			.cloned()
			.collect();
		out.sort_by(|a, b| a.name.cmp(&b.name));
		out
	}

	fn insert_config(&self, config: IssuedConfig) -> Result<()> {
		let mut t = self.tables.write();
		if t.configs.values().any(|c| c.serial == config.serial) {
			return Err(Error::conflict(format!("serial {}", config.serial)));
		}
		if t.configs
			.values()
			.any(|c| c.auth_token == config.auth_token)
		{
			return Err(Error::conflict("auth token"));
		}
		t.configs.insert(config.id, config);
		Ok(())
	}

	fn config(&self, id: Uuid) -> Result<IssuedConfig> {
		self.tables
			.read()
			.configs
			.get(&id)
			.cloned()
			.ok_or_else(|| Error::not_found(format!("config {id}")))
	}

	fn config_by_auth_token(&self, token: &str) -> Option<IssuedConfig> {
		self.tables
			.read()
			.configs
			.values()
			.find(|c| c.auth_token == token)
			.cloned()
	}

	fn revoke_config(&self, id: Uuid, reason: &str, at: DateTime<Utc>) -> Result<()> {
		let mut t = self.tables.write();
		match t.configs.get_mut(&id) {
			Some(c) if !c.is_revoked => {
				c.is_revoked = true;
				c.revoked_at = Some(at);
				c.revoked_reason = Some(reason.to_string());
				Ok(())
			},
			_ => Err(Error::not_found("config not found or already revoked")),
		}
	}

	fn mark_downloaded(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
		let mut t = self.tables.write();
		let c = t
			.configs
			.get_mut(&id)
			.ok_or_else(|| Error::not_found(format!("config {id}")))?;
		c.downloaded_at.get_or_insert(at);
		Ok(())
	}

	fn purge_configs_expired_before(&self, cutoff: DateTime<Utc>) -> usize {
		let mut t = self.tables.write();
		let before = t.configs.len();
		t.configs.retain(|_, c| c.expires_at >= cutoff);
		before - t.configs.len()
	}

	fn append_audit(&self, kind: AuditKind, detail: String) {
		self.tables.write().audit.push(AuditEvent {
			at: Utc::now(),
			kind,
			detail,
		});
	}

	fn audit(&self) -> Vec<AuditEvent> {
		self.tables.read().audit.clone()
	}

	fn prune_audit_before(&self, cutoff: DateTime<Utc>) -> usize {
		let mut t = self.tables.write();
		let before = t.audit.len();
		t.audit.retain(|e| e.at >= cutoff);
		before - t.audit.len()
	}
}
