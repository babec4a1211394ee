//! Tenant-facing provisioning protocol: heartbeat, provision, client-rules
//! and advisory connect/disconnect events.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::State;
use chrono::Utc;
use tracing::{debug, info, warn};
use warden_core::error::Error;
use warden_core::proto::{
	Ack, AllClientRulesRequest, AllClientRulesResponse, ClientConnectedRequest,
	ClientDisconnectedRequest, ClientInfoRequest, ClientInfoResponse, ClientRulesRequest,
	ClientRulesResponse, HeartbeatRequest, HeartbeatResponse, ProvisionRequest,
	ProvisionResponse, ReprovisionReason, SpokeCreateRequest, SpokeCreateResponse,
	SpokeHeartbeatRequest, SpokeHeartbeatResponse, TrustBundleResponse, VerifyClientRequest,
};

use super::{ApiError, AppState, authenticate_tenant};
use crate::pki::rotation;
use crate::types::Tenant;
use crate::{drift, policy, registry, spokes};

/// Liveness plus drift detection. A remote reporting an empty version is
/// new; it provisions on its own and is not flagged as drifted.
pub(super) async fn heartbeat(
	State(state): State<AppState>,
	Json(req): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, ApiError> {
	let tenant = authenticate_tenant(state.store.as_ref(), &req.token)?;
	state
		.store
		.record_heartbeat(tenant.id, req.status_message.clone(), Utc::now())?;
	let root = rotation::active_root(state.store.as_ref())?;

	let expected = drift::config_version(&tenant);
	let (needs_reprovision, reason) = if req.config_version.is_empty() {
		(false, Some(ReprovisionReason::New))
	} else if req.config_version != expected {
		(true, Some(ReprovisionReason::Drift))
	} else {
		(false, None)
	};
	if needs_reprovision {
		info!(
			tenant = %tenant.name,
			remote = %req.config_version,
			expected = %expected,
			"heartbeat observed config drift"
		);
	} else {
		debug!(
			tenant = %tenant.name,
			clients = req.connected_clients,
			spokes = req.connected_spokes.unwrap_or(0),
			"heartbeat"
		);
	}

	Ok(Json(HeartbeatResponse {
		ok: true,
		needs_reprovision,
		reason,
		config_version: expected,
		root_ca_fingerprint: root.fingerprint,
	}))
}

/// Hand the remote everything it needs to run: trust bundle, server
/// identity, tls-auth material and listener parameters. Auto-provisions a
/// missing or rotated-away Sub-CA, so a remote can always recover by
/// replaying this call.
pub(super) async fn provision(
	State(state): State<AppState>,
	Json(req): Json<ProvisionRequest>,
) -> Result<Json<ProvisionResponse>, ApiError> {
	let tenant = authenticate_tenant(state.store.as_ref(), &req.token)?;
	rotation::active_root(state.store.as_ref())?;

	let (tenant, regenerated) =
		rotation::ensure_tenant_sub_ca(state.store.as_ref(), &state.settings, tenant.id)?;
	let tenant = rotation::ensure_tls_auth_key(state.store.as_ref(), &tenant)?;
	if regenerated {
		info!(tenant = %tenant.name, "provision regenerated tenant PKI");
	}

	let server_cert = tenant
		.server_cert
		.clone()
		.ok_or_else(|| Error::internal("tenant has no server cert after provisioning"))?;
	let server_key = tenant
		.server_key
		.clone()
		.ok_or_else(|| Error::internal("tenant has no server key after provisioning"))?;

	Ok(Json(ProvisionResponse {
		full_ca_chain: rotation::trust_bundle_pem(state.store.as_ref()),
		server_cert,
		server_key,
		tls_auth_enabled: tenant.tls_auth_enabled,
		tls_auth_key: tenant.tls_auth_key.clone(),
		vpn_port: tenant.vpn_port,
		vpn_protocol: tenant.vpn_protocol,
		vpn_subnet: tenant.vpn_subnet,
		crypto_profile: tenant.crypto_profile,
		config_version: drift::config_version(&tenant),
	}))
}

fn rules_for_email(state: &AppState, tenant: &Tenant, email: &str) -> ClientRulesResponse {
	// Unknown or deactivated users compile to deny-all rather than erroring
	// the whole refresh on the gateway.
	let rules = match state.store.user_by_email(email) {
		Some(user) => policy::compile(state.store.as_ref(), &user, tenant.id).destinations,
		None => {
			warn!(tenant = %tenant.name, email, "rules requested for unknown user");
			Vec::new()
		},
	};
	ClientRulesResponse { rules }
}

pub(super) async fn client_rules(
	State(state): State<AppState>,
	Json(req): Json<ClientRulesRequest>,
) -> Result<Json<ClientRulesResponse>, ApiError> {
	let tenant = authenticate_tenant(state.store.as_ref(), &req.token)?;
	Ok(Json(rules_for_email(&state, &tenant, &req.client_email)))
}

pub(super) async fn all_client_rules(
	State(state): State<AppState>,
	Json(req): Json<AllClientRulesRequest>,
) -> Result<Json<AllClientRulesResponse>, ApiError> {
	let tenant = authenticate_tenant(state.store.as_ref(), &req.token)?;
	let mut client_rules = BTreeMap::new();
	for email in req.clients {
		let rules = rules_for_email(&state, &tenant, &email).rules;
		client_rules.insert(email, rules);
	}
	Ok(Json(AllClientRulesResponse { client_rules }))
}

pub(super) async fn client_connected(
	State(state): State<AppState>,
	Json(req): Json<ClientConnectedRequest>,
) -> Result<Json<Ack>, ApiError> {
	let tenant = authenticate_tenant(state.store.as_ref(), &req.token)?;
	info!(
		tenant = %tenant.name,
		user_id = %req.user_id,
		tunnel_ip = %req.tunnel_ip,
		client_ip = %req.client_ip,
		"client connected"
	);
	Ok(Json(Ack { ok: true }))
}

pub(super) async fn client_disconnected(
	State(state): State<AppState>,
	Json(req): Json<ClientDisconnectedRequest>,
) -> Result<Json<Ack>, ApiError> {
	let tenant = authenticate_tenant(state.store.as_ref(), &req.token)?;
	info!(
		tenant = %tenant.name,
		user_id = %req.user_id,
		tunnel_ip = %req.tunnel_ip,
		"client disconnected"
	);
	Ok(Json(Ack { ok: true }))
}

/// Identity lookup for connect hooks: the VPN daemon only knows the email
/// from the cert CN; the hook needs the user id and groups to publish a
/// connected-client record.
pub(super) async fn client_info(
	State(state): State<AppState>,
	Json(req): Json<ClientInfoRequest>,
) -> Result<Json<ClientInfoResponse>, ApiError> {
	authenticate_tenant(state.store.as_ref(), &req.token)?;
	let user = state
		.store
		.user_by_email(&req.client_email)
		.filter(|u| u.is_active)
		.ok_or_else(|| Error::not_found(format!("user {}", req.client_email)))?;
	Ok(Json(ClientInfoResponse {
		user_id: user.id,
		email: user.email,
		groups: user.groups,
	}))
}

/// Password-verify backend for the VPN daemon: the auth token must resolve
/// to a live config owned by the presented identity.
pub(super) async fn verify_client(
	State(state): State<AppState>,
	Json(req): Json<VerifyClientRequest>,
) -> Result<Json<Ack>, ApiError> {
	let tenant = authenticate_tenant(state.store.as_ref(), &req.token)?;
	let (user_id, _) = registry::by_auth_token(state.store.as_ref(), &req.auth_token, Utc::now())?;
	let user = state.store.user(user_id)?;
	if !user.is_active || user.email != req.client_email {
		warn!(
			tenant = %tenant.name,
			email = %req.client_email,
			"auth token does not match presented identity"
		);
		return Err(Error::unauthorized("identity mismatch").into());
	}
	Ok(Json(Ack { ok: true }))
}

/// Hub-authenticated spoke provisioning: allocate a tunnel address from the
/// hub's subnet, issue a client identity under its Sub-CA, and hand back the
/// spoke's own bearer token.
pub(super) async fn create_spoke(
	State(state): State<AppState>,
	Json(req): Json<SpokeCreateRequest>,
) -> Result<Json<SpokeCreateResponse>, ApiError> {
	let hub = authenticate_tenant(state.store.as_ref(), &req.token)?;
	if req.name.is_empty() {
		return Err(Error::invalid("spoke has no name").into());
	}
	let spoke = spokes::create(
		state.store.as_ref(),
		&state.settings,
		hub.id,
		&req.name,
		req.local_networks,
	)?;
	Ok(Json(SpokeCreateResponse {
		id: spoke.id,
		name: spoke.name,
		tunnel_ip: spoke.tunnel_ip,
		client_cert: spoke.client_cert,
		client_key: spoke.client_key,
		token: spoke.token,
		ca_chain: rotation::trust_bundle_pem(state.store.as_ref()),
	}))
}

/// Spoke liveness, authenticated by the spoke's own token. First heartbeat
/// flips `pending` to `connected`; the janitor flips it back after the miss
/// threshold.
pub(super) async fn spoke_heartbeat(
	State(state): State<AppState>,
	Json(req): Json<SpokeHeartbeatRequest>,
) -> Result<Json<SpokeHeartbeatResponse>, ApiError> {
	let spoke = spokes::heartbeat(state.store.as_ref(), &req.token)?;
	if let Some(status_message) = &req.status_message {
		debug!(spoke = %spoke.name, status_message, "spoke heartbeat");
	}
	Ok(Json(SpokeHeartbeatResponse {
		ok: true,
		status: spoke.status.to_string(),
	}))
}

pub(super) async fn trust_bundle(
	State(state): State<AppState>,
	Json(req): Json<ProvisionRequest>,
) -> Result<Json<TrustBundleResponse>, ApiError> {
	authenticate_tenant(state.store.as_ref(), &req.token)?;
	let root = rotation::active_root(state.store.as_ref())?;
	Ok(Json(TrustBundleResponse {
		bundle: rotation::trust_bundle_pem(state.store.as_ref()),
		root_ca_fingerprint: root.fingerprint,
	}))
}
