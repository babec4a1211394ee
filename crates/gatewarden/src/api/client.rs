//! Client-facing surface: session bootstrap from the identity broker, the
//! tenant list, and config generate/download/revoke.

use axum::Json;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use http::{HeaderMap, StatusCode, header};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use warden_core::error::Error;
use warden_core::proto::Ack;

use super::{ApiError, AppState, authenticate_session};
use crate::types::{IdentityAssertion, IssuedConfig, TenantStatus, User};
use crate::{registry, vpnconfig};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
	pub session: String,
}

/// Trusted seam to the external identity broker: it posts the outcome of a
/// successful login and receives a session cookie value. Users are upserted
/// on every assertion; groups replace wholesale.
pub(super) async fn create_session(
	State(state): State<AppState>,
	Json(assertion): Json<IdentityAssertion>,
) -> Result<Json<SessionResponse>, ApiError> {
	if assertion.email.is_empty() {
		return Err(Error::invalid("assertion has no email").into());
	}
	let user = state.store.upsert_user(assertion);
	let session = state.store.create_session(user.id);
	Ok(Json(SessionResponse { session }))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantSummary {
	pub id: Uuid,
	pub name: String,
	pub public_endpoint: String,
	pub status: TenantStatus,
}

pub(super) async fn list_tenants(
	State(state): State<AppState>,
	headers: HeaderMap,
) -> Result<Json<Vec<TenantSummary>>, ApiError> {
	let user = authenticate_session(state.store.as_ref(), &headers)?;
	let tenants = state
		.store
		.tenants_for_user(&user)
		.into_iter()
		.map(|t| TenantSummary {
			id: t.id,
			name: t.name,
			public_endpoint: t.public_endpoint,
			status: t.status,
		})
		.collect();
	Ok(Json(tenants))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
	pub tenant_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
	pub id: Uuid,
	pub filename: String,
	pub config: String,
	pub expires_at: DateTime<Utc>,
}

pub(super) async fn generate_config(
	State(state): State<AppState>,
	headers: HeaderMap,
	Json(req): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, ApiError> {
	let user = authenticate_session(state.store.as_ref(), &headers)?;
	let config = vpnconfig::generate(
		state.store.as_ref(),
		&state.settings,
		&user,
		req.tenant_id,
	)?;
	let tenant = state.store.tenant(req.tenant_id)?;
	Ok(Json(GenerateResponse {
		id: config.id,
		filename: vpnconfig::filename(&tenant, &user),
		config: config.config_blob,
		expires_at: config.expires_at,
	}))
}

fn owned_config(
	state: &AppState,
	user: &User,
	id: Uuid,
) -> Result<IssuedConfig, ApiError> {
	let config = registry::get(state.store.as_ref(), id, Utc::now())?;
	if config.user_id != user.id && !user.is_admin {
		return Err(Error::forbidden("config belongs to another user").into());
	}
	Ok(config)
}

pub(super) async fn download_config(
	State(state): State<AppState>,
	headers: HeaderMap,
	Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
	let user = authenticate_session(state.store.as_ref(), &headers)?;
	let config = owned_config(&state, &user, id)?;
	let tenant = state.store.tenant(config.tenant_id)?;
	state.store.mark_downloaded(config.id, Utc::now())?;

	let filename = vpnconfig::filename(&tenant, &user);
	let response = (
		StatusCode::OK,
		[
			(
				header::CONTENT_TYPE,
				"application/x-openvpn-profile".to_string(),
			),
			(
				header::CONTENT_DISPOSITION,
				format!("attachment; filename=\"{filename}\""),
			),
		],
		config.config_blob,
	)
		.into_response();
	Ok(response)
}

pub(super) async fn revoke_config(
	State(state): State<AppState>,
	headers: HeaderMap,
	Path(id): Path<Uuid>,
) -> Result<Json<Ack>, ApiError> {
	let user = authenticate_session(state.store.as_ref(), &headers)?;
	// Ownership is checked against the raw record: revoking an expired (but
	// existing) config is allowed and idempotent revocation reports cleanly.
	let config = state.store.config(id)?;
	if config.user_id != user.id && !user.is_admin {
		return Err(Error::forbidden("config belongs to another user").into());
	}
	registry::revoke(state.store.as_ref(), id, "user request")?;
	Ok(Json(Ack { ok: true }))
}
