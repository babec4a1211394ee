//! HTTP surface of the control plane.
//!
//! Two faces: tenant endpoints authenticated by an opaque bearer token
//! carried in the request body, and client endpoints authenticated by a
//! web-session cookie. Error kinds map onto status codes here and nowhere
//! else.

use std::sync::Arc;

use axum::Router;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use http::StatusCode;
use warden_core::error::{Error, Kind};

use crate::Settings;
use crate::store::Store;

mod client;
mod tenant;

#[derive(Clone)]
pub struct AppState {
	pub store: Arc<dyn Store>,
	pub settings: Arc<Settings>,
}

impl AppState {
	pub fn new(store: Arc<dyn Store>, settings: Arc<Settings>) -> Self {
		AppState { store, settings }
	}
}

pub fn router(state: AppState) -> Router {
	Router::new()
		.route("/healthz", get(healthz))
		.route("/tenant/heartbeat", post(tenant::heartbeat))
		.route("/tenant/provision", post(tenant::provision))
		.route("/tenant/client-rules", post(tenant::client_rules))
		.route("/tenant/all-client-rules", post(tenant::all_client_rules))
		.route("/tenant/client-connected", post(tenant::client_connected))
		.route(
			"/tenant/client-disconnected",
			post(tenant::client_disconnected),
		)
		.route("/tenant/client-info", post(tenant::client_info))
		.route("/tenant/verify-client", post(tenant::verify_client))
		.route("/tenant/trust-bundle", post(tenant::trust_bundle))
		.route("/tenant/spokes", post(tenant::create_spoke))
		.route("/spoke/heartbeat", post(tenant::spoke_heartbeat))
		.route("/auth/session", post(client::create_session))
		.route("/tenants", get(client::list_tenants))
		.route("/configs/generate", post(client::generate_config))
		.route("/configs/{id}/download", get(client::download_config))
		.route("/configs/{id}/revoke", post(client::revoke_config))
		.with_state(state)
}

async fn healthz() -> &'static str {
	"ok"
}

/// Boundary wrapper: carries the taxonomy kind out as a status code without
/// losing the kind along the way.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
	fn from(e: Error) -> Self {
		ApiError(e)
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let status = match self.0.kind() {
			Kind::NotFound => StatusCode::NOT_FOUND,
			Kind::Conflict => StatusCode::CONFLICT,
			Kind::Unauthorized => StatusCode::UNAUTHORIZED,
			Kind::Forbidden => StatusCode::FORBIDDEN,
			Kind::Gone => StatusCode::GONE,
			Kind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
			Kind::Invalid => StatusCode::BAD_REQUEST,
			Kind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
		};
		if status == StatusCode::INTERNAL_SERVER_ERROR {
			tracing::error!(error = %self.0, "internal error serving request");
		}
		let body = axum::Json(serde_json::json!({
			"error": self.0.kind,
			"message": self.0.message,
		}));
		(status, body).into_response()
	}
}

/// Resolve the bearer token carried in a tenant request body. The error is
/// identical for unknown and revoked tokens.
fn authenticate_tenant(
	store: &dyn Store,
	token: &str,
) -> Result<crate::types::Tenant, ApiError> {
	store
		.tenant_by_token(token)
		.ok_or_else(|| ApiError(Error::unauthorized("invalid token")))
}

/// Resolve the session cookie on a client request.
fn authenticate_session(
	store: &dyn Store,
	headers: &http::HeaderMap,
) -> Result<crate::types::User, ApiError> {
	let cookie = headers
		.get(http::header::COOKIE)
		.and_then(|v| v.to_str().ok())
		.unwrap_or("");
	let token = cookie
		.split(';')
		.filter_map(|part| part.trim().split_once('='))
		.find(|(name, _)| *name == "session")
		.map(|(_, value)| value);
	let token = token.ok_or_else(|| ApiError(Error::unauthorized("missing session")))?;
	store
		.user_by_session(token)
		.ok_or_else(|| ApiError(Error::unauthorized("invalid session")))
}
