//! Client-facing API: session auth, config generate/download/revoke and the
//! password-verify hook contract through a revocation lifecycle.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use gatewarden::api::{self, AppState};
use gatewarden::pki::rotation;
use gatewarden::store::{MemStore, Store};
use gatewarden::types::{IdentityAssertion, Tenant};
use gatewarden::Settings;
use http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

struct Harness {
	app: Router,
	store: Arc<MemStore>,
	tenant: Tenant,
	session: String,
}

async fn harness() -> Harness {
	let store = Arc::new(MemStore::new());
	let settings = Arc::new(Settings::default());
	rotation::ensure_root(store.as_ref(), &settings).unwrap();

	let tenant = Tenant::new("gw-1", "vpn.example.com");
	store.create_tenant(tenant.clone()).unwrap();
	store
		.record_heartbeat(tenant.id, None, chrono::Utc::now())
		.unwrap();

	let app = api::router(AppState::new(store.clone(), settings));

	// Broker asserts the login; we get a session cookie value back.
	let (status, body) = post(&app, None, "/auth/session", json!({
		"externalId": "ext-1",
		"provider": "oidc",
		"email": "u@x.test",
		"groups": ["eng"],
	}))
	.await;
	assert_eq!(status, StatusCode::OK);
	let session = body["session"].as_str().unwrap().to_string();

	let user = store.user_by_email("u@x.test").unwrap();
	store.bind_user_tenant(user.id, tenant.id).unwrap();

	Harness {
		app,
		store,
		tenant,
		session,
	}
}

async fn request(
	app: &Router,
	method: &str,
	session: Option<&str>,
	path: &str,
	body: Option<Value>,
) -> (StatusCode, Vec<u8>, http::HeaderMap) {
	let mut builder = Request::builder().method(method).uri(path);
	if let Some(session) = session {
		builder = builder.header(header::COOKIE, format!("session={session}"));
	}
	let request = match body {
		Some(body) => builder
			.header(header::CONTENT_TYPE, "application/json")
			.body(Body::from(serde_json::to_vec(&body).unwrap()))
			.unwrap(),
		None => builder.body(Body::empty()).unwrap(),
	};
	let response = app.clone().oneshot(request).await.unwrap();
	let status = response.status();
	let headers = response.headers().clone();
	let bytes = response.into_body().collect().await.unwrap().to_bytes();
	(status, bytes.to_vec(), headers)
}

async fn post(
	app: &Router,
	session: Option<&str>,
	path: &str,
	body: Value,
) -> (StatusCode, Value) {
	let (status, bytes, _) = request(app, "POST", session, path, Some(body)).await;
	let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
	(status, value)
}

#[tokio::test]
async fn generate_download_revoke_lifecycle() {
	let h = harness().await;

	let (status, body) = post(
		&h.app,
		Some(&h.session),
		"/configs/generate",
		json!({"tenantId": h.tenant.id}),
	)
	.await;
	assert_eq!(status, StatusCode::OK, "{body}");
	let id = body["id"].as_str().unwrap().to_string();
	assert_eq!(body["filename"], json!("gw-1-u-x-test.ovpn"));
	let blob = body["config"].as_str().unwrap();
	assert!(blob.starts_with("client\n"));

	// Download carries the profile content type and the blob verbatim.
	let (status, bytes, headers) = request(
		&h.app,
		"GET",
		Some(&h.session),
		&format!("/configs/{id}/download"),
		None,
	)
	.await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(
		headers.get(header::CONTENT_TYPE).unwrap(),
		"application/x-openvpn-profile"
	);
	assert_eq!(bytes, blob.as_bytes());

	// Extract the embedded auth token and check the verify contract.
	let config = h.store.config(id.parse().unwrap()).unwrap();
	let (status, body) = post(&h.app, None, "/tenant/verify-client", json!({
		"token": h.tenant.api_token,
		"clientEmail": "u@x.test",
		"authToken": config.auth_token,
	}))
	.await;
	assert_eq!(status, StatusCode::OK, "{body}");
	assert_eq!(body["ok"], json!(true));

	// Revoke, then the token is gone and stays gone.
	let (status, body) = post(
		&h.app,
		Some(&h.session),
		&format!("/configs/{id}/revoke"),
		json!({}),
	)
	.await;
	assert_eq!(status, StatusCode::OK, "{body}");

	let (status, _) = post(&h.app, None, "/tenant/verify-client", json!({
		"token": h.tenant.api_token,
		"clientEmail": "u@x.test",
		"authToken": config.auth_token,
	}))
	.await;
	assert_eq!(status, StatusCode::GONE);

	// Second revoke: not found or already revoked.
	let (status, _) = post(
		&h.app,
		Some(&h.session),
		&format!("/configs/{id}/revoke"),
		json!({}),
	)
	.await;
	assert_eq!(status, StatusCode::NOT_FOUND);

	// Download of a revoked config is 410 with the reason.
	let (status, bytes, _) = request(
		&h.app,
		"GET",
		Some(&h.session),
		&format!("/configs/{id}/download"),
		None,
	)
	.await;
	assert_eq!(status, StatusCode::GONE);
	let body: Value = serde_json::from_slice(&bytes).unwrap();
	assert!(
		body["message"]
			.as_str()
			.unwrap()
			.contains("user request")
	);
}

#[tokio::test]
async fn tenants_lists_only_bound_tenants() {
	let h = harness().await;
	let other = Tenant::new("gw-2", "vpn2.example.com");
	h.store.create_tenant(other).unwrap();

	let (status, bytes, _) = request(&h.app, "GET", Some(&h.session), "/tenants", None).await;
	assert_eq!(status, StatusCode::OK);
	let tenants: Value = serde_json::from_slice(&bytes).unwrap();
	let names: Vec<&str> = tenants
		.as_array()
		.unwrap()
		.iter()
		.map(|t| t["name"].as_str().unwrap())
		.collect();
	assert_eq!(names, vec!["gw-1"]);
}

#[tokio::test]
async fn session_is_required() {
	let h = harness().await;
	let (status, _, _) = request(&h.app, "GET", None, "/tenants", None).await;
	assert_eq!(status, StatusCode::UNAUTHORIZED);

	let (status, _, _) = request(&h.app, "GET", Some("forged"), "/tenants", None).await;
	assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn foreign_config_is_forbidden() {
	let h = harness().await;
	let (_, body) = post(
		&h.app,
		Some(&h.session),
		"/configs/generate",
		json!({"tenantId": h.tenant.id}),
	)
	.await;
	let id = body["id"].as_str().unwrap().to_string();

	// A second user with their own session but no claim on the config.
	let (_, body) = post(&h.app, None, "/auth/session", json!({
		"externalId": "ext-2",
		"provider": "oidc",
		"email": "other@x.test",
		"groups": [],
	}))
	.await;
	let other_session = body["session"].as_str().unwrap().to_string();

	let (status, _, _) = request(
		&h.app,
		"GET",
		Some(&other_session),
		&format!("/configs/{id}/download"),
		None,
	)
	.await;
	assert_eq!(status, StatusCode::FORBIDDEN);

	let (status, _) = post(
		&h.app,
		Some(&other_session),
		&format!("/configs/{id}/revoke"),
		json!({}),
	)
	.await;
	assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn unknown_config_is_404() {
	let h = harness().await;
	let id = uuid::Uuid::new_v4();
	let (status, _, _) = request(
		&h.app,
		"GET",
		Some(&h.session),
		&format!("/configs/{id}/download"),
		None,
	)
	.await;
	assert_eq!(status, StatusCode::NOT_FOUND);
}
