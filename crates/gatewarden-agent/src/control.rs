//! HTTP client for the control plane. Every call carries the tenant token
//! in the body and a hard per-call deadline; HTTP status codes map back
//! into the shared error taxonomy without loss.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;
use warden_core::error::{Error, Kind, Result};
use warden_core::proto::{
	Ack, AllClientRulesRequest, AllClientRulesResponse, AllowedDestination,
	ClientConnectedRequest, ClientDisconnectedRequest, ClientInfoRequest, ClientInfoResponse,
	ClientRulesRequest, ClientRulesResponse, HeartbeatRequest, HeartbeatResponse,
	ProvisionRequest, ProvisionResponse, VerifyClientRequest,
};

pub struct ControlClient {
	http: reqwest::Client,
	base_url: String,
	token: String,
}

fn kind_for_status(status: reqwest::StatusCode) -> Kind {
	match status.as_u16() {
		400 => Kind::Invalid,
		401 => Kind::Unauthorized,
		403 => Kind::Forbidden,
		404 => Kind::NotFound,
		409 => Kind::Conflict,
		410 => Kind::Gone,
		503 => Kind::Unavailable,
		_ => Kind::Internal,
	}
}

impl ControlClient {
	pub fn new(base_url: &str, token: &str, timeout: Duration) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder().timeout(timeout).build()?;
		Ok(ControlClient {
			http,
			base_url: base_url.trim_end_matches('/').to_string(),
			token: token.to_string(),
		})
	}

	async fn post<Req: Serialize, Resp: DeserializeOwned>(
		&self,
		path: &str,
		request: &Req,
	) -> Result<Resp> {
		let url = format!("{}{}", self.base_url, path);
		let response = self
			.http
			.post(&url)
			.json(request)
			.send()
			.await
			.map_err(|e| Error::unavailable(format!("{path}: {e}")))?;
		let status = response.status();
		if status.is_success() {
			return response
				.json()
				.await
				.map_err(|e| Error::internal(format!("{path}: decode response: {e}")));
		}
		// The control plane ships {error, message}; keep the message but
		// derive the kind from the status so nothing is lost in transit.
		let body: serde_json::Value = response.json().await.unwrap_or_default();
		let message = body["message"]
			.as_str()
			.map(str::to_string)
			.unwrap_or_else(|| format!("{path}: http {status}"));
		Err(Error::new(kind_for_status(status), message))
	}

	pub async fn heartbeat(
		&self,
		connected_clients: u32,
		status: Option<String>,
		status_message: Option<String>,
		config_version: &str,
	) -> Result<HeartbeatResponse> {
		self
			.post(
				"/tenant/heartbeat",
				&HeartbeatRequest {
					token: self.token.clone(),
					status,
					status_message,
					connected_clients,
					connected_spokes: None,
					config_version: config_version.to_string(),
				},
			)
			.await
	}

	pub async fn provision(&self) -> Result<ProvisionResponse> {
		self
			.post(
				"/tenant/provision",
				&ProvisionRequest {
					token: self.token.clone(),
				},
			)
			.await
	}

	pub async fn client_rules(&self, client_email: &str) -> Result<Vec<AllowedDestination>> {
		let response: ClientRulesResponse = self
			.post(
				"/tenant/client-rules",
				&ClientRulesRequest {
					token: self.token.clone(),
					client_email: client_email.to_string(),
				},
			)
			.await?;
		Ok(response.rules)
	}

	pub async fn all_client_rules(
		&self,
		clients: Vec<String>,
	) -> Result<BTreeMap<String, Vec<AllowedDestination>>> {
		let response: AllClientRulesResponse = self
			.post(
				"/tenant/all-client-rules",
				&AllClientRulesRequest {
					token: self.token.clone(),
					clients,
				},
			)
			.await?;
		Ok(response.client_rules)
	}

	pub async fn client_info(&self, client_email: &str) -> Result<ClientInfoResponse> {
		self
			.post(
				"/tenant/client-info",
				&ClientInfoRequest {
					token: self.token.clone(),
					client_email: client_email.to_string(),
				},
			)
			.await
	}

	pub async fn client_connected(
		&self,
		user_id: Uuid,
		client_ip: &str,
		tunnel_ip: IpAddr,
	) -> Result<()> {
		let _: Ack = self
			.post(
				"/tenant/client-connected",
				&ClientConnectedRequest {
					token: self.token.clone(),
					user_id,
					client_ip: client_ip.to_string(),
					tunnel_ip,
				},
			)
			.await?;
		Ok(())
	}

	pub async fn client_disconnected(&self, user_id: Uuid, tunnel_ip: IpAddr) -> Result<()> {
		let _: Ack = self
			.post(
				"/tenant/client-disconnected",
				&ClientDisconnectedRequest {
					token: self.token.clone(),
					user_id,
					tunnel_ip,
				},
			)
			.await?;
		Ok(())
	}

	/// Used by the auth-user-pass-verify hook: true means the presented
	/// email/auth-token pair maps to a live issued config.
	pub async fn verify_client(&self, client_email: &str, auth_token: &str) -> Result<bool> {
		let result: Result<Ack> = self
			.post(
				"/tenant/verify-client",
				&VerifyClientRequest {
					token: self.token.clone(),
					client_email: client_email.to_string(),
					auth_token: auth_token.to_string(),
				},
			)
			.await;
		match result {
			Ok(ack) => Ok(ack.ok),
			Err(e) if matches!(e.kind(), Kind::Unauthorized | Kind::Gone | Kind::NotFound) => {
				Ok(false)
			},
			Err(e) => Err(e),
		}
	}
}
