//! VPN exec-hook handlers. The daemon invokes this binary as a short-lived
//! child for each event; hooks cannot share memory with the agent, so
//! connect/disconnect publish through the drop directory and everything
//! else goes straight to the control plane.

use std::net::IpAddr;
use std::path::Path;

use chrono::Utc;
use tracing::{info, warn};
use warden_core::error::{Error, Result};
use warden_core::proto::ConnectedClient;

use crate::config::AgentConfig;
use crate::control::ControlClient;
use crate::dropdir;

/// What OpenVPN hands a connect/disconnect hook through the environment.
#[derive(Debug, Clone)]
pub struct HookContext {
	pub email: String,
	pub tunnel_ip: IpAddr,
	pub client_ip: String,
}

impl HookContext {
	/// Strict parse: a malformed identity or address is rejected, never
	/// substituted.
	pub fn parse(
		email: Option<String>,
		tunnel_ip: Option<String>,
		client_ip: Option<String>,
	) -> Result<Self> {
		let email = email
			.filter(|e| !e.is_empty())
			.ok_or_else(|| Error::invalid("hook invoked without a client identity"))?;
		let tunnel_ip = tunnel_ip
			.ok_or_else(|| Error::invalid("hook invoked without a tunnel address"))?
			.parse::<IpAddr>()
			.map_err(|e| Error::invalid(format!("malformed tunnel address: {e}")))?;
		Ok(HookContext {
			email,
			tunnel_ip,
			client_ip: client_ip.unwrap_or_default(),
		})
	}

	pub fn from_env() -> Result<Self> {
		let get = |name: &str| std::env::var(name).ok();
		// `username` is what auth-user-pass put on the session; the cert CN
		// carries the same email.
		Self::parse(
			get("username").or_else(|| get("common_name")),
			get("ifconfig_pool_remote_ip"),
			get("untrusted_ip"),
		)
	}
}

fn client(cfg: &AgentConfig) -> Result<ControlClient> {
	ControlClient::new(&cfg.control_url, &cfg.token, cfg.request_timeout())
		.map_err(|e| Error::internal(format!("build control client: {e}")))
}

/// auth-user-pass-verify (via-file): first line username, second line the
/// per-config auth token. Exit 0 accepts the session, anything else denies.
/// Fails closed when the control plane is unreachable.
pub async fn auth_user_pass_verify(cfg: &AgentConfig, credentials_file: &Path) -> i32 {
	let (username, password) = match read_credentials(credentials_file) {
		Ok(parts) => parts,
		Err(e) => {
			warn!("unreadable credentials file: {e}");
			return 1;
		},
	};
	let control = match client(cfg) {
		Ok(c) => c,
		Err(e) => {
			warn!("auth verify unavailable: {e}");
			return 1;
		},
	};
	match control.verify_client(&username, &password).await {
		Ok(true) => {
			info!(user = %username, "auth verified");
			0
		},
		Ok(false) => {
			info!(user = %username, "auth denied");
			1
		},
		Err(e) => {
			warn!(user = %username, "auth verify failed, denying: {e}");
			1
		},
	}
}

pub(crate) fn read_credentials(path: &Path) -> Result<(String, String)> {
	let raw =
		fs_err::read_to_string(path).map_err(|e| Error::internal(format!("read {e}")))?;
	let mut lines = raw.lines();
	let username = lines
		.next()
		.ok_or_else(|| Error::invalid("credentials file is empty"))?;
	let password = lines
		.next()
		.ok_or_else(|| Error::invalid("credentials file has no password line"))?;
	Ok((username.to_string(), password.to_string()))
}

/// client-connect: notify the control plane, then publish the client record
/// for the agent's reconciler. Unknown identities deny the connection.
pub async fn client_connect(cfg: &AgentConfig, ctx: &HookContext) -> i32 {
	let control = match client(cfg) {
		Ok(c) => c,
		Err(e) => {
			warn!("client-connect unavailable: {e}");
			return 1;
		},
	};
	let info = match control.client_info(&ctx.email).await {
		Ok(info) => info,
		Err(e) => {
			warn!(user = %ctx.email, "no identity for connecting client, denying: {e}");
			return 1;
		},
	};
	// Advisory; rule installation is driven by the drop file below.
	if let Err(e) = control
		.client_connected(info.user_id, &ctx.client_ip, ctx.tunnel_ip)
		.await
	{
		warn!(user = %ctx.email, "connect event not delivered: {e}");
	}
	let record = ConnectedClient {
		vpn_ip: ctx.tunnel_ip,
		user_id: info.user_id,
		user_email: info.email,
		groups: info.groups,
		connected_at: Utc::now(),
	};
	if let Err(e) = dropdir::write_client(&cfg.drop_dir, &record) {
		warn!(user = %ctx.email, "could not publish client record, denying: {e}");
		return 1;
	}
	info!(user = %ctx.email, tunnel_ip = %ctx.tunnel_ip, "client connected");
	0
}

/// client-disconnect: notify the control plane and retract the record. The
/// reconciler removes the firewall rules within one refresh interval.
pub async fn client_disconnect(cfg: &AgentConfig, ctx: &HookContext) -> i32 {
	// The published record carries the user id; fall back to a lookup when
	// the file is already gone.
	let user_id = dropdir::scan(&cfg.drop_dir)
		.ok()
		.and_then(|m| m.get(&ctx.tunnel_ip).map(|c| c.user_id));

	if let Ok(control) = client(cfg) {
		let user_id = match user_id {
			Some(id) => Some(id),
			None => control.client_info(&ctx.email).await.ok().map(|i| i.user_id),
		};
		if let Some(user_id) = user_id {
			if let Err(e) = control.client_disconnected(user_id, ctx.tunnel_ip).await {
				warn!(user = %ctx.email, "disconnect event not delivered: {e}");
			}
		}
	}
	if let Err(e) = dropdir::remove_client(&cfg.drop_dir, ctx.tunnel_ip) {
		warn!(user = %ctx.email, "could not retract client record: {e}");
		return 1;
	}
	info!(user = %ctx.email, tunnel_ip = %ctx.tunnel_ip, "client disconnected");
	0
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn context_rejects_malformed_input() {
		assert!(HookContext::parse(None, Some("10.8.0.42".into()), None).is_err());
		assert!(
			HookContext::parse(Some("u@x.test".into()), Some("not-an-ip".into()), None).is_err()
		);
		assert!(HookContext::parse(Some("u@x.test".into()), None, None).is_err());

		let ctx = HookContext::parse(
			Some("u@x.test".into()),
			Some("10.8.0.42".into()),
			Some("198.51.100.7".into()),
		)
		.unwrap();
		assert_eq!(ctx.tunnel_ip.to_string(), "10.8.0.42");
	}

	#[test]
	fn credentials_file_layout() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("creds");
		std::fs::write(&path, "u@x.test\ntok-123\n").unwrap();
		let (user, pass) = read_credentials(&path).unwrap();
		assert_eq!(user, "u@x.test");
		assert_eq!(pass, "tok-123");

		std::fs::write(&path, "only-user\n").unwrap();
		assert!(read_credentials(&path).is_err());
	}
}
