//! Persistent entities owned by the store.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use warden_core::proto::{CryptoProfile, PortRange, Protocol, RuleType, VpnProtocol};

/// Key algorithm used for a tenant's PKI material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyAlgorithm {
	#[default]
	EcdsaP256,
	EcdsaP384,
	Rsa2048,
	Rsa3072,
	Rsa4096,
}

impl fmt::Display for KeyAlgorithm {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			KeyAlgorithm::EcdsaP256 => "ecdsa-p256",
			KeyAlgorithm::EcdsaP384 => "ecdsa-p384",
			KeyAlgorithm::Rsa2048 => "rsa-2048",
			KeyAlgorithm::Rsa3072 => "rsa-3072",
			KeyAlgorithm::Rsa4096 => "rsa-4096",
		};
		write!(f, "{s}")
	}
}

impl FromStr for KeyAlgorithm {
	type Err = warden_core::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"ecdsa-p256" => Ok(KeyAlgorithm::EcdsaP256),
			"ecdsa-p384" => Ok(KeyAlgorithm::EcdsaP384),
			"rsa-2048" => Ok(KeyAlgorithm::Rsa2048),
			"rsa-3072" => Ok(KeyAlgorithm::Rsa3072),
			"rsa-4096" => Ok(KeyAlgorithm::Rsa4096),
			other => Err(warden_core::Error::invalid(format!(
				"key algorithm {other:?}"
			))),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaStatus {
	Pending,
	Active,
	Retired,
	Revoked,
}

impl fmt::Display for CaStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			CaStatus::Pending => "pending",
			CaStatus::Active => "active",
			CaStatus::Retired => "retired",
			CaStatus::Revoked => "revoked",
		};
		write!(f, "{s}")
	}
}

/// A certificate authority. At most one is `active` at any time; `retired`
/// CAs keep their key material and stay in the trust bundle until revoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ca {
	pub id: Uuid,
	pub cert_pem: String,
	pub private_key_pem: String,
	/// 128-bit serial, hex.
	pub serial: String,
	pub not_before: DateTime<Utc>,
	pub not_after: DateTime<Utc>,
	pub status: CaStatus,
	/// hex(sha256(DER)).
	pub fingerprint: String,
	pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
	/// Created, never heartbeated.
	Pending,
	Online,
	Offline,
}

impl fmt::Display for TenantStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			TenantStatus::Pending => "pending",
			TenantStatus::Online => "online",
			TenantStatus::Offline => "offline",
		};
		write!(f, "{s}")
	}
}

/// A logical VPN concentrator (gateway or hub) with its own Sub-CA.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
	pub id: Uuid,
	pub name: String,
	pub public_endpoint: String,
	pub vpn_port: u16,
	pub vpn_protocol: VpnProtocol,
	pub vpn_subnet: Ipv4Net,
	pub crypto_profile: CryptoProfile,
	pub key_algorithm: KeyAlgorithm,
	pub tls_auth_enabled: bool,
	pub tls_auth_key: Option<String>,
	/// Signed by exactly one root CA, identified by its AKI.
	pub sub_ca_cert: Option<String>,
	pub sub_ca_key: Option<String>,
	pub server_cert: Option<String>,
	pub server_key: Option<String>,
	/// Opaque bearer token the remote authenticates with.
	pub api_token: String,
	pub status: TenantStatus,
	pub status_message: Option<String>,
	pub last_heartbeat: Option<DateTime<Utc>>,
	/// DNS servers pushed into issued client configs.
	pub dns_servers: Vec<IpAddr>,
}

impl Tenant {
	pub fn new(name: impl Into<String>, public_endpoint: impl Into<String>) -> Self {
		Tenant {
			id: Uuid::new_v4(),
			name: name.into(),
			public_endpoint: public_endpoint.into(),
			vpn_port: 1194,
			vpn_protocol: VpnProtocol::Udp,
			vpn_subnet: "10.8.0.0/24".parse().expect("valid default subnet"),
			crypto_profile: CryptoProfile::Modern,
			key_algorithm: KeyAlgorithm::default(),
			tls_auth_enabled: false,
			tls_auth_key: None,
			sub_ca_cert: None,
			sub_ca_key: None,
			server_cert: None,
			server_key: None,
			api_token: crate::store::mint_token(),
			status: TenantStatus::Pending,
			status_message: None,
			last_heartbeat: None,
			dns_servers: Vec::new(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpokeStatus {
	Pending,
	Connected,
	Disconnected,
}

impl fmt::Display for SpokeStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			SpokeStatus::Pending => "pending",
			SpokeStatus::Connected => "connected",
			SpokeStatus::Disconnected => "disconnected",
		};
		write!(f, "{s}")
	}
}

/// A relay behind a hub advertising local subnets into the overlay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spoke {
	pub id: Uuid,
	pub hub_id: Uuid,
	pub name: String,
	pub local_networks: Vec<Ipv4Net>,
	/// Allocated from the hub's `vpn_subnet`; unique within the hub.
	pub tunnel_ip: Ipv4Addr,
	pub client_cert: String,
	pub client_key: String,
	pub token: String,
	pub status: SpokeStatus,
	pub last_seen: Option<DateTime<Utc>>,
}

/// Upserted on each successful identity assertion; `groups` replaces on
/// login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
	pub id: Uuid,
	pub external_id: String,
	pub provider: String,
	pub email: String,
	pub groups: Vec<String>,
	pub is_admin: bool,
	pub is_active: bool,
}

/// What the identity broker hands us after a successful login. Crosses the
/// HTTP boundary, so it serializes like the rest of the wire types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityAssertion {
	pub external_id: String,
	pub provider: String,
	pub email: String,
	pub groups: Vec<String>,
	#[serde(default)]
	pub is_admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
	pub id: Uuid,
	pub name: String,
	pub cidr: IpNet,
	pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRule {
	pub id: Uuid,
	pub name: String,
	pub rule_type: RuleType,
	pub value: String,
	#[serde(default)]
	pub port_range: PortRange,
	#[serde(default)]
	pub protocol: Protocol,
	/// When set, the rule is scoped to tenants this network is bound to.
	pub network_id: Option<Uuid>,
	pub is_active: bool,
}

/// A generated client config artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedConfig {
	pub id: Uuid,
	pub user_id: Uuid,
	pub tenant_id: Uuid,
	/// Client cert serial, hex.
	pub serial: String,
	/// Client cert fingerprint, hex(sha256(DER)).
	pub fingerprint: String,
	/// 256-bit URL-safe token validated by the VPN's password-verify hook.
	pub auth_token: String,
	pub config_blob: String,
	pub created_at: DateTime<Utc>,
	pub expires_at: DateTime<Utc>,
	pub is_revoked: bool,
	pub revoked_at: Option<DateTime<Utc>>,
	pub revoked_reason: Option<String>,
	pub downloaded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
	CaPrepared,
	CaActivated,
	CaRevoked,
	SubCaRegenerated,
	ConfigIssued,
	ConfigRevoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
	pub at: DateTime<Utc>,
	pub kind: AuditKind,
	pub detail: String,
}
