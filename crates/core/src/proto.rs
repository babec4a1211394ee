//! Wire protocol between the control plane and remote gateways.
//!
//! Everything here is JSON over HTTP. Field names are part of the protocol;
//! remotes ignore unknown fields so the control plane can grow responses.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Transport protocol the VPN daemon listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VpnProtocol {
	Udp,
	Tcp,
}

impl fmt::Display for VpnProtocol {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			VpnProtocol::Udp => write!(f, "udp"),
			VpnProtocol::Tcp => write!(f, "tcp"),
		}
	}
}

impl FromStr for VpnProtocol {
	type Err = crate::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"udp" => Ok(VpnProtocol::Udp),
			"tcp" => Ok(VpnProtocol::Tcp),
			other => Err(crate::Error::invalid(format!("vpn protocol {other:?}"))),
		}
	}
}

/// Per-tenant cipher suite selection for issued client configs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CryptoProfile {
	Modern,
	Fips,
	Compatible,
}

impl fmt::Display for CryptoProfile {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			CryptoProfile::Modern => write!(f, "modern"),
			CryptoProfile::Fips => write!(f, "fips"),
			CryptoProfile::Compatible => write!(f, "compatible"),
		}
	}
}

impl FromStr for CryptoProfile {
	type Err = crate::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"modern" => Ok(CryptoProfile::Modern),
			"fips" => Ok(CryptoProfile::Fips),
			"compatible" => Ok(CryptoProfile::Compatible),
			other => Err(crate::Error::invalid(format!("crypto profile {other:?}"))),
		}
	}
}

/// What an access rule (and its compiled destination) points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
	Ip,
	Cidr,
	Hostname,
	HostnameWildcard,
}

impl fmt::Display for RuleType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			RuleType::Ip => write!(f, "ip"),
			RuleType::Cidr => write!(f, "cidr"),
			RuleType::Hostname => write!(f, "hostname"),
			RuleType::HostnameWildcard => write!(f, "hostname_wildcard"),
		}
	}
}

/// A port selector: a single port, an inclusive range, or everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PortRange {
	#[default]
	Any,
	Single(u16),
	Range(u16, u16),
}

impl PortRange {
	pub fn contains(&self, port: u16) -> bool {
		match self {
			PortRange::Any => true,
			PortRange::Single(p) => *p == port,
			PortRange::Range(lo, hi) => (*lo..=*hi).contains(&port),
		}
	}
}

impl fmt::Display for PortRange {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			PortRange::Any => write!(f, "*"),
			PortRange::Single(p) => write!(f, "{p}"),
			PortRange::Range(lo, hi) => write!(f, "{lo}-{hi}"),
		}
	}
}

impl FromStr for PortRange {
	type Err = crate::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() || s == "*" {
			return Ok(PortRange::Any);
		}
		if let Some((lo, hi)) = s.split_once('-') {
			let lo: u16 = lo
				.parse()
				.map_err(|_| crate::Error::invalid(format!("port range {s:?}")))?;
			let hi: u16 = hi
				.parse()
				.map_err(|_| crate::Error::invalid(format!("port range {s:?}")))?;
			if lo == 0 || lo > hi {
				return Err(crate::Error::invalid(format!("port range {s:?}")));
			}
			return Ok(PortRange::Range(lo, hi));
		}
		let p: u16 = s
			.parse()
			.map_err(|_| crate::Error::invalid(format!("port {s:?}")))?;
		if p == 0 {
			return Err(crate::Error::invalid(format!("port {s:?}")));
		}
		Ok(PortRange::Single(p))
	}
}

impl Serialize for PortRange {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.collect_str(self)
	}
}

impl<'de> Deserialize<'de> for PortRange {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		PortRange::from_str(&s).map_err(serde::de::Error::custom)
	}
}

/// An L4 protocol selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
	Tcp,
	Udp,
	Icmp,
	#[default]
	#[serde(rename = "*")]
	Any,
}

impl fmt::Display for Protocol {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Protocol::Tcp => write!(f, "tcp"),
			Protocol::Udp => write!(f, "udp"),
			Protocol::Icmp => write!(f, "icmp"),
			Protocol::Any => write!(f, "*"),
		}
	}
}

impl FromStr for Protocol {
	type Err = crate::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim() {
			"tcp" => Ok(Protocol::Tcp),
			"udp" => Ok(Protocol::Udp),
			"icmp" => Ok(Protocol::Icmp),
			"" | "*" => Ok(Protocol::Any),
			other => Err(crate::Error::invalid(format!("protocol {other:?}"))),
		}
	}
}

/// The compiled, per-client atomic allow rule.
///
/// Hostname destinations stay hostnames on the wire; the gateway resolves
/// them so its DNS view is authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowedDestination {
	#[serde(rename = "type")]
	pub rule_type: RuleType,
	pub value: String,
	#[serde(default)]
	pub port: PortRange,
	#[serde(default)]
	pub protocol: Protocol,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
	pub token: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub status: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub status_message: Option<String>,
	pub connected_clients: u32,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub connected_spokes: Option<u32>,
	/// Fingerprint last applied by the remote; empty on first contact.
	#[serde(default)]
	pub config_version: String,
}

/// Why heartbeat asked the remote to reprovision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReprovisionReason {
	/// Remote has never been provisioned (reported an empty version).
	New,
	/// Remote's version no longer matches the expected fingerprint.
	Drift,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
	pub ok: bool,
	pub needs_reprovision: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reason: Option<ReprovisionReason>,
	pub config_version: String,
	pub root_ca_fingerprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionRequest {
	pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionResponse {
	/// Trust bundle, active CA first, PEM concatenated.
	pub full_ca_chain: String,
	pub server_cert: String,
	pub server_key: String,
	pub tls_auth_enabled: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tls_auth_key: Option<String>,
	pub vpn_port: u16,
	pub vpn_protocol: VpnProtocol,
	pub vpn_subnet: Ipv4Net,
	pub crypto_profile: CryptoProfile,
	pub config_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRulesRequest {
	pub token: String,
	pub client_email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRulesResponse {
	pub rules: Vec<AllowedDestination>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllClientRulesRequest {
	pub token: String,
	pub clients: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllClientRulesResponse {
	pub client_rules: BTreeMap<String, Vec<AllowedDestination>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConnectedRequest {
	pub token: String,
	pub user_id: Uuid,
	/// Real source address the client connected from.
	pub client_ip: String,
	pub tunnel_ip: IpAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientDisconnectedRequest {
	pub token: String,
	pub user_id: Uuid,
	pub tunnel_ip: IpAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfoRequest {
	pub token: String,
	pub client_email: String,
}

/// Identity details for a connected client, looked up by the email the VPN
/// daemon saw in the cert CN. Connect hooks use this to publish events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfoResponse {
	pub user_id: Uuid,
	pub email: String,
	pub groups: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyClientRequest {
	pub token: String,
	pub client_email: String,
	pub auth_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
	pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustBundleResponse {
	/// PEM concatenated bundle, active CA first.
	pub bundle: String,
	pub root_ca_fingerprint: String,
}

/// Hub-authenticated: provision a new relay behind the calling hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpokeCreateRequest {
	/// The hub's own bearer token.
	pub token: String,
	pub name: String,
	#[serde(default)]
	pub local_networks: Vec<Ipv4Net>,
}

/// Everything a freshly created spoke needs to join the overlay: its
/// identity under the hub's Sub-CA, a distinct tunnel address, and its own
/// bearer token for heartbeating.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpokeCreateResponse {
	pub id: Uuid,
	pub name: String,
	pub tunnel_ip: Ipv4Addr,
	pub client_cert: String,
	pub client_key: String,
	pub token: String,
	/// Trust bundle, active CA first, PEM concatenated.
	pub ca_chain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpokeHeartbeatRequest {
	/// The spoke's bearer token (not the hub's).
	pub token: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub status_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpokeHeartbeatResponse {
	pub ok: bool,
	/// Lifecycle state after this heartbeat was recorded.
	pub status: String,
}

/// One connected VPN client, as published by the gateway's exec-hooks into
/// the drop directory (one JSON file per tunnel IP) and mirrored in the
/// agent's in-memory map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedClient {
	pub vpn_ip: IpAddr,
	pub user_id: Uuid,
	pub user_email: String,
	pub groups: Vec<String>,
	pub connected_at: DateTime<Utc>,
}
