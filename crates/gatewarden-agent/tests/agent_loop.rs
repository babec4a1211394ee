//! Agent loops against a real in-process control plane: provisioning
//! convergence, drop-directory reconciliation into firewall state, and DNS
//! re-resolution shrinking rule sets.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use gatewarden::api::{self, AppState};
use gatewarden::pki::rotation;
use gatewarden::store::{MemStore, Store};
use gatewarden::types::{AccessRule, IdentityAssertion, Tenant, User};
use gatewarden::Settings;
use gatewarden_agent::Agent;
use gatewarden_agent::config::{AgentConfig, FirewallKind};
use gatewarden_agent::control::ControlClient;
use gatewarden_agent::dns::StaticResolver;
use gatewarden_agent::firewall::testing::MemBackend;
use gatewarden_agent::firewall::{FirewallBackend, RuleSpec};
use gatewarden_agent::{dropdir, provision};
use uuid::Uuid;
use warden_core::proto::{ConnectedClient, PortRange, Protocol, RuleType};

struct World {
	store: Arc<MemStore>,
	tenant: Tenant,
	cfg: Arc<AgentConfig>,
	agent: Arc<Agent>,
	firewall: Arc<MemBackend>,
	resolver: Arc<StaticResolver>,
	_etc: tempfile::TempDir,
	_drop: tempfile::TempDir,
}

async fn world() -> World {
	let store = Arc::new(MemStore::new());
	let settings = Arc::new(Settings::default());
	rotation::ensure_root(store.as_ref(), &settings).unwrap();

	let tenant = Tenant::new("gw-1", "vpn.example.com");
	store.create_tenant(tenant.clone()).unwrap();

	let app = api::router(AppState::new(store.clone(), settings));
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		axum::serve(listener, app).await.unwrap();
	});

	let etc = tempfile::tempdir().unwrap();
	let drop_dir = tempfile::tempdir().unwrap();
	let cfg = Arc::new(AgentConfig {
		control_url: format!("http://{addr}"),
		token: tenant.api_token.clone(),
		etc_dir: etc.path().to_path_buf(),
		drop_dir: drop_dir.path().to_path_buf(),
		heartbeat_interval_secs: 30,
		rule_refresh_interval_secs: 10,
		request_timeout_secs: 10,
		vpn_restart_command: vec!["true".to_string()],
		firewall: FirewallKind::Memory,
	});

	let control = Arc::new(
		ControlClient::new(&cfg.control_url, &cfg.token, cfg.request_timeout()).unwrap(),
	);
	let firewall = Arc::new(MemBackend::new());
	let resolver = Arc::new(StaticResolver::new());
	let agent = Agent::new(cfg.clone(), control, firewall.clone(), resolver.clone());
	firewall.initialize().await.unwrap();

	World {
		store,
		tenant,
		cfg,
		agent,
		firewall,
		resolver,
		_etc: etc,
		_drop: drop_dir,
	}
}

fn eng_user(store: &dyn Store) -> User {
	store.upsert_user(IdentityAssertion {
		external_id: "ext-1".into(),
		provider: "oidc".into(),
		email: "u@x.test".into(),
		groups: vec!["eng".into()],
		is_admin: false,
	})
}

fn rule(
	name: &str,
	rule_type: RuleType,
	value: &str,
	port: PortRange,
	protocol: Protocol,
) -> AccessRule {
	AccessRule {
		id: Uuid::new_v4(),
		name: name.into(),
		rule_type,
		value: value.into(),
		port_range: port,
		protocol,
		network_id: None,
		is_active: true,
	}
}

fn connect_client(world: &World, user: &User, ip: &str) -> IpAddr {
	let ip: IpAddr = ip.parse().unwrap();
	dropdir::write_client(
		&world.cfg.drop_dir,
		&ConnectedClient {
			vpn_ip: ip,
			user_id: user.id,
			user_email: user.email.clone(),
			groups: user.groups.clone(),
			connected_at: Utc::now(),
		},
	)
	.unwrap();
	ip
}

#[tokio::test]
async fn first_heartbeat_provisions_and_second_converges() {
	let w = world().await;
	assert_eq!(w.agent.current_version(), "");

	w.agent.heartbeat_tick().await.unwrap();
	let version = w.agent.current_version();
	assert_eq!(version.len(), 16);
	assert!(w.cfg.etc_dir.join("ca.crt").exists());
	assert!(w.cfg.etc_dir.join("server.crt").exists());
	assert!(w.cfg.etc_dir.join("server.key").exists());
	assert_eq!(provision::read_version(&w.cfg), version);

	// Converged: another tick changes nothing.
	w.agent.heartbeat_tick().await.unwrap();
	assert_eq!(w.agent.current_version(), version);

	// Operator flips tls-auth; drift is observed and the bundle re-applied.
	let mut tenant = w.store.tenant(w.tenant.id).unwrap();
	tenant.tls_auth_enabled = true;
	w.store.update_tenant(tenant).unwrap();

	w.agent.heartbeat_tick().await.unwrap();
	let rotated = w.agent.current_version();
	assert_ne!(rotated, version);
	assert!(w.cfg.etc_dir.join("ta.key").exists());
	assert_eq!(provision::read_version(&w.cfg), rotated);
}

#[tokio::test]
async fn restart_survives_without_reprovisioning() {
	let w = world().await;
	w.agent.heartbeat_tick().await.unwrap();
	let version = w.agent.current_version();

	// A new agent over the same etc dir starts at the persisted version.
	let control = Arc::new(
		ControlClient::new(&w.cfg.control_url, &w.cfg.token, w.cfg.request_timeout()).unwrap(),
	);
	let reborn = Agent::new(
		w.cfg.clone(),
		control,
		Arc::new(MemBackend::new()),
		Arc::new(StaticResolver::new()),
	);
	assert_eq!(reborn.current_version(), version);
}

#[tokio::test]
async fn connected_client_rules_reach_the_firewall() {
	let w = world().await;
	let user = eng_user(w.store.as_ref());

	// (ip, 10.1.1.5, *, *) direct; (cidr, 10.2.0.0/16, 443, tcp) via eng.
	let direct = rule("a-direct", RuleType::Ip, "10.1.1.5", PortRange::Any, Protocol::Any);
	let via_group = rule(
		"b-eng",
		RuleType::Cidr,
		"10.2.0.0/16",
		PortRange::Single(443),
		Protocol::Tcp,
	);
	w.store.create_rule(direct.clone()).unwrap();
	w.store.create_rule(via_group.clone()).unwrap();
	w.store.bind_user_rule(user.id, direct.id).unwrap();
	w.store.bind_group_rule("eng", via_group.id).unwrap();

	let ip = connect_client(&w, &user, "10.8.0.42");
	w.agent.refresh_tick().await;

	let installed = w.firewall.installed("client-10-8-0-42").unwrap();
	assert_eq!(installed.tunnel_ip, ip);
	assert_eq!(installed.user_id, user.id);
	assert_eq!(
		installed.rules,
		vec![
			RuleSpec {
				network: "10.1.1.5/32".parse().unwrap(),
				port: PortRange::Any,
				protocol: Protocol::Any,
			},
			RuleSpec {
				network: "10.2.0.0/16".parse().unwrap(),
				port: PortRange::Single(443),
				protocol: Protocol::Tcp,
			},
		]
	);
	assert_eq!(w.agent.connected_clients().len(), 1);

	// File disappears (disconnect hook): rules follow within one tick.
	dropdir::remove_client(&w.cfg.drop_dir, ip).unwrap();
	w.agent.refresh_tick().await;
	assert!(w.firewall.is_empty());
	assert!(w.agent.connected_clients().is_empty());
}

#[tokio::test]
async fn dns_reresolution_shrinks_the_rule_set() {
	let w = world().await;
	let user = eng_user(w.store.as_ref());
	let host_rule = rule(
		"api",
		RuleType::Hostname,
		"api.internal",
		PortRange::Single(443),
		Protocol::Tcp,
	);
	w.store.create_rule(host_rule.clone()).unwrap();
	w.store.bind_user_rule(user.id, host_rule.id).unwrap();

	w.resolver.set(
		"api.internal",
		vec!["192.0.2.10".parse().unwrap(), "192.0.2.11".parse().unwrap()],
	);
	connect_client(&w, &user, "10.8.0.42");
	w.agent.refresh_tick().await;

	let nets: Vec<String> = w
		.firewall
		.installed("client-10-8-0-42")
		.unwrap()
		.rules
		.iter()
		.map(|r| r.network.to_string())
		.collect();
	assert_eq!(nets, vec!["192.0.2.10/32", "192.0.2.11/32"]);

	// DNS now returns a single address; the stale /32 is gone next tick.
	w.resolver
		.set("api.internal", vec!["192.0.2.10".parse().unwrap()]);
	w.agent.refresh_tick().await;
	let nets: Vec<String> = w
		.firewall
		.installed("client-10-8-0-42")
		.unwrap()
		.rules
		.iter()
		.map(|r| r.network.to_string())
		.collect();
	assert_eq!(nets, vec!["192.0.2.10/32"]);
}

#[tokio::test]
async fn periodic_batch_resync_matches_per_client_results() {
	let w = world().await;
	let alice = eng_user(w.store.as_ref());
	let bob = w.store.upsert_user(IdentityAssertion {
		external_id: "ext-2".into(),
		provider: "oidc".into(),
		email: "bob@x.test".into(),
		groups: vec![],
		is_admin: false,
	});
	let shared = rule("a", RuleType::Ip, "10.1.1.5", PortRange::Any, Protocol::Any);
	w.store.create_rule(shared.clone()).unwrap();
	w.store.bind_group_rule("eng", shared.id).unwrap();

	connect_client(&w, &alice, "10.8.0.42");
	connect_client(&w, &bob, "10.8.0.43");

	// Enough ticks to cross the batch-resync cadence at least once.
	for _ in 0..6 {
		w.agent.refresh_tick().await;
	}

	assert_eq!(
		w.firewall.connection_ids(),
		vec!["client-10-8-0-42", "client-10-8-0-43"]
	);
	assert_eq!(w.firewall.installed("client-10-8-0-42").unwrap().rules.len(), 1);
	// Bob has no bindings: deny-all either way.
	assert!(w.firewall.installed("client-10-8-0-43").unwrap().rules.is_empty());
}

#[tokio::test]
async fn unknown_user_degrades_to_deny_all_without_blocking_others() {
	let w = world().await;
	let user = eng_user(w.store.as_ref());
	let direct = rule("a", RuleType::Ip, "10.1.1.5", PortRange::Any, Protocol::Any);
	w.store.create_rule(direct.clone()).unwrap();
	w.store.bind_user_rule(user.id, direct.id).unwrap();

	connect_client(&w, &user, "10.8.0.42");
	// A drop file for an identity the control plane has never seen.
	let ghost = User {
		id: Uuid::new_v4(),
		external_id: "ghost".into(),
		provider: "oidc".into(),
		email: "ghost@x.test".into(),
		groups: vec![],
		is_admin: false,
		is_active: true,
	};
	connect_client(&w, &ghost, "10.8.0.43");

	w.agent.refresh_tick().await;

	// The known client got its allow-list; the ghost got deny-all.
	assert_eq!(
		w.firewall.connection_ids(),
		vec!["client-10-8-0-42", "client-10-8-0-43"]
	);
	assert_eq!(w.firewall.installed("client-10-8-0-42").unwrap().rules.len(), 1);
	assert!(w.firewall.installed("client-10-8-0-43").unwrap().rules.is_empty());
}
