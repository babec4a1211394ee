//! The long-running agent: heartbeat/reprovision loop and the per-client
//! rule-refresh loop that reconciles firewall state against the drop
//! directory.
//!
//! One `Agent` value owns all process-wide state; tests build their own
//! against in-memory fakes of the control plane and firewall.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use warden_core::error::Result;
use warden_core::proto::ConnectedClient;
use warden_core::signal::drain::DrainWatcher;

use crate::config::AgentConfig;
use crate::control::ControlClient;
use crate::dns::{self, Resolve};
use crate::firewall::{FirewallBackend, connection_id};
use crate::{dropdir, provision};

pub struct Agent {
	cfg: Arc<AgentConfig>,
	control: Arc<ControlClient>,
	firewall: Arc<dyn FirewallBackend>,
	resolver: Arc<dyn Resolve>,
	/// Mirror of the drop directory. Copy entries out before doing I/O.
	clients: Mutex<HashMap<IpAddr, ConnectedClient>>,
	/// Last applied config fingerprint, persisted in the etc dir.
	config_version: Mutex<String>,
	/// Carried into the next heartbeat's status_message.
	last_error: Mutex<Option<String>>,
	refresh_ticks: Mutex<u64>,
}

/// Every Nth refresh tick fetches the whole allow-list in one batch call
/// instead of one request per client.
const BATCH_RESYNC_EVERY: u64 = 6;

impl Agent {
	pub fn new(
		cfg: Arc<AgentConfig>,
		control: Arc<ControlClient>,
		firewall: Arc<dyn FirewallBackend>,
		resolver: Arc<dyn Resolve>,
	) -> Arc<Self> {
		// Reading the marker here is what makes restarts quiet: a fresh
		// process with a current bundle does not re-provision.
		let version = provision::read_version(&cfg);
		Arc::new(Agent {
			cfg,
			control,
			firewall,
			resolver,
			clients: Mutex::new(HashMap::new()),
			config_version: Mutex::new(version),
			last_error: Mutex::new(None),
			refresh_ticks: Mutex::new(0),
		})
	}

	pub fn connected_clients(&self) -> Vec<ConnectedClient> {
		self.clients.lock().values().cloned().collect()
	}

	pub fn current_version(&self) -> String {
		self.config_version.lock().clone()
	}

	/// Run both loops until drained, then tear down firewall state.
	pub async fn run(self: Arc<Self>, drain: DrainWatcher) -> Result<()> {
		self.firewall.initialize().await?;
		info!(version = %self.current_version(), "agent started");

		let heartbeat = {
			let agent = self.clone();
			let drain = drain.clone();
			tokio::spawn(async move { agent.heartbeat_loop(drain).await })
		};
		let refresh = {
			let agent = self.clone();
			let drain = drain.clone();
			tokio::spawn(async move { agent.refresh_loop(drain).await })
		};
		drop(drain);
		let _ = tokio::join!(heartbeat, refresh);

		if let Err(e) = self.firewall.cleanup().await {
			warn!("firewall cleanup on shutdown failed: {e}");
		}
		info!("agent stopped");
		Ok(())
	}

	async fn heartbeat_loop(&self, drain: DrainWatcher) {
		let mut interval = tokio::time::interval(self.cfg.heartbeat_interval());
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			tokio::select! {
				_ = interval.tick() => {
					// Errors retry on the next tick; the interval is the backoff.
					if let Err(e) = self.heartbeat_tick().await {
						warn!("heartbeat failed: {e}");
					}
				},
				_ = drain.clone().wait_for_drain() => return,
			}
		}
	}

	async fn refresh_loop(&self, drain: DrainWatcher) {
		let mut interval = tokio::time::interval(self.cfg.rule_refresh_interval());
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			tokio::select! {
				_ = interval.tick() => self.refresh_tick().await,
				_ = drain.clone().wait_for_drain() => return,
			}
		}
	}

	/// One heartbeat: report liveness, reprovision when the control plane
	/// observed drift or we have never been provisioned.
	pub async fn heartbeat_tick(&self) -> Result<()> {
		let version = self.current_version();
		let connected = self.clients.lock().len() as u32;
		let (status, status_message) = match self.last_error.lock().clone() {
			Some(message) => (Some("degraded".to_string()), Some(message)),
			None => (Some("ok".to_string()), None),
		};

		let response = self
			.control
			.heartbeat(connected, status, status_message, &version)
			.await?;
		debug!(
			needs_reprovision = response.needs_reprovision,
			expected = %response.config_version,
			"heartbeat"
		);

		if response.needs_reprovision || version.is_empty() {
			match self.reprovision().await {
				Ok(()) => {
					*self.last_error.lock() = None;
				},
				Err(e) => {
					// Reported in the next heartbeat's status_message.
					*self.last_error.lock() = Some(e.to_string());
					return Err(e);
				},
			}
		}
		Ok(())
	}

	async fn reprovision(&self) -> Result<()> {
		let bundle = self.control.provision().await?;
		provision::apply(&self.cfg, &bundle).await?;
		*self.config_version.lock() = bundle.config_version.clone();
		info!(version = %bundle.config_version, "reprovisioned");
		Ok(())
	}

	/// One reconciliation pass over the drop directory: departed clients
	/// lose their rules, present clients get a fresh fetch+apply. A failure
	/// for one client never blocks the others.
	pub async fn refresh_tick(&self) {
		let desired = match dropdir::scan(&self.cfg.drop_dir) {
			Ok(desired) => desired,
			Err(e) => {
				warn!("drop directory scan failed, keeping current state: {e}");
				return;
			},
		};

		let known: Vec<IpAddr> = self.clients.lock().keys().copied().collect();
		for ip in known {
			if !desired.contains_key(&ip) {
				match self.firewall.remove_rules(&connection_id(ip)).await {
					Ok(()) => {
						let removed = self.clients.lock().remove(&ip);
						if let Some(client) = removed {
							info!(client = %client.user_email, tunnel_ip = %ip, "client departed, rules removed");
						}
					},
					Err(e) => warn!(tunnel_ip = %ip, "rule removal failed, will retry: {e}"),
				}
			}
		}

		// Most ticks fetch per client so one slow or failing client never
		// blocks the rest; periodically a single batch call resyncs everyone.
		let tick = {
			let mut ticks = self.refresh_ticks.lock();
			*ticks += 1;
			*ticks
		};
		let batch = if tick % BATCH_RESYNC_EVERY == 0 && desired.len() > 1 {
			let emails: Vec<String> = desired.values().map(|c| c.user_email.clone()).collect();
			match self.control.all_client_rules(emails).await {
				Ok(batch) => Some(batch),
				Err(e) => {
					warn!("batch resync failed, falling back to per-client fetch: {e}");
					None
				},
			}
		} else {
			None
		};

		for (ip, client) in desired {
			let rules = match &batch {
				Some(batch) => batch.get(&client.user_email).cloned(),
				None => None,
			};
			if let Err(e) = self.refresh_client(ip, &client, rules).await {
				warn!(
					client = %client.user_email,
					tunnel_ip = %ip,
					"rule refresh failed for client, keeping previous rules: {e}"
				);
				continue;
			}
			self.clients.lock().insert(ip, client);
		}
	}

	async fn refresh_client(
		&self,
		ip: IpAddr,
		client: &ConnectedClient,
		prefetched: Option<Vec<warden_core::proto::AllowedDestination>>,
	) -> Result<()> {
		let rules = match prefetched {
			Some(rules) => rules,
			None => self.control.client_rules(&client.user_email).await?,
		};
		let specs = dns::expand(&rules, self.resolver.as_ref()).await;
		self
			.firewall
			.apply_rules(&connection_id(ip), client.user_id, ip, &specs)
			.await
	}
}
