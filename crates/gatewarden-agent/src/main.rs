use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use gatewarden_agent::config::{AgentConfig, FirewallKind};
use gatewarden_agent::control::ControlClient;
use gatewarden_agent::dns::SystemResolver;
use gatewarden_agent::firewall::FirewallBackend;
use gatewarden_agent::firewall::nft::NftBackend;
use gatewarden_agent::firewall::testing::MemBackend;
use gatewarden_agent::hooks::{self, HookContext};
use gatewarden_agent::Agent;
use tracing::info;
use warden_core::signal::{Shutdown, drain};
use warden_core::telemetry;

#[derive(Parser)]
#[command(name = "gatewarden-agent", about = "gateway agent and VPN hook handler")]
struct Cli {
	/// Path to agent.yaml; falls back to $WARDEN_AGENT_CONFIG, then the
	/// default location.
	#[arg(long)]
	config: Option<PathBuf>,
	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Run the long-lived agent.
	Run,
	/// Handle one VPN daemon event and exit (invoked by the daemon itself).
	Hook {
		#[command(subcommand)]
		event: HookEvent,
	},
}

#[derive(Subcommand)]
enum HookEvent {
	/// auth-user-pass-verify via-file handler.
	AuthUserPassVerify { credentials_file: PathBuf },
	ClientConnect,
	ClientDisconnect,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	telemetry::setup_logging();
	let cli = Cli::parse();
	let path = cli
		.config
		.unwrap_or_else(AgentConfig::config_path_from_env);
	let cfg = Arc::new(AgentConfig::from_file(&path)?);

	match cli.command {
		Command::Run => run(cfg).await,
		Command::Hook { event } => {
			let code = match event {
				HookEvent::AuthUserPassVerify { credentials_file } => {
					hooks::auth_user_pass_verify(&cfg, &credentials_file).await
				},
				HookEvent::ClientConnect => match HookContext::from_env() {
					Ok(ctx) => hooks::client_connect(&cfg, &ctx).await,
					Err(e) => {
						tracing::warn!("rejecting hook invocation: {e}");
						1
					},
				},
				HookEvent::ClientDisconnect => match HookContext::from_env() {
					Ok(ctx) => hooks::client_disconnect(&cfg, &ctx).await,
					Err(e) => {
						tracing::warn!("rejecting hook invocation: {e}");
						1
					},
				},
			};
			std::process::exit(code);
		},
	}
}

async fn run(cfg: Arc<AgentConfig>) -> anyhow::Result<()> {
	let control = Arc::new(ControlClient::new(
		&cfg.control_url,
		&cfg.token,
		cfg.request_timeout(),
	)?);
	let firewall: Arc<dyn FirewallBackend> = match cfg.firewall {
		FirewallKind::Nftables => Arc::new(NftBackend::new()),
		FirewallKind::Memory => {
			info!("memory firewall backend selected, enforcement is a no-op");
			Arc::new(MemBackend::new())
		},
	};
	let resolver = Arc::new(SystemResolver::new()?);

	let agent = Agent::new(cfg, control, firewall, resolver);
	let (drain_trigger, drain_watcher) = drain::new();
	let task = tokio::spawn(agent.run(drain_watcher));

	Shutdown::new().wait().await;
	info!("shutting down, draining loops");
	drain_trigger.start_drain_and_wait().await;
	task.await??;
	Ok(())
}
