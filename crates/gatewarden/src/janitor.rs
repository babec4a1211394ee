//! Background janitors: mark-offline sweeps, expired-artifact GC and audit
//! retention. One task, three cadences, drained on shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};
use warden_core::signal::drain::DrainWatcher;

use crate::Settings;
use crate::registry;
use crate::store::Store;

const GC_INTERVAL: Duration = Duration::from_secs(60 * 60);
const AUDIT_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

pub async fn run(store: Arc<dyn Store>, settings: Arc<Settings>, drain: DrainWatcher) {
	// Sweep a few times per miss threshold so status flips promptly.
	let sweep_every = Duration::from_secs((settings.offline_after_secs / 3).max(5));
	let mut offline = tokio::time::interval(sweep_every);
	let mut gc = tokio::time::interval(GC_INTERVAL);
	let mut audit = tokio::time::interval(AUDIT_INTERVAL);

	info!(sweep = ?sweep_every, "janitor started");
	loop {
		tokio::select! {
			_ = offline.tick() => {
				let cutoff = Utc::now() - settings.offline_cutoff();
				let tenants = store.mark_tenants_offline(cutoff);
				let spokes = store.mark_spokes_disconnected(cutoff);
				if !tenants.is_empty() || !spokes.is_empty() {
					info!(tenants = tenants.len(), spokes = spokes.len(), "marked remotes offline");
				}
			},
			_ = gc.tick() => {
				let retention = chrono::Duration::hours(settings.gc_retention_hours as i64);
				let purged = registry::gc(store.as_ref(), retention, Utc::now());
				if purged > 0 {
					info!(purged, "purged expired configs");
				}
			},
			_ = audit.tick() => {
				let cutoff = Utc::now() - chrono::Duration::days(settings.audit_retention_days as i64);
				let pruned = store.prune_audit_before(cutoff);
				debug!(pruned, "audit retention pass");
			},
			_ = drain.clone().wait_for_drain() => {
				info!("janitor draining");
				return;
			},
		}
	}
}
