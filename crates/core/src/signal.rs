//! Process shutdown and connection draining.
//!
//! A [`Shutdown`] waits for SIGTERM/ctrl-c or an explicit
//! [`ShutdownTrigger`]; long-running loops hold a [`drain::DrainWatcher`] and
//! the owner calls [`drain::DrainTrigger::start_drain_and_wait`] to signal
//! them and wait until every watcher has been dropped.

use tokio::sync::mpsc;

pub struct Shutdown {
	tx: mpsc::Sender<()>,
	rx: mpsc::Receiver<()>,
}

impl Shutdown {
	#[allow(clippy::new_without_default)]
	pub fn new() -> Self {
		let (tx, rx) = mpsc::channel(1);
		Shutdown { tx, rx }
	}

	/// Handle that can request shutdown from anywhere in the process.
	pub fn trigger(&self) -> ShutdownTrigger {
		ShutdownTrigger {
			tx: self.tx.clone(),
		}
	}

	/// Resolves on SIGTERM, ctrl-c, or a trigger firing.
	pub async fn wait(mut self) {
		tokio::select! {
			_ = wait_for_signal() => {},
			_ = self.rx.recv() => {},
		}
	}
}

#[derive(Clone)]
pub struct ShutdownTrigger {
	tx: mpsc::Sender<()>,
}

impl ShutdownTrigger {
	pub async fn shutdown_now(&self) {
		let _ = self.tx.send(()).await;
	}
}

#[cfg(unix)]
async fn wait_for_signal() {
	use tokio::signal::unix::{SignalKind, signal};
	let mut term = signal(SignalKind::terminate()).expect("register SIGTERM handler");
	tokio::select! {
		_ = term.recv() => tracing::info!("received SIGTERM"),
		res = tokio::signal::ctrl_c() => {
			if let Err(e) = res {
				tracing::warn!("ctrl-c handler failed: {e}");
			} else {
				tracing::info!("received ctrl-c");
			}
		},
	}
}

#[cfg(not(unix))]
async fn wait_for_signal() {
	if let Err(e) = tokio::signal::ctrl_c().await {
		tracing::warn!("ctrl-c handler failed: {e}");
	}
}

pub mod drain {
	use tokio::sync::{mpsc, watch};

	pub fn new() -> (DrainTrigger, DrainWatcher) {
		let (drain_tx, drain_rx) = watch::channel(false);
		let (alive_tx, alive_rx) = mpsc::channel(1);
		(
			DrainTrigger {
				tx: drain_tx,
				done: alive_rx,
			},
			DrainWatcher {
				rx: drain_rx,
				_alive: alive_tx,
			},
		)
	}

	/// Held by every loop that must be told about shutdown. Dropping the
	/// watcher reports completion to the trigger.
	#[derive(Clone)]
	pub struct DrainWatcher {
		rx: watch::Receiver<bool>,
		_alive: mpsc::Sender<()>,
	}

	impl DrainWatcher {
		/// Resolves once draining has started.
		pub async fn wait_for_drain(mut self) {
			loop {
				if *self.rx.borrow_and_update() {
					return;
				}
				if self.rx.changed().await.is_err() {
					return;
				}
			}
		}
	}

	pub struct DrainTrigger {
		tx: watch::Sender<bool>,
		done: mpsc::Receiver<()>,
	}

	impl DrainTrigger {
		/// Signal all watchers, then wait until each has been dropped.
		pub async fn start_drain_and_wait(mut self) {
			let _ = self.tx.send(true);
			// recv returns None once every watcher (sender clone) is gone.
			let _ = self.done.recv().await;
		}
	}

	#[cfg(test)]
	mod tests {
		use std::time::Duration;

		use super::*;

		#[tokio::test]
		async fn drain_waits_for_all_watchers() {
			let (trigger, watcher) = new();
			let w2 = watcher.clone();
			let task = tokio::spawn(async move {
				w2.wait_for_drain().await;
				tokio::time::sleep(Duration::from_millis(20)).await;
			});
			drop(watcher);
			tokio::time::timeout(Duration::from_secs(2), trigger.start_drain_and_wait())
				.await
				.expect("drain should complete");
			task.await.unwrap();
		}
	}
}
