use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::client::Client;
use crate::fetch::{Registry, SourceStats};
use crate::metrics::Metrics;
use crate::pool::{PoolManager, PoolStats, Snapshot};
use crate::store::{DurableStore, PostgresStore};
use crate::validate::Validator;
use crate::*;

const SNAPSHOT_FILE: &str = "proxy_pools.json";
const BACKUP_DIR: &str = "backups";
const KEEP_BACKUPS: usize = 10;

/// Drives the fetch → validate → classify → persist loops and owns every
/// component. Components never call back into it; they expose read-only
/// stats which it aggregates.
pub struct Orchestrator {
	registry: Registry,
	validator: Validator,
	pool: PoolManager,
	store: Option<Arc<dyn DurableStore>>,
	schedule: config::ScheduleConfig,
	data_dir: PathBuf,

	// Manual fetches and scheduled ones must never interleave.
	fetch_flight: AsyncMutex<()>,
	running: AtomicBool,
	stop_tx: watch::Sender<bool>,
	tasks: Mutex<JoinSet<()>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStats {
	pub running: bool,
	/// Derived on read; never stored anywhere.
	pub uptime_seconds: u64,
	pub pools: PoolStats,
	pub sources: HashMap<Strng, SourceStats>,
}

impl Orchestrator {
	pub fn new(cfg: &Config, metrics: Arc<Metrics>) -> anyhow::Result<Orchestrator> {
		let client = Client::new(cfg.validator.timeout)?;
		let registry = Registry::from_config(&cfg.fetchers, client.clone(), metrics.clone());
		let validator = Validator::new(cfg.validator.clone(), client, metrics.clone());
		let pool = PoolManager::new(cfg.pool.clone(), cfg.thresholds.clone(), metrics);
		let store: Option<Arc<dyn DurableStore>> = match &cfg.store {
			Some(store_cfg) => Some(Arc::new(PostgresStore::connect(store_cfg)?)),
			None => None,
		};
		let (stop_tx, _) = watch::channel(false);
		Ok(Orchestrator {
			registry,
			validator,
			pool,
			store,
			schedule: cfg.schedule.clone(),
			data_dir: cfg.data_dir.clone(),
			fetch_flight: AsyncMutex::new(()),
			running: AtomicBool::new(false),
			stop_tx,
			tasks: Mutex::new(JoinSet::new()),
		})
	}

	/// Starts the background loops. Restores pool state from the last local
	/// snapshot when one exists. Idempotent.
	pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
		if self.running.swap(true, Ordering::SeqCst) {
			return Ok(());
		}
		let _ = self.stop_tx.send(false);

		self.restore_snapshot().await;

		if let Some(store) = &self.store {
			// An unreachable store degrades to local snapshots only.
			if let Err(err) = store.init().await {
				warn!(%err, "durable store unavailable at startup, continuing without it");
			}
		}

		let mut tasks = self.tasks.lock().expect("task lock poisoned");
		tasks.spawn(Self::fetch_loop(self.clone(), self.stop_tx.subscribe()));
		tasks.spawn(Self::cleanup_loop(self.clone(), self.stop_tx.subscribe()));
		tasks.spawn(Self::persist_loop(self.clone(), self.stop_tx.subscribe()));
		info!("orchestrator started");
		Ok(())
	}

	/// Stops the loops, persisting once more on the way out. In-flight work
	/// gets the shutdown deadline to finish, then is abandoned. Idempotent.
	pub async fn stop(&self) {
		if !self.running.swap(false, Ordering::SeqCst) {
			return;
		}
		let _ = self.stop_tx.send(true);

		if let Err(err) = self.persist_cycle().await {
			warn!(%err, "final persist failed");
		}

		let mut tasks = {
			let mut guard = self.tasks.lock().expect("task lock poisoned");
			std::mem::replace(&mut *guard, JoinSet::new())
		};
		let drained = tokio::time::timeout(self.schedule.shutdown_deadline, async {
			while tasks.join_next().await.is_some() {}
		})
		.await;
		if drained.is_err() {
			warn!("shutdown deadline exceeded, abandoning in-flight work");
			tasks.abort_all();
			while tasks.join_next().await.is_some() {}
		}
		info!("orchestrator stopped");
	}

	/// Fetch from every source, validate the candidates through themselves,
	/// and pool them by measured quality.
	pub async fn fetch_cycle(&self) -> anyhow::Result<()> {
		let _flight = self.fetch_flight.lock().await;
		info!("fetch cycle starting");

		let mut candidates = self.registry.fetch_all().await;
		if candidates.is_empty() {
			info!("fetch cycle produced no candidates");
			return Ok(());
		}
		for candidate in &mut candidates {
			candidate.status = Status::Testing;
		}

		let results = self.validator.validate_batch(&candidates).await;
		for (candidate, result) in candidates.iter_mut().zip(&results) {
			candidate.apply_validation(result);
		}
		let working = candidates
			.iter()
			.filter(|c| c.status == Status::Active)
			.count();
		let total = candidates.len();
		self.pool.add_many(candidates);
		info!(total, working, "fetch cycle complete");
		Ok(())
	}

	/// Re-probe everything whose tier interval has lapsed and move records
	/// whose quality changed.
	pub async fn validate_cycle(&self) -> anyhow::Result<()> {
		let due = self.pool.revalidate_due();
		if due.is_empty() {
			debug!("nothing due for revalidation");
			return Ok(());
		}
		info!(due = due.len(), "revalidation starting");
		let results = self.validator.validate_batch(&due).await;
		self.pool.rebalance(&results);
		Ok(())
	}

	pub async fn cleanup_cycle(&self) -> anyhow::Result<()> {
		self.pool.cleanup_blacklist();
		Ok(())
	}

	/// Snapshot to the local file (plus a pruned backup trail), then write
	/// through to the durable store. Store failures are logged, never fatal:
	/// the local snapshot is the fallback.
	pub async fn persist_cycle(&self) -> anyhow::Result<()> {
		let snapshot = self.pool.snapshot();
		let json = snapshot.to_json()?;

		tokio::fs::create_dir_all(&self.data_dir).await?;
		tokio::fs::write(self.data_dir.join(SNAPSHOT_FILE), &json).await?;

		let backups = self.data_dir.join(BACKUP_DIR);
		tokio::fs::create_dir_all(&backups).await?;
		let stamp = Utc::now().format("%Y%m%d_%H%M%S");
		tokio::fs::write(backups.join(format!("proxy_pools_{stamp}.json")), &json).await?;
		if let Err(err) = prune_backups(&backups).await {
			warn!(%err, "backup pruning failed");
		}

		if let Some(store) = &self.store {
			let records = flatten(&snapshot);
			match store.upsert_many(&records).await {
				Ok(written) => debug!(written, "durable store write complete"),
				Err(err) => warn!(%err, "durable store write failed, local snapshot still current"),
			}
		}
		Ok(())
	}

	/// Lease a proxy matching `filter`, consulting tiers in `preference`
	/// order.
	pub fn acquire(&self, filter: Option<&ProxyFilter>, preference: &[Tier]) -> Option<ProxyRecord> {
		self.pool.acquire(filter, preference)
	}

	/// Return a leased proxy before its TTL expires.
	pub fn release(&self, key: &ProxyKey) {
		self.pool.release(key);
	}

	pub fn pool(&self) -> &PoolManager {
		&self.pool
	}

	pub fn stats(&self) -> OrchestratorStats {
		OrchestratorStats {
			running: self.running.load(Ordering::SeqCst),
			uptime_seconds: telemetry::APPLICATION_START_TIME.elapsed().as_secs(),
			pools: self.pool.stats(),
			sources: self.registry.stats(),
		}
	}

	async fn restore_snapshot(&self) {
		let path = self.data_dir.join(SNAPSHOT_FILE);
		let raw = match tokio::fs::read_to_string(&path).await {
			Ok(raw) => raw,
			Err(_) => return,
		};
		match Snapshot::from_json(&raw) {
			Ok(snapshot) => {
				info!(records = snapshot.record_count(), path = %path.display(), "restoring pool snapshot");
				self.pool.restore(snapshot);
			},
			Err(err) => {
				warn!(%err, path = %path.display(), "snapshot unreadable, starting empty");
			},
		}
	}

	async fn fetch_loop(this: Arc<Self>, mut stop: watch::Receiver<bool>) {
		loop {
			tokio::select! {
				_ = tokio::time::sleep(this.schedule.fetch_interval) => {},
				_ = stop.changed() => return,
			}
			if !this.running.load(Ordering::SeqCst) {
				return;
			}
			if let Err(err) = this.fetch_cycle().await {
				// A failing cycle never kills the loop; back off and go again.
				warn!(%err, "fetch cycle failed");
				tokio::select! {
					_ = tokio::time::sleep(this.schedule.fetch_retry_delay) => {},
					_ = stop.changed() => return,
				}
			}
		}
	}

	async fn cleanup_loop(this: Arc<Self>, mut stop: watch::Receiver<bool>) {
		loop {
			tokio::select! {
				_ = tokio::time::sleep(this.schedule.cleanup_interval) => {},
				_ = stop.changed() => return,
			}
			if !this.running.load(Ordering::SeqCst) {
				return;
			}
			// Blacklist purge is cheap and rides along with revalidation.
			let result = match this.cleanup_cycle().await {
				Ok(()) => this.validate_cycle().await,
				Err(err) => Err(err),
			};
			if let Err(err) = result {
				warn!(%err, "cleanup cycle failed");
				tokio::select! {
					_ = tokio::time::sleep(this.schedule.cleanup_retry_delay) => {},
					_ = stop.changed() => return,
				}
			}
		}
	}

	async fn persist_loop(this: Arc<Self>, mut stop: watch::Receiver<bool>) {
		loop {
			tokio::select! {
				_ = tokio::time::sleep(this.schedule.save_interval) => {},
				_ = stop.changed() => return,
			}
			if !this.running.load(Ordering::SeqCst) {
				return;
			}
			if let Err(err) = this.persist_cycle().await {
				warn!(%err, "persist cycle failed");
				tokio::select! {
					_ = tokio::time::sleep(this.schedule.save_retry_delay) => {},
					_ = stop.changed() => return,
				}
			}
		}
	}
}

fn flatten(snapshot: &Snapshot) -> Vec<ProxyRecord> {
	[
		&snapshot.pools.hot,
		&snapshot.pools.warm,
		&snapshot.pools.cold,
		&snapshot.pools.blacklist,
	]
	.iter()
	.flat_map(|t| t.proxies.iter().cloned())
	.collect()
}

async fn prune_backups(dir: &std::path::Path) -> std::io::Result<()> {
	let mut names = Vec::new();
	let mut entries = tokio::fs::read_dir(dir).await?;
	while let Some(entry) = entries.next_entry().await? {
		let name = entry.file_name().to_string_lossy().to_string();
		if name.starts_with("proxy_pools_") && name.ends_with(".json") {
			names.push(name);
		}
	}
	// Timestamps in the name sort lexicographically; newest last.
	names.sort();
	let excess = names.len().saturating_sub(KEEP_BACKUPS);
	for name in names.into_iter().take(excess) {
		tokio::fs::remove_file(dir.join(name)).await?;
	}
	Ok(())
}
