mod snapshot;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use itertools::Itertools;
use rand::seq::IteratorRandom;
use serde::Serialize;
pub use snapshot::{PoolsSnapshot, Snapshot, TierSnapshot};

use crate::config::PoolConfig;
use crate::metrics::{Metrics, TierLabel, TierMove};
use crate::score::{Thresholds, classify};
use crate::validate::ValidationResult;
use crate::*;

/// A short-lived exclusive grant of one proxy to one caller.
#[derive(Debug, Clone)]
pub struct Lease {
	pub acquired_at: DateTime<Utc>,
	pub ttl: Duration,
}

impl Lease {
	fn is_expired(&self, now: DateTime<Utc>) -> bool {
		now
			.signed_duration_since(self.acquired_at)
			.to_std()
			.map(|age| age > self.ttl)
			.unwrap_or(false)
	}
}

struct TierPool {
	tier: Tier,
	capacity: usize,
	// Insertion-ordered so overflow can evict the oldest resident.
	proxies: IndexMap<ProxyKey, ProxyRecord>,
	last_leased: HashMap<ProxyKey, DateTime<Utc>>,
}

impl TierPool {
	fn new(tier: Tier, capacity: usize) -> TierPool {
		TierPool {
			tier,
			capacity,
			proxies: IndexMap::new(),
			last_leased: HashMap::new(),
		}
	}

	/// Inserts a record, evicting the oldest resident when full. Returns the
	/// evicted record, if any.
	fn insert(&mut self, record: ProxyRecord) -> Option<ProxyRecord> {
		let mut evicted = None;
		if !self.proxies.contains_key(&record.key) && self.proxies.len() >= self.capacity {
			if let Some((key, record)) = self.proxies.shift_remove_index(0) {
				self.last_leased.remove(&key);
				evicted = Some(record);
			}
		}
		self.proxies.insert(record.key.clone(), record);
		evicted
	}

	fn remove(&mut self, key: &ProxyKey) -> Option<ProxyRecord> {
		self.last_leased.remove(key);
		self.proxies.shift_remove(key)
	}

	/// Picks one eligible key by this tier's strategy: Hot takes the fastest,
	/// Warm round-robins by least-recent lease, Cold picks uniformly.
	fn select(&self, filter: Option<&ProxyFilter>, excluded: &HashSet<ProxyKey>) -> Option<ProxyKey> {
		let eligible = self.proxies.values().filter(|r| {
			r.status == Status::Active
				&& !excluded.contains(&r.key)
				&& filter.is_none_or(|f| f.matches(r))
		});
		match self.tier {
			Tier::Hot => eligible
				.min_by_key(|r| r.metrics.response_time_ms.unwrap_or(u64::MAX))
				.map(|r| r.key.clone()),
			Tier::Warm => eligible
				.min_by_key(|r| {
					self
						.last_leased
						.get(&r.key)
						.copied()
						.unwrap_or(DateTime::<Utc>::MIN_UTC)
				})
				.map(|r| r.key.clone()),
			Tier::Cold => eligible.choose(&mut rand::rng()).map(|r| r.key.clone()),
			Tier::Blacklist => None,
		}
	}

	fn due_for_revalidation(&self, cutoff: DateTime<Utc>) -> impl Iterator<Item = &ProxyRecord> {
		self
			.proxies
			.values()
			.filter(move |r| r.last_checked.is_none_or(|checked| checked < cutoff))
	}
}

struct Inner {
	hot: TierPool,
	warm: TierPool,
	cold: TierPool,
	blacklist: TierPool,
	leases: HashMap<ProxyKey, Lease>,
}

impl Inner {
	fn tier(&self, tier: Tier) -> &TierPool {
		match tier {
			Tier::Hot => &self.hot,
			Tier::Warm => &self.warm,
			Tier::Cold => &self.cold,
			Tier::Blacklist => &self.blacklist,
		}
	}

	fn tier_mut(&mut self, tier: Tier) -> &mut TierPool {
		match tier {
			Tier::Hot => &mut self.hot,
			Tier::Warm => &mut self.warm,
			Tier::Cold => &mut self.cold,
			Tier::Blacklist => &mut self.blacklist,
		}
	}

	fn tier_of(&self, key: &ProxyKey) -> Option<Tier> {
		Tier::ALL
			.into_iter()
			.find(|&t| self.tier(t).proxies.contains_key(key))
	}

	fn reap_expired_leases(&mut self, now: DateTime<Utc>) {
		self.leases.retain(|_, lease| !lease.is_expired(now));
	}
}

/// Read-only view of one tier, computed on demand.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierStats {
	pub tier: Tier,
	pub total: usize,
	pub active: usize,
	pub average_score: f64,
	pub average_response_time_ms: f64,
	pub success_rate: f64,
	pub protocol_distribution: BTreeMap<String, usize>,
	pub anonymity_distribution: BTreeMap<String, usize>,
	pub country_distribution: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
	pub tiers: Vec<TierStats>,
	pub total: usize,
	pub total_active: usize,
	pub active_leases: usize,
}

/// Sharded in-memory store of proxies by quality tier. Every operation takes
/// the manager-wide lock, so tier membership and the lease table always agree
/// and no observer ever sees a record in two tiers.
pub struct PoolManager {
	inner: Mutex<Inner>,
	cfg: PoolConfig,
	thresholds: Thresholds,
	metrics: Arc<Metrics>,
}

impl PoolManager {
	pub fn new(cfg: PoolConfig, thresholds: Thresholds, metrics: Arc<Metrics>) -> PoolManager {
		let inner = Inner {
			hot: TierPool::new(Tier::Hot, cfg.capacity(Tier::Hot)),
			warm: TierPool::new(Tier::Warm, cfg.capacity(Tier::Warm)),
			cold: TierPool::new(Tier::Cold, cfg.capacity(Tier::Cold)),
			blacklist: TierPool::new(Tier::Blacklist, cfg.capacity(Tier::Blacklist)),
			leases: HashMap::new(),
		};
		PoolManager {
			inner: Mutex::new(inner),
			cfg,
			thresholds,
			metrics,
		}
	}

	/// Places each record into its scorer-proposed tier. A record whose
	/// identity is already pooled is updated in place instead; the population
	/// only grows on genuinely new identities.
	pub fn add_many(&self, records: Vec<ProxyRecord>) {
		let mut inner = self.lock();
		let mut added = 0usize;
		for mut record in records {
			if let Some(current) = inner.tier_of(&record.key) {
				if let Some(existing) = inner.tier_mut(current).proxies.get_mut(&record.key) {
					existing.merge_candidate(&record);
				}
				continue;
			}
			let (score, tier) = classify(&record, &self.thresholds);
			record.score = score;
			if tier == Tier::Blacklist {
				record.status = Status::Blacklisted;
			}
			self.insert_into(&mut inner, tier, record);
			added += 1;
		}
		debug!(added, "pool add complete");
	}

	/// Chooses one leasable record, consulting tiers in preference order.
	/// Expired leases are reaped first; proxies under an unexpired lease are
	/// skipped, up to the configured number of misses per tier.
	pub fn acquire(&self, filter: Option<&ProxyFilter>, preference: &[Tier]) -> Option<ProxyRecord> {
		let now = Utc::now();
		let mut inner = self.lock();
		inner.reap_expired_leases(now);

		for &tier in preference {
			if tier == Tier::Blacklist {
				continue;
			}
			let mut tried: HashSet<ProxyKey> = HashSet::new();
			for _ in 0..self.cfg.selection_retries {
				let Some(key) = inner.tier(tier).select(filter, &tried) else {
					break;
				};
				if inner.leases.contains_key(&key) {
					tried.insert(key);
					continue;
				}
				inner.leases.insert(
					key.clone(),
					Lease {
						acquired_at: now,
						ttl: self.cfg.lease_ttl,
					},
				);
				let pool = inner.tier_mut(tier);
				pool.last_leased.insert(key.clone(), now);
				let record = pool.proxies.get(&key)?.clone();
				debug!(proxy = %record.key, %tier, "leased");
				return Some(record);
			}
		}
		None
	}

	/// Releases a lease before its TTL expires. Unknown identities are a
	/// no-op.
	pub fn release(&self, key: &ProxyKey) {
		let mut inner = self.lock();
		if inner.leases.remove(key).is_some() {
			debug!(proxy = %key, "lease returned");
		}
	}

	/// Records whose `last_checked` is older than their tier's revalidation
	/// interval. Never-checked records are always due.
	pub fn revalidate_due(&self) -> Vec<ProxyRecord> {
		let now = Utc::now();
		let inner = self.lock();
		let mut due = Vec::new();
		for tier in Tier::ALL {
			let cutoff = cutoff(now, self.cfg.revalidate_interval(tier));
			due.extend(inner.tier(tier).due_for_revalidation(cutoff).cloned());
		}
		due
	}

	/// Applies fresh measurements and moves records whose tier changed.
	/// Each move is atomic under the manager lock.
	pub fn rebalance(&self, results: &[ValidationResult]) {
		let mut inner = self.lock();
		let mut moves = 0usize;
		for result in results {
			let Some(current) = inner.tier_of(&result.key) else {
				continue;
			};
			let Some(mut record) = inner.tier_mut(current).remove(&result.key) else {
				continue;
			};
			record.apply_validation(result);
			let (score, tier) = classify(&record, &self.thresholds);
			record.score = score;
			if tier == Tier::Blacklist {
				record.status = Status::Blacklisted;
			}
			if tier != current {
				moves += 1;
				self
					.metrics
					.tier_moves
					.get_or_create(&TierMove {
						from: current.name(),
						to: tier.name(),
					})
					.inc();
				debug!(proxy = %record.key, from = %current, to = %tier, "tier change");
			}
			self.insert_into(&mut inner, tier, record);
		}
		if moves > 0 {
			info!(moves, measured = results.len(), "rebalance complete");
		}
	}

	/// Purges blacklisted records untouched for longer than the purge window.
	pub fn cleanup_blacklist(&self) -> usize {
		let cutoff = cutoff(Utc::now(), self.cfg.purge_after);
		let mut inner = self.lock();
		let stale: Vec<ProxyKey> = inner
			.blacklist
			.proxies
			.values()
			.filter(|r| r.updated_at < cutoff)
			.map(|r| r.key.clone())
			.collect();
		for key in &stale {
			inner.blacklist.remove(key);
			inner.leases.remove(key);
		}
		if !stale.is_empty() {
			self.metrics.blacklist_purged.inc_by(stale.len() as u64);
			info!(purged = stale.len(), "blacklist cleanup complete");
		}
		stale.len()
	}

	pub fn snapshot(&self) -> Snapshot {
		let inner = self.lock();
		let dump = |tier: Tier| TierSnapshot {
			proxies: inner.tier(tier).proxies.values().cloned().collect(),
		};
		Snapshot {
			timestamp: Utc::now(),
			pools: PoolsSnapshot {
				hot: dump(Tier::Hot),
				warm: dump(Tier::Warm),
				cold: dump(Tier::Cold),
				blacklist: dump(Tier::Blacklist),
			},
		}
	}

	/// Loads a snapshot. Identity conflicts are resolved first-wins: a record
	/// already loaded (or already pooled) is never overwritten.
	pub fn restore(&self, snapshot: Snapshot) {
		let mut inner = self.lock();
		let mut restored = 0usize;
		for tier in Tier::ALL {
			let records = match tier {
				Tier::Hot => &snapshot.pools.hot,
				Tier::Warm => &snapshot.pools.warm,
				Tier::Cold => &snapshot.pools.cold,
				Tier::Blacklist => &snapshot.pools.blacklist,
			};
			for record in &records.proxies {
				if inner.tier_of(&record.key).is_some() {
					continue;
				}
				self.insert_into(&mut inner, tier, record.clone());
				restored += 1;
			}
		}
		info!(restored, "pool state restored");
	}

	/// Active, servable proxies as plain `host:port` lines.
	pub fn export_text(&self) -> String {
		let inner = self.lock();
		Tier::SERVABLE
			.into_iter()
			.flat_map(|tier| inner.tier(tier).proxies.values())
			.filter(|record| record.status == Status::Active)
			.map(|record| format!("{}:{}", record.key.host, record.key.port))
			.join("\n")
	}

	pub fn stats(&self) -> PoolStats {
		let inner = self.lock();
		let tiers: Vec<TierStats> = Tier::ALL
			.into_iter()
			.map(|t| tier_stats(inner.tier(t)))
			.collect();
		PoolStats {
			total: tiers.iter().map(|t| t.total).sum(),
			total_active: tiers.iter().map(|t| t.active).sum(),
			active_leases: inner.leases.len(),
			tiers,
		}
	}

	pub fn tier_of(&self, key: &ProxyKey) -> Option<Tier> {
		self.lock().tier_of(key)
	}

	pub fn get(&self, key: &ProxyKey) -> Option<ProxyRecord> {
		let inner = self.lock();
		let tier = inner.tier_of(key)?;
		inner.tier(tier).proxies.get(key).cloned()
	}

	pub fn len(&self, tier: Tier) -> usize {
		self.lock().tier(tier).proxies.len()
	}

	pub fn is_empty(&self) -> bool {
		let inner = self.lock();
		Tier::ALL.into_iter().all(|t| inner.tier(t).proxies.is_empty())
	}

	pub fn active_leases(&self) -> usize {
		self.lock().leases.len()
	}

	fn insert_into(&self, inner: &mut Inner, tier: Tier, record: ProxyRecord) {
		if let Some(evicted) = inner.tier_mut(tier).insert(record) {
			self
				.metrics
				.pool_evictions
				.get_or_create(&TierLabel { tier: tier.name() })
				.inc();
			inner.leases.remove(&evicted.key);
			debug!(proxy = %evicted.key, %tier, "evicted oldest record from full tier");
		}
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
		self.inner.lock().expect("pool lock poisoned")
	}
}

fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
	chrono::Duration::from_std(age)
		.ok()
		.and_then(|age| now.checked_sub_signed(age))
		.unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn tier_stats(pool: &TierPool) -> TierStats {
	let active: Vec<&ProxyRecord> = pool
		.proxies
		.values()
		.filter(|r| r.status == Status::Active)
		.collect();

	let mut protocol_distribution = BTreeMap::new();
	let mut anonymity_distribution = BTreeMap::new();
	let mut country_distribution = BTreeMap::new();
	for record in &active {
		*protocol_distribution
			.entry(record.key.protocol.to_string())
			.or_default() += 1;
		*anonymity_distribution
			.entry(format!("{:?}", record.anonymity).to_lowercase())
			.or_default() += 1;
		if let Some(country) = &record.country {
			*country_distribution.entry(country.to_string()).or_default() += 1;
		}
	}

	let average_score = mean(active.iter().map(|r| r.score));
	let average_response_time_ms = mean(
		active
			.iter()
			.filter_map(|r| r.metrics.response_time_ms)
			.map(|rt| rt as f64),
	);
	let total_requests: u64 = active.iter().map(|r| r.metrics.total_requests).sum();
	let successful: u64 = active.iter().map(|r| r.metrics.successful_requests).sum();
	let success_rate = if total_requests > 0 {
		successful as f64 / total_requests as f64
	} else {
		0.0
	};

	TierStats {
		tier: pool.tier,
		total: pool.proxies.len(),
		active: active.len(),
		average_score,
		average_response_time_ms,
		success_rate,
		protocol_distribution,
		anonymity_distribution,
		country_distribution,
	}
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
	let mut sum = 0.0;
	let mut count = 0usize;
	for v in values {
		sum += v;
		count += 1;
	}
	if count > 0 { sum / count as f64 } else { 0.0 }
}
