mod file;
mod mirror;
mod proxyscrape;
mod search;

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
pub use file::FileFetcher;
pub use mirror::MirrorFetcher;
pub use proxyscrape::ProxyScrapeFetcher;
pub use search::SearchFetcher;
use serde::Serialize;

use crate::client::Client;
use crate::config::FetchersConfig;
use crate::metrics::{FetchOutcome, Metrics};
use crate::*;

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
	#[error("request failed: {0}")]
	Request(#[from] reqwest::Error),
	#[error("authentication rejected")]
	AuthRejected,
	#[error("upstream returned status {0}")]
	Status(u16),
	#[error("read failed: {0}")]
	Io(#[from] std::io::Error),
	#[error("invalid source data: {0}")]
	Parse(String),
}

/// A single source of proxy candidates. Implementations are called at most
/// once concurrently by the registry, and must serialize their own outgoing
/// requests with jitter to stay polite toward the source.
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
	/// Stable name used for provenance and per-source counters.
	fn name(&self) -> Strng;

	fn enabled(&self) -> bool {
		true
	}

	/// Produces up to `limit` candidates.
	async fn fetch(&self, limit: Option<usize>) -> Result<Vec<ProxyRecord>, FetchError>;
}

#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStats {
	pub attempts: u64,
	pub successes: u64,
	pub empty: u64,
	pub errors: u64,
	pub total_fetched: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_fetch_time: Option<DateTime<Utc>>,
}

/// Fan-in over all configured sources with per-source accounting and
/// (host, port) deduplication. `fetch_all` is single-flight: concurrent
/// invocations queue behind each other.
pub struct Registry {
	fetchers: Vec<Arc<dyn Fetcher>>,
	stats: Mutex<HashMap<Strng, SourceStats>>,
	single_flight: AsyncMutex<()>,
	limit_per_source: Option<usize>,
	metrics: Arc<Metrics>,
}

impl Registry {
	pub fn new(limit_per_source: Option<usize>, metrics: Arc<Metrics>) -> Registry {
		Registry {
			fetchers: Vec::new(),
			stats: Mutex::new(HashMap::new()),
			single_flight: AsyncMutex::new(()),
			limit_per_source,
			metrics,
		}
	}

	/// Builds the registry from configuration, constructing every enabled
	/// source kind by name.
	pub fn from_config(cfg: &FetchersConfig, client: Client, metrics: Arc<Metrics>) -> Registry {
		let mut registry = Registry::new(cfg.limit_per_source, metrics);
		if let Some(file) = &cfg.file {
			if file.enabled {
				registry.register(Arc::new(FileFetcher::new(file.path.clone())));
			}
		}
		if cfg.proxyscrape.enabled {
			registry.register(Arc::new(ProxyScrapeFetcher::new(
				cfg.proxyscrape.clone(),
				client.clone(),
			)));
		}
		if cfg.mirror.enabled {
			registry.register(Arc::new(MirrorFetcher::new(cfg.mirror.clone(), client.clone())));
		}
		if cfg.search.enabled {
			if cfg.search.api_key.is_some() {
				registry.register(Arc::new(SearchFetcher::new(cfg.search.clone(), client)));
			} else {
				warn!("search source enabled but no api key configured, skipping");
			}
		}
		registry
	}

	pub fn register(&mut self, fetcher: Arc<dyn Fetcher>) {
		info!(source = %fetcher.name(), "registered fetcher");
		self.fetchers.push(fetcher);
	}

	/// Fetches from every enabled source and returns the deduplicated union.
	/// One source failing (or panicking) never fails the batch.
	pub async fn fetch_all(&self) -> Vec<ProxyRecord> {
		let _flight = self.single_flight.lock().await;

		let mut handles = Vec::new();
		for fetcher in self.fetchers.iter().filter(|f| f.enabled()) {
			let name = fetcher.name();
			self.bump(&name, |s| s.attempts += 1);
			self.metrics.record_fetch(&name, FetchOutcome::Attempt);
			let fetcher = fetcher.clone();
			let limit = self.limit_per_source;
			handles.push((name, tokio::spawn(async move { fetcher.fetch(limit).await })));
		}

		let mut merged: Vec<ProxyRecord> = Vec::new();
		let mut seen: HashSet<(Strng, u16)> = HashSet::new();
		for (name, handle) in handles {
			match handle.await {
				Ok(Ok(records)) => {
					let outcome = if records.is_empty() {
						FetchOutcome::Empty
					} else {
						FetchOutcome::Success
					};
					self.metrics.record_fetch(&name, outcome);
					self.bump(&name, |s| {
						if records.is_empty() {
							s.empty += 1;
						} else {
							s.successes += 1;
						}
						s.total_fetched += records.len() as u64;
						s.last_fetch_time = Some(Utc::now());
					});
					debug!(source = %name, count = records.len(), "source fetched");
					for record in records {
						// Protocol collisions on the same host:port keep the
						// first observation.
						if seen.insert((record.key.host.clone(), record.key.port)) {
							merged.push(record);
						}
					}
				},
				Ok(Err(err)) => {
					warn!(source = %name, %err, "source failed");
					self.metrics.record_fetch(&name, FetchOutcome::Error);
					self.bump(&name, |s| s.errors += 1);
				},
				Err(join_err) => {
					warn!(source = %name, err = %join_err, "source panicked");
					self.metrics.record_fetch(&name, FetchOutcome::Error);
					self.bump(&name, |s| s.errors += 1);
				},
			}
		}

		info!(unique = merged.len(), "fetch fan-in complete");
		merged
	}

	/// Read-only per-source counters.
	pub fn stats(&self) -> HashMap<Strng, SourceStats> {
		self.stats.lock().expect("stats lock poisoned").clone()
	}

	fn bump(&self, name: &Strng, f: impl FnOnce(&mut SourceStats)) {
		let mut stats = self.stats.lock().expect("stats lock poisoned");
		f(stats.entry(name.clone()).or_default())
	}
}

/// Parses one `host:port[:protocol]` row. Rows that do not parse are skipped
/// by callers, never fatal. Extra `:user:pass` fields are tolerated.
pub(crate) fn parse_proxy_line(
	line: &str,
	default_protocol: Protocol,
) -> Option<(Strng, u16, Protocol)> {
	let line = line.trim();
	if line.is_empty() || line.starts_with('#') {
		return None;
	}
	let mut parts = line.split(':');
	let host = parts.next()?.trim();
	if host.is_empty() {
		return None;
	}
	let port: u16 = parts.next()?.trim().parse().ok()?;
	if port == 0 {
		return None;
	}
	let protocol = parts
		.next()
		.and_then(|p| p.trim().parse().ok())
		.unwrap_or(default_protocol);
	Some((strng::new(host), port, protocol))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn proxy_lines_parse() {
		assert_eq!(
			parse_proxy_line("1.2.3.4:8080", Protocol::Http),
			Some((strng::new("1.2.3.4"), 8080, Protocol::Http))
		);
		assert_eq!(
			parse_proxy_line("1.2.3.4:1080:socks5", Protocol::Http),
			Some((strng::new("1.2.3.4"), 1080, Protocol::Socks5))
		);
		// user:pass rows keep the default protocol
		assert_eq!(
			parse_proxy_line("1.2.3.4:8080:user:pass", Protocol::Socks4),
			Some((strng::new("1.2.3.4"), 8080, Protocol::Socks4))
		);
	}

	#[test]
	fn junk_lines_are_skipped() {
		for line in ["", "   ", "# comment", "no-port", "host:notaport", "host:0", ":8080"] {
			assert_eq!(parse_proxy_line(line, Protocol::Http), None, "{line:?}");
		}
	}
}
