use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::score::Thresholds;
use crate::*;

/// Fully-validated runtime configuration. Constructed once at startup and
/// handed by reference into every component; nothing mutates it afterwards.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
	pub validator: ValidatorConfig,
	pub thresholds: Thresholds,
	pub pool: PoolConfig,
	pub schedule: ScheduleConfig,
	pub fetchers: FetchersConfig,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub store: Option<StoreConfig>,
	pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorConfig {
	pub max_concurrent: usize,
	#[serde(with = "serdes::dur")]
	pub timeout: Duration,
	pub retry_count: u32,
	#[serde(with = "serdes::dur")]
	pub retry_delay: Duration,
	pub batch_size: usize,
	#[serde(with = "serdes::dur")]
	pub chunk_pause: Duration,
	pub echo: EchoConfig,
}

impl Default for ValidatorConfig {
	fn default() -> Self {
		ValidatorConfig {
			max_concurrent: 50,
			timeout: Duration::from_secs(10),
			retry_count: 2,
			retry_delay: Duration::from_secs(1),
			batch_size: 100,
			chunk_pause: Duration::from_secs(1),
			echo: EchoConfig::default(),
		}
	}
}

/// Allow-list of echo endpoints used for probing. No vendor is hard-coded
/// beyond the defaults; operators point these at their own equivalents.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EchoConfig {
	/// URLs answering `{"origin": "<client-ip>"}`. Must contain at least one
	/// http and one https entry so every proxy protocol has a match.
	pub ip_urls: Vec<String>,
	/// URLs echoing the received request headers back as JSON.
	pub headers_urls: Vec<String>,
	/// Geolocation lookup endpoint; the detected IP is appended to the path.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub geolocation_url: Option<String>,
}

impl Default for EchoConfig {
	fn default() -> Self {
		EchoConfig {
			ip_urls: vec![
				"http://httpbin.org/ip".to_string(),
				"https://httpbin.org/ip".to_string(),
			],
			headers_urls: vec![
				"http://httpbin.org/headers".to_string(),
				"https://httpbin.org/headers".to_string(),
			],
			geolocation_url: Some("http://ip-api.com/json/".to_string()),
		}
	}
}

impl EchoConfig {
	/// Picks the echo-ip URL matching the probe transport: https proxies are
	/// exercised over https, everything else over plain http.
	pub fn ip_url_for(&self, protocol: Protocol) -> Option<&str> {
		Self::pick(&self.ip_urls, protocol)
	}

	pub fn headers_url_for(&self, protocol: Protocol) -> Option<&str> {
		Self::pick(&self.headers_urls, protocol)
	}

	fn pick(urls: &[String], protocol: Protocol) -> Option<&str> {
		let want_https = protocol == Protocol::Https;
		urls
			.iter()
			.find(|u| u.starts_with("https://") == want_https)
			.or_else(|| urls.first())
			.map(|s| s.as_str())
	}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
	pub hot_max: usize,
	pub warm_max: usize,
	pub cold_max: usize,
	pub blacklist_max: usize,
	#[serde(with = "serdes::dur")]
	pub revalidate_hot: Duration,
	#[serde(with = "serdes::dur")]
	pub revalidate_warm: Duration,
	#[serde(with = "serdes::dur")]
	pub revalidate_cold: Duration,
	#[serde(with = "serdes::dur")]
	pub revalidate_blacklist: Duration,
	#[serde(with = "serdes::dur")]
	pub purge_after: Duration,
	#[serde(with = "serdes::dur")]
	pub lease_ttl: Duration,
	pub selection_retries: usize,
}

impl Default for PoolConfig {
	fn default() -> Self {
		PoolConfig {
			hot_max: 100,
			warm_max: 500,
			cold_max: 1_000,
			blacklist_max: 2_000,
			revalidate_hot: Duration::from_secs(3_600),
			revalidate_warm: Duration::from_secs(6 * 3_600),
			revalidate_cold: Duration::from_secs(24 * 3_600),
			revalidate_blacklist: Duration::from_secs(7 * 86_400),
			purge_after: Duration::from_secs(7 * 86_400),
			lease_ttl: Duration::from_secs(30),
			selection_retries: 5,
		}
	}
}

impl PoolConfig {
	pub fn capacity(&self, tier: Tier) -> usize {
		match tier {
			Tier::Hot => self.hot_max,
			Tier::Warm => self.warm_max,
			Tier::Cold => self.cold_max,
			Tier::Blacklist => self.blacklist_max,
		}
	}

	pub fn revalidate_interval(&self, tier: Tier) -> Duration {
		match tier {
			Tier::Hot => self.revalidate_hot,
			Tier::Warm => self.revalidate_warm,
			Tier::Cold => self.revalidate_cold,
			Tier::Blacklist => self.revalidate_blacklist,
		}
	}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleConfig {
	#[serde(with = "serdes::dur")]
	pub fetch_interval: Duration,
	#[serde(with = "serdes::dur")]
	pub cleanup_interval: Duration,
	#[serde(with = "serdes::dur")]
	pub save_interval: Duration,
	#[serde(with = "serdes::dur")]
	pub fetch_retry_delay: Duration,
	#[serde(with = "serdes::dur")]
	pub cleanup_retry_delay: Duration,
	#[serde(with = "serdes::dur")]
	pub save_retry_delay: Duration,
	#[serde(with = "serdes::dur")]
	pub shutdown_deadline: Duration,
}

impl Default for ScheduleConfig {
	fn default() -> Self {
		ScheduleConfig {
			fetch_interval: Duration::from_secs(6 * 3_600),
			cleanup_interval: Duration::from_secs(12 * 3_600),
			save_interval: Duration::from_secs(5 * 60),
			fetch_retry_delay: Duration::from_secs(300),
			cleanup_retry_delay: Duration::from_secs(300),
			save_retry_delay: Duration::from_secs(60),
			shutdown_deadline: Duration::from_secs(30),
		}
	}
}

/// Uniform-random delay between a fetcher's own outgoing requests, so no
/// upstream source sees a burst.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JitterRange {
	#[serde(with = "serdes::dur")]
	pub min: Duration,
	#[serde(with = "serdes::dur")]
	pub max: Duration,
}

impl Default for JitterRange {
	fn default() -> Self {
		JitterRange {
			min: Duration::from_millis(500),
			max: Duration::from_secs(2),
		}
	}
}

impl JitterRange {
	pub fn sample(&self) -> Duration {
		let (min, max) = (self.min.as_secs_f64(), self.max.as_secs_f64());
		if max <= min {
			return self.min;
		}
		Duration::from_secs_f64(rand::rng().random_range(min..=max))
	}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchersConfig {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub limit_per_source: Option<usize>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub file: Option<FileSourceConfig>,
	pub proxyscrape: ProxyScrapeConfig,
	pub mirror: MirrorConfig,
	pub search: SearchConfig,
}

impl Default for FetchersConfig {
	fn default() -> Self {
		FetchersConfig {
			limit_per_source: None,
			file: None,
			proxyscrape: ProxyScrapeConfig::default(),
			mirror: MirrorConfig::default(),
			search: SearchConfig::default(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FileSourceConfig {
	#[serde(default = "default_true")]
	pub enabled: bool,
	pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyScrapeConfig {
	pub enabled: bool,
	pub base_url: String,
	#[serde(skip_serializing)]
	pub api_key: Option<String>,
	pub protocols: Vec<Protocol>,
	pub jitter: JitterRange,
}

impl Default for ProxyScrapeConfig {
	fn default() -> Self {
		ProxyScrapeConfig {
			enabled: true,
			base_url: "https://api.proxyscrape.com/v2/".to_string(),
			api_key: None,
			protocols: vec![Protocol::Http, Protocol::Socks4, Protocol::Socks5],
			jitter: JitterRange::default(),
		}
	}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorConfig {
	pub enabled: bool,
	pub base_url: String,
	#[serde(skip_serializing)]
	pub token: Option<String>,
	pub sources: Vec<MirrorSource>,
	pub jitter: JitterRange,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MirrorSource {
	pub repo: String,
	#[serde(default = "default_branch")]
	pub branch: String,
	pub files: Vec<String>,
}

fn default_branch() -> String {
	"main".to_string()
}

impl Default for MirrorConfig {
	fn default() -> Self {
		MirrorConfig {
			enabled: true,
			base_url: "https://raw.githubusercontent.com".to_string(),
			token: None,
			sources: vec![
				MirrorSource {
					repo: "proxifly/free-proxy-list".to_string(),
					branch: "main".to_string(),
					files: vec![
						"proxies/http.txt".to_string(),
						"proxies/https.txt".to_string(),
						"proxies/socks4.txt".to_string(),
						"proxies/socks5.txt".to_string(),
					],
				},
				MirrorSource {
					repo: "TheSpeedX/PROXY-List".to_string(),
					branch: "master".to_string(),
					files: vec![
						"http.txt".to_string(),
						"socks4.txt".to_string(),
						"socks5.txt".to_string(),
					],
				},
			],
			jitter: JitterRange::default(),
		}
	}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchConfig {
	pub enabled: bool,
	pub base_url: String,
	#[serde(skip_serializing)]
	pub api_key: Option<String>,
	pub queries: Vec<String>,
	pub per_query_limit: usize,
	pub jitter: JitterRange,
}

impl Default for SearchConfig {
	fn default() -> Self {
		SearchConfig {
			// Off by default: it needs a paid credential.
			enabled: false,
			base_url: "https://api.shodan.io".to_string(),
			api_key: None,
			queries: vec![
				"port:8080 proxy".to_string(),
				"port:3128 proxy".to_string(),
				"port:1080 socks".to_string(),
			],
			per_query_limit: 50,
			jitter: JitterRange {
				min: Duration::from_secs(3),
				max: Duration::from_secs(5),
			},
		}
	}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
	#[serde(skip_serializing)]
	pub url: String,
	pub min_connections: usize,
	pub max_connections: usize,
	#[serde(with = "serdes::dur")]
	pub op_timeout: Duration,
}

// ---------------------------------------------------------------------------
// Raw (file) form. Everything optional; defaults and env overrides are folded
// in by parse_config.

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawConfig {
	validator: Option<RawValidator>,
	scorer: Option<RawScorer>,
	pools: Option<RawPools>,
	revalidate: Option<RawRevalidate>,
	blacklist: Option<RawBlacklist>,
	lease: Option<RawLease>,
	orchestrator: Option<RawOrchestrator>,
	fetchers: Option<RawFetchers>,
	echo: Option<RawEcho>,
	store: Option<RawStore>,
	data_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawValidator {
	max_concurrent: Option<usize>,
	#[serde(default, with = "serdes::dur_option")]
	timeout: Option<Duration>,
	retry_count: Option<u32>,
	#[serde(default, with = "serdes::dur_option")]
	retry_delay: Option<Duration>,
	batch_size: Option<usize>,
	#[serde(default, with = "serdes::dur_option")]
	chunk_pause: Option<Duration>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawScorer {
	theta_hot: Option<f64>,
	theta_warm: Option<f64>,
	theta_cold: Option<f64>,
	tau_hot_ms: Option<u64>,
	tau_warm_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawPools {
	hot_max: Option<usize>,
	warm_max: Option<usize>,
	cold_max: Option<usize>,
	blacklist_max: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawRevalidate {
	#[serde(default, with = "serdes::dur_option")]
	hot: Option<Duration>,
	#[serde(default, with = "serdes::dur_option")]
	warm: Option<Duration>,
	#[serde(default, with = "serdes::dur_option")]
	cold: Option<Duration>,
	#[serde(default, with = "serdes::dur_option")]
	blacklist: Option<Duration>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawBlacklist {
	consecutive_failures_trigger: Option<u32>,
	#[serde(default, with = "serdes::dur_option")]
	purge_after: Option<Duration>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawLease {
	#[serde(default, with = "serdes::dur_option")]
	default_ttl: Option<Duration>,
	selection_retries: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawOrchestrator {
	#[serde(default, with = "serdes::dur_option")]
	fetch_interval: Option<Duration>,
	#[serde(default, with = "serdes::dur_option")]
	cleanup_interval: Option<Duration>,
	#[serde(default, with = "serdes::dur_option")]
	save_interval: Option<Duration>,
	#[serde(default, with = "serdes::dur_option")]
	shutdown_deadline: Option<Duration>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawFetchers {
	limit_per_source: Option<usize>,
	file: Option<FileSourceConfig>,
	proxyscrape: Option<RawProxyScrape>,
	mirror: Option<RawMirror>,
	search: Option<RawSearch>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawJitter {
	#[serde(default, with = "serdes::dur_option")]
	min: Option<Duration>,
	#[serde(default, with = "serdes::dur_option")]
	max: Option<Duration>,
}

impl RawJitter {
	fn build(raw: Option<Self>, mut base: JitterRange) -> JitterRange {
		if let Some(raw) = raw {
			if let Some(min) = raw.min {
				base.min = min;
			}
			if let Some(max) = raw.max {
				base.max = max;
			}
		}
		base
	}
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawProxyScrape {
	enabled: Option<bool>,
	base_url: Option<String>,
	api_key: Option<String>,
	protocols: Option<Vec<Protocol>>,
	jitter: Option<RawJitter>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawMirror {
	enabled: Option<bool>,
	base_url: Option<String>,
	token: Option<String>,
	sources: Option<Vec<MirrorSource>>,
	jitter: Option<RawJitter>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawSearch {
	enabled: Option<bool>,
	base_url: Option<String>,
	api_key: Option<String>,
	queries: Option<Vec<String>>,
	per_query_limit: Option<usize>,
	jitter: Option<RawJitter>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawEcho {
	ip_urls: Option<Vec<String>>,
	headers_urls: Option<Vec<String>>,
	geolocation_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawStore {
	url: Option<String>,
	min_connections: Option<usize>,
	max_connections: Option<usize>,
	#[serde(default, with = "serdes::dur_option")]
	op_timeout: Option<Duration>,
}

fn default_true() -> bool {
	true
}

pub fn parse_config(contents: String) -> anyhow::Result<Config> {
	let raw: RawConfig = serde_yaml::from_str(&contents).context("invalid configuration file")?;

	let validator = {
		let r = raw.validator.unwrap_or_default();
		let d = ValidatorConfig::default();
		let echo = {
			let r = raw.echo.unwrap_or_default();
			let d = EchoConfig::default();
			EchoConfig {
				ip_urls: r.ip_urls.unwrap_or(d.ip_urls),
				headers_urls: r.headers_urls.unwrap_or(d.headers_urls),
				geolocation_url: r.geolocation_url.or(d.geolocation_url),
			}
		};
		ValidatorConfig {
			max_concurrent: r.max_concurrent.unwrap_or(d.max_concurrent),
			timeout: parse_duration("VALIDATOR_TIMEOUT")?
				.or(r.timeout)
				.unwrap_or(d.timeout),
			retry_count: r.retry_count.unwrap_or(d.retry_count),
			retry_delay: r.retry_delay.unwrap_or(d.retry_delay),
			batch_size: r.batch_size.unwrap_or(d.batch_size),
			chunk_pause: r.chunk_pause.unwrap_or(d.chunk_pause),
			echo,
		}
	};

	let thresholds = {
		let r = raw.scorer.unwrap_or_default();
		let b = raw.blacklist.as_ref();
		let d = Thresholds::default();
		Thresholds {
			theta_hot: r.theta_hot.unwrap_or(d.theta_hot),
			theta_warm: r.theta_warm.unwrap_or(d.theta_warm),
			theta_cold: r.theta_cold.unwrap_or(d.theta_cold),
			tau_hot_ms: r.tau_hot_ms.unwrap_or(d.tau_hot_ms),
			tau_warm_ms: r.tau_warm_ms.unwrap_or(d.tau_warm_ms),
			blacklist_trigger: b
				.and_then(|b| b.consecutive_failures_trigger)
				.unwrap_or(d.blacklist_trigger),
		}
	};

	let pool = {
		let p = raw.pools.unwrap_or_default();
		let rv = raw.revalidate.unwrap_or_default();
		let b = raw.blacklist.unwrap_or_default();
		let l = raw.lease.unwrap_or_default();
		let d = PoolConfig::default();
		PoolConfig {
			hot_max: p.hot_max.unwrap_or(d.hot_max),
			warm_max: p.warm_max.unwrap_or(d.warm_max),
			cold_max: p.cold_max.unwrap_or(d.cold_max),
			blacklist_max: p.blacklist_max.unwrap_or(d.blacklist_max),
			revalidate_hot: rv.hot.unwrap_or(d.revalidate_hot),
			revalidate_warm: rv.warm.unwrap_or(d.revalidate_warm),
			revalidate_cold: rv.cold.unwrap_or(d.revalidate_cold),
			revalidate_blacklist: rv.blacklist.unwrap_or(d.revalidate_blacklist),
			purge_after: b.purge_after.unwrap_or(d.purge_after),
			lease_ttl: l.default_ttl.unwrap_or(d.lease_ttl),
			selection_retries: l.selection_retries.unwrap_or(d.selection_retries),
		}
	};

	let schedule = {
		let r = raw.orchestrator.unwrap_or_default();
		let d = ScheduleConfig::default();
		ScheduleConfig {
			fetch_interval: parse_duration("FETCH_INTERVAL")?
				.or(r.fetch_interval)
				.unwrap_or(d.fetch_interval),
			cleanup_interval: r.cleanup_interval.unwrap_or(d.cleanup_interval),
			save_interval: r.save_interval.unwrap_or(d.save_interval),
			shutdown_deadline: r.shutdown_deadline.unwrap_or(d.shutdown_deadline),
			..d
		}
	};

	let fetchers = {
		let r = raw.fetchers.unwrap_or_default();
		let ps = {
			let r = r.proxyscrape.unwrap_or_default();
			let d = ProxyScrapeConfig::default();
			ProxyScrapeConfig {
				enabled: r.enabled.unwrap_or(d.enabled),
				base_url: r.base_url.unwrap_or(d.base_url),
				api_key: empty_to_none(parse("PROXYSCRAPE_API_KEY")?).or(r.api_key),
				protocols: r.protocols.unwrap_or(d.protocols),
				jitter: RawJitter::build(r.jitter, d.jitter),
			}
		};
		let mirror = {
			let r = r.mirror.unwrap_or_default();
			let d = MirrorConfig::default();
			MirrorConfig {
				enabled: r.enabled.unwrap_or(d.enabled),
				base_url: r.base_url.unwrap_or(d.base_url),
				token: empty_to_none(parse("MIRROR_TOKEN")?).or(r.token),
				sources: r.sources.unwrap_or(d.sources),
				jitter: RawJitter::build(r.jitter, d.jitter),
			}
		};
		let search = {
			let r = r.search.unwrap_or_default();
			let d = SearchConfig::default();
			SearchConfig {
				enabled: r.enabled.unwrap_or(d.enabled),
				base_url: r.base_url.unwrap_or(d.base_url),
				api_key: empty_to_none(parse("SEARCH_API_KEY")?).or(r.api_key),
				queries: r.queries.unwrap_or(d.queries),
				per_query_limit: r.per_query_limit.unwrap_or(d.per_query_limit),
				jitter: RawJitter::build(r.jitter, d.jitter),
			}
		};
		FetchersConfig {
			limit_per_source: r.limit_per_source,
			file: r.file,
			proxyscrape: ps,
			mirror,
			search,
		}
	};

	let store = {
		let r = raw.store.unwrap_or_default();
		let url = empty_to_none(parse("DATABASE_URL")?).or(r.url);
		url.map(|url| StoreConfig {
			url,
			min_connections: r.min_connections.unwrap_or(2),
			max_connections: r.max_connections.unwrap_or(10),
			op_timeout: r.op_timeout.unwrap_or(Duration::from_secs(60)),
		})
	};

	let config = Config {
		validator,
		thresholds,
		pool,
		schedule,
		fetchers,
		store,
		data_dir: parse::<PathBuf>("DATA_DIR")?
			.or(raw.data_dir)
			.unwrap_or_else(|| PathBuf::from("data/proxies")),
	};
	config.validate()?;
	Ok(config)
}

impl Config {
	fn validate(&self) -> anyhow::Result<()> {
		self.thresholds.validate()?;
		for tier in Tier::ALL {
			if self.pool.capacity(tier) == 0 {
				anyhow::bail!("{tier} pool capacity must be positive");
			}
			if self.pool.revalidate_interval(tier).is_zero() {
				anyhow::bail!("{tier} revalidation interval must be positive");
			}
		}
		if self.pool.lease_ttl.is_zero() {
			anyhow::bail!("lease ttl must be positive");
		}
		if self.pool.selection_retries == 0 {
			anyhow::bail!("lease selection retries must be positive");
		}
		if self.validator.max_concurrent == 0 || self.validator.batch_size == 0 {
			anyhow::bail!("validator concurrency and batch size must be positive");
		}
		let echo = &self.validator.echo;
		if echo.ip_urls.is_empty() || echo.headers_urls.is_empty() {
			anyhow::bail!("echo-ip and headers-echo allow-lists must not be empty");
		}
		if !echo.ip_urls.iter().any(|u| u.starts_with("http://"))
			|| !echo.ip_urls.iter().any(|u| u.starts_with("https://"))
		{
			warn!("echo-ip allow-list should carry both an http and an https endpoint");
		}
		if let Some(store) = &self.store {
			if store.min_connections > store.max_connections {
				anyhow::bail!("store minConnections exceeds maxConnections");
			}
		}
		Ok(())
	}
}

fn parse<T: FromStr>(env: &str) -> anyhow::Result<Option<T>>
where
	<T as FromStr>::Err: ToString,
{
	match env::var(env) {
		Ok(val) => val
			.parse()
			.map(|v| Some(v))
			.map_err(|e: <T as FromStr>::Err| {
				anyhow::anyhow!("invalid env var {}={} ({})", env, val, e.to_string())
			}),
		Err(_) => Ok(None),
	}
}

fn parse_duration(env: &str) -> anyhow::Result<Option<Duration>> {
	parse::<String>(env)?
		.map(|ds| {
			duration_str::parse(&ds).map_err(|e| anyhow::anyhow!("invalid env var {}={} ({})", env, ds, e))
		})
		.transpose()
}

fn empty_to_none(inp: Option<String>) -> Option<String> {
	inp.filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_config_gets_defaults() {
		let cfg = parse_config("{}".to_string()).unwrap();
		assert_eq!(cfg.validator.max_concurrent, 50);
		assert_eq!(cfg.validator.timeout, Duration::from_secs(10));
		assert_eq!(cfg.thresholds.theta_hot, 80.0);
		assert_eq!(cfg.pool.hot_max, 100);
		assert_eq!(cfg.pool.lease_ttl, Duration::from_secs(30));
		assert_eq!(cfg.schedule.fetch_interval, Duration::from_secs(6 * 3_600));
		assert!(cfg.fetchers.proxyscrape.enabled);
		assert!(!cfg.fetchers.search.enabled);
		assert!(cfg.store.is_none());
	}

	#[test]
	fn overrides_from_file() {
		let cfg = parse_config(
			r#"
validator:
  maxConcurrent: 8
  timeout: 2s
scorer:
  thetaHot: 90
pools:
  hotMax: 10
revalidate:
  hot: 30m
lease:
  defaultTtl: 5s
orchestrator:
  fetchInterval: 1h
fetchers:
  proxyscrape:
    enabled: false
  mirror:
    sources:
    - repo: example/proxy-list
      files: [http.txt]
"#
			.to_string(),
		)
		.unwrap();
		assert_eq!(cfg.validator.max_concurrent, 8);
		assert_eq!(cfg.validator.timeout, Duration::from_secs(2));
		assert_eq!(cfg.thresholds.theta_hot, 90.0);
		assert_eq!(cfg.pool.hot_max, 10);
		assert_eq!(cfg.pool.revalidate_hot, Duration::from_secs(1_800));
		assert_eq!(cfg.pool.lease_ttl, Duration::from_secs(5));
		assert_eq!(cfg.schedule.fetch_interval, Duration::from_secs(3_600));
		assert!(!cfg.fetchers.proxyscrape.enabled);
		assert_eq!(cfg.fetchers.mirror.sources.len(), 1);
		assert_eq!(cfg.fetchers.mirror.sources[0].branch, "main");
	}

	#[test]
	fn threshold_disorder_is_fatal() {
		let err = parse_config(
			r#"
scorer:
  thetaWarm: 10
"#
			.to_string(),
		)
		.unwrap_err();
		assert!(err.to_string().contains("totally ordered"));
	}

	#[test]
	fn unknown_keys_are_rejected() {
		assert!(parse_config("bogus: true\n".to_string()).is_err());
	}

	#[test]
	fn echo_url_picked_by_scheme() {
		let echo = EchoConfig::default();
		assert!(echo.ip_url_for(Protocol::Https).unwrap().starts_with("https://"));
		assert!(echo.ip_url_for(Protocol::Http).unwrap().starts_with("http://"));
		assert!(echo.ip_url_for(Protocol::Socks5).unwrap().starts_with("http://"));
	}
}
