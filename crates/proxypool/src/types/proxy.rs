use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::validate::ValidationResult;
use crate::*;

/// Wire protocol spoken by a proxy endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
	Http,
	Https,
	Socks4,
	Socks5,
}

impl Protocol {
	pub fn scheme(&self) -> &'static str {
		match self {
			Protocol::Http => "http",
			Protocol::Https => "https",
			Protocol::Socks4 => "socks4",
			Protocol::Socks5 => "socks5",
		}
	}
}

impl Display for Protocol {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.scheme())
	}
}

impl FromStr for Protocol {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"http" => Ok(Protocol::Http),
			"https" => Ok(Protocol::Https),
			"socks4" => Ok(Protocol::Socks4),
			"socks5" => Ok(Protocol::Socks5),
			other => anyhow::bail!("unknown protocol {other:?}"),
		}
	}
}

/// How well a proxy hides the caller. Ordering is never done on the enum
/// itself; any comparison between levels is an explicit match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Anonymity {
	Elite,
	Anonymous,
	Transparent,
	#[default]
	Unknown,
}

impl Anonymity {
	pub fn name(&self) -> &'static str {
		match self {
			Anonymity::Elite => "elite",
			Anonymity::Anonymous => "anonymous",
			Anonymity::Transparent => "transparent",
			Anonymity::Unknown => "unknown",
		}
	}
}

impl FromStr for Anonymity {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"elite" => Ok(Anonymity::Elite),
			"anonymous" => Ok(Anonymity::Anonymous),
			"transparent" => Ok(Anonymity::Transparent),
			"unknown" => Ok(Anonymity::Unknown),
			other => anyhow::bail!("unknown anonymity level {other:?}"),
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
	Active,
	#[default]
	Inactive,
	Testing,
	Blacklisted,
}

impl Status {
	pub fn name(&self) -> &'static str {
		match self {
			Status::Active => "active",
			Status::Inactive => "inactive",
			Status::Testing => "testing",
			Status::Blacklisted => "blacklisted",
		}
	}
}

impl FromStr for Status {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"active" => Ok(Status::Active),
			"inactive" => Ok(Status::Inactive),
			"testing" => Ok(Status::Testing),
			"blacklisted" => Ok(Status::Blacklisted),
			other => anyhow::bail!("unknown status {other:?}"),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedClass {
	Fast,
	Medium,
	Slow,
	Unknown,
}

impl SpeedClass {
	pub fn from_latency(latency_ms: Option<u64>) -> SpeedClass {
		match latency_ms {
			None => SpeedClass::Unknown,
			Some(ms) if ms < 1000 => SpeedClass::Fast,
			Some(ms) if ms < 3000 => SpeedClass::Medium,
			Some(_) => SpeedClass::Slow,
		}
	}
}

/// Quality tier a proxy currently lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
	Hot,
	Warm,
	Cold,
	Blacklist,
}

impl Tier {
	pub const ALL: [Tier; 4] = [Tier::Hot, Tier::Warm, Tier::Cold, Tier::Blacklist];
	/// Tiers a lease may ever be served from, in default preference order.
	pub const SERVABLE: [Tier; 3] = [Tier::Hot, Tier::Warm, Tier::Cold];

	pub fn name(&self) -> &'static str {
		match self {
			Tier::Hot => "hot",
			Tier::Warm => "warm",
			Tier::Cold => "cold",
			Tier::Blacklist => "blacklist",
		}
	}
}

impl Display for Tier {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.name())
	}
}

/// The immutable identity of a proxy. Two records with the same key are the
/// same proxy no matter what their metrics say.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyKey {
	pub host: Strng,
	pub port: u16,
	pub protocol: Protocol,
}

impl ProxyKey {
	pub fn new(host: Strng, port: u16, protocol: Protocol) -> ProxyKey {
		ProxyKey {
			host,
			port,
			protocol,
		}
	}
}

impl Display for ProxyKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}://{}:{}", self.protocol, self.host, self.port)
	}
}

/// Rolling counters for a single proxy. Updated by exactly one writer at a
/// time (validator during a probe, pool manager otherwise).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyMetrics {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub response_time_ms: Option<u64>,
	#[serde(default)]
	pub success_rate: f64,
	#[serde(default)]
	pub total_requests: u64,
	#[serde(default)]
	pub successful_requests: u64,
	#[serde(default)]
	pub failed_requests: u64,
	#[serde(default)]
	pub consecutive_failures: u32,
}

impl ProxyMetrics {
	fn recalculate_success_rate(&mut self) {
		if self.total_requests > 0 {
			self.success_rate = self.successful_requests as f64 / self.total_requests as f64;
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRecord {
	#[serde(flatten)]
	pub key: ProxyKey,

	#[serde(default)]
	pub anonymity: Anonymity,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub country: Option<Strng>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub region: Option<Strng>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub city: Option<Strng>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub isp: Option<Strng>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub asn: Option<Strng>,
	#[serde(default)]
	pub status: Status,

	#[serde(default)]
	pub metrics: ProxyMetrics,
	#[serde(default)]
	pub score: f64,

	pub source: Strng,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub source_url: Option<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub tags: Vec<Strng>,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub metadata: BTreeMap<String, serde_json::Value>,

	pub first_seen: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_checked: Option<DateTime<Utc>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_successful: Option<DateTime<Utc>>,
}

// Equality and hashing use the identity triple only; metrics are mutable
// state and never part of identity.
impl PartialEq for ProxyRecord {
	fn eq(&self, other: &Self) -> bool {
		self.key == other.key
	}
}

impl Eq for ProxyRecord {}

impl Hash for ProxyRecord {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.key.hash(state);
	}
}

impl ProxyRecord {
	pub fn new(host: Strng, port: u16, protocol: Protocol, source: Strng) -> ProxyRecord {
		let now = Utc::now();
		ProxyRecord {
			key: ProxyKey::new(host, port, protocol),
			anonymity: Anonymity::Unknown,
			country: None,
			region: None,
			city: None,
			isp: None,
			asn: None,
			status: Status::Inactive,
			metrics: ProxyMetrics::default(),
			score: 0.0,
			source,
			source_url: None,
			tags: Vec::new(),
			metadata: BTreeMap::new(),
			first_seen: now,
			updated_at: now,
			last_checked: None,
			last_successful: None,
		}
	}

	/// The URL form used to route requests through this proxy.
	pub fn url(&self) -> String {
		self.key.to_string()
	}

	pub fn speed_class(&self) -> SpeedClass {
		SpeedClass::from_latency(self.metrics.response_time_ms)
	}

	pub fn record_success(&mut self, latency_ms: u64) {
		let now = Utc::now();
		self.metrics.total_requests += 1;
		self.metrics.successful_requests += 1;
		self.metrics.response_time_ms = Some(latency_ms);
		self.metrics.consecutive_failures = 0;
		self.metrics.recalculate_success_rate();
		self.last_successful = Some(now);
		self.updated_at = now;
	}

	pub fn record_failure(&mut self) {
		self.metrics.total_requests += 1;
		self.metrics.failed_requests += 1;
		self.metrics.consecutive_failures += 1;
		self.metrics.recalculate_success_rate();
		self.updated_at = Utc::now();
	}

	/// Folds a probe outcome into the record. The caller must be the sole
	/// writer of this record while doing so.
	pub fn apply_validation(&mut self, result: &ValidationResult) {
		let now = Utc::now();
		if result.is_working {
			self.status = Status::Active;
			self.anonymity = result.anonymity;
			if result.country.is_some() {
				self.country = result.country.clone();
			}
			if result.region.is_some() {
				self.region = result.region.clone();
			}
			if result.city.is_some() {
				self.city = result.city.clone();
			}
			if result.isp.is_some() {
				self.isp = result.isp.clone();
			}
			if result.asn.is_some() {
				self.asn = result.asn.clone();
			}
			self.record_success(result.response_time_ms.unwrap_or_default());
		} else {
			self.status = Status::Inactive;
			self.record_failure();
		}
		self.last_checked = Some(now);
		self.updated_at = now;
	}

	/// Refreshes a stored record from a re-discovered candidate with the same
	/// identity. Measured history always wins over a fresh, unmeasured sighting.
	pub fn merge_candidate(&mut self, incoming: &ProxyRecord) {
		for tag in &incoming.tags {
			if !self.tags.contains(tag) {
				self.tags.push(tag.clone());
			}
		}
		for (k, v) in &incoming.metadata {
			self.metadata.insert(k.clone(), v.clone());
		}
		if incoming.source_url.is_some() {
			self.source_url = incoming.source_url.clone();
		}
		if incoming.metrics.total_requests > 0 {
			self.metrics = incoming.metrics.clone();
			self.status = incoming.status;
			self.anonymity = incoming.anonymity;
			self.last_checked = incoming.last_checked.or(self.last_checked);
			self.last_successful = incoming.last_successful.or(self.last_successful);
		}
		self.updated_at = self.updated_at.max(incoming.updated_at);
	}
}

/// Conjunctive filter over pool contents. Empty filter matches everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProxyFilter {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub protocols: Option<Vec<Protocol>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub anonymity: Option<Vec<Anonymity>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub countries: Option<Vec<Strng>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub min_score: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max_response_time_ms: Option<u64>,
}

impl ProxyFilter {
	pub fn matches(&self, record: &ProxyRecord) -> bool {
		if let Some(protocols) = &self.protocols {
			if !protocols.contains(&record.key.protocol) {
				return false;
			}
		}
		if let Some(levels) = &self.anonymity {
			if !levels.contains(&record.anonymity) {
				return false;
			}
		}
		if let Some(countries) = &self.countries {
			match &record.country {
				Some(c) if countries.contains(c) => {},
				_ => return false,
			}
		}
		if let Some(min_score) = self.min_score {
			if record.score < min_score {
				return false;
			}
		}
		if let Some(max_rt) = self.max_response_time_ms {
			if record.metrics.response_time_ms.is_some_and(|rt| rt > max_rt) {
				return false;
			}
		}
		true
	}
}
