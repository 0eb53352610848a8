use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::*;

/// Serialized pool state:
/// `{"timestamp": ..., "pools": {"hot": {"proxies": [...]}, ...}}`.
/// Records carry their full identity, metrics and provenance, so a restore
/// followed by a snapshot reproduces the same document (modulo timestamp).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
	pub timestamp: DateTime<Utc>,
	pub pools: PoolsSnapshot,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolsSnapshot {
	#[serde(default)]
	pub hot: TierSnapshot,
	#[serde(default)]
	pub warm: TierSnapshot,
	#[serde(default)]
	pub cold: TierSnapshot,
	#[serde(default)]
	pub blacklist: TierSnapshot,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierSnapshot {
	#[serde(default)]
	pub proxies: Vec<ProxyRecord>,
}

impl Snapshot {
	pub fn to_json(&self) -> serde_json::Result<String> {
		serde_json::to_string_pretty(self)
	}

	pub fn from_json(raw: &str) -> serde_json::Result<Snapshot> {
		serde_json::from_str(raw)
	}

	pub fn record_count(&self) -> usize {
		[
			&self.pools.hot,
			&self.pools.warm,
			&self.pools.cold,
			&self.pools.blacklist,
		]
		.iter()
		.map(|t| t.proxies.len())
		.sum()
	}
}
