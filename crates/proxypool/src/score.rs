use serde::{Deserialize, Serialize};

use crate::*;

/// Tier placement thresholds. Scores are on a 0..=100 scale; response time
/// caps are in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct Thresholds {
	pub theta_hot: f64,
	pub theta_warm: f64,
	pub theta_cold: f64,
	pub tau_hot_ms: u64,
	pub tau_warm_ms: u64,
	/// Consecutive probe failures that force a proxy into the blacklist,
	/// whatever its score says.
	pub blacklist_trigger: u32,
}

impl Default for Thresholds {
	fn default() -> Self {
		Thresholds {
			theta_hot: 80.0,
			theta_warm: 50.0,
			theta_cold: 20.0,
			tau_hot_ms: 3_000,
			tau_warm_ms: 8_000,
			blacklist_trigger: 5,
		}
	}
}

impl Thresholds {
	pub fn validate(&self) -> anyhow::Result<()> {
		if !(self.theta_cold < self.theta_warm && self.theta_warm < self.theta_hot) {
			anyhow::bail!(
				"score thresholds must be totally ordered: cold {} < warm {} < hot {}",
				self.theta_cold,
				self.theta_warm,
				self.theta_hot
			);
		}
		if self.tau_hot_ms > self.tau_warm_ms {
			anyhow::bail!(
				"hot response time cap {}ms exceeds warm cap {}ms",
				self.tau_hot_ms,
				self.tau_warm_ms
			);
		}
		if self.blacklist_trigger == 0 {
			anyhow::bail!("blacklist trigger must be at least 1");
		}
		Ok(())
	}
}

/// Scores a record from its current metrics. Pure: same record, same score.
///
/// Weighted sum: success rate 40, speed 30, anonymity 20, stability 10,
/// clamped to 0..=100. A proxy that is not Active scores 0.
pub fn score(record: &ProxyRecord) -> f64 {
	if record.status != Status::Active {
		return 0.0;
	}

	let mut score = record.metrics.success_rate * 40.0;

	score += match record.metrics.response_time_ms {
		Some(rt) if rt < 1_000 => 30.0,
		Some(rt) if rt < 3_000 => 20.0,
		Some(rt) if rt < 5_000 => 10.0,
		_ => 0.0,
	};

	score += match record.anonymity {
		Anonymity::Elite => 20.0,
		Anonymity::Anonymous => 15.0,
		Anonymity::Transparent => 5.0,
		Anonymity::Unknown => 0.0,
	};

	score += match record.metrics.consecutive_failures {
		0 => 10.0,
		1..=2 => 5.0,
		_ => 0.0,
	};

	score.clamp(0.0, 100.0)
}

/// Scores a record and proposes the tier it belongs in.
pub fn classify(record: &ProxyRecord, thresholds: &Thresholds) -> (f64, Tier) {
	let s = score(record);
	if record.metrics.consecutive_failures >= thresholds.blacklist_trigger {
		return (s, Tier::Blacklist);
	}
	if record.status != Status::Active || s < thresholds.theta_cold {
		return (s, Tier::Blacklist);
	}
	// An unmeasured response time never qualifies for the fast tiers.
	let rt = record.metrics.response_time_ms.unwrap_or(u64::MAX);
	if s >= thresholds.theta_hot && rt <= thresholds.tau_hot_ms {
		(s, Tier::Hot)
	} else if s >= thresholds.theta_warm && rt <= thresholds.tau_warm_ms {
		(s, Tier::Warm)
	} else {
		(s, Tier::Cold)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn active_record() -> ProxyRecord {
		let mut r = ProxyRecord::new(strng::new("10.0.0.1"), 8080, Protocol::Http, strng::new("test"));
		r.status = Status::Active;
		r
	}

	#[test]
	fn scenario_a_elite_fast_record_is_hot() {
		let mut r = active_record();
		r.metrics.success_rate = 0.9;
		r.metrics.response_time_ms = Some(500);
		r.anonymity = Anonymity::Elite;
		r.metrics.consecutive_failures = 0;

		let (s, tier) = classify(&r, &Thresholds::default());
		assert_eq!(s, 96.0);
		assert_eq!(tier, Tier::Hot);
	}

	#[test]
	fn inactive_record_scores_zero_and_blacklists() {
		let mut r = active_record();
		r.status = Status::Inactive;
		r.metrics.success_rate = 1.0;
		r.metrics.response_time_ms = Some(100);
		r.anonymity = Anonymity::Elite;

		let (s, tier) = classify(&r, &Thresholds::default());
		assert_eq!(s, 0.0);
		assert_eq!(tier, Tier::Blacklist);
	}

	#[test]
	fn boundary_score_and_latency_are_inclusive_for_hot() {
		let mut r = active_record();
		// 40 + 10 (3s probe) + 20 + 10 = 80: exactly on both hot bounds
		r.metrics.success_rate = 1.0;
		r.metrics.response_time_ms = Some(3_000);
		r.anonymity = Anonymity::Elite;
		r.metrics.consecutive_failures = 0;

		let (s, tier) = classify(&r, &Thresholds::default());
		assert_eq!(s, 80.0);
		assert_eq!(tier, Tier::Hot);

		// One millisecond past the cap falls out of the hot band.
		r.metrics.response_time_ms = Some(3_001);
		let (_, tier) = classify(&r, &Thresholds::default());
		assert_eq!(tier, Tier::Warm);
	}

	#[test]
	fn blacklist_trigger_overrides_score() {
		let mut r = active_record();
		r.metrics.success_rate = 1.0;
		r.metrics.response_time_ms = Some(100);
		r.anonymity = Anonymity::Elite;
		r.metrics.consecutive_failures = 5;

		let (_, tier) = classify(&r, &Thresholds::default());
		assert_eq!(tier, Tier::Blacklist);
	}

	#[test]
	fn slow_but_reliable_record_is_warm_or_cold() {
		let mut r = active_record();
		r.metrics.success_rate = 1.0;
		r.metrics.response_time_ms = Some(4_000);
		r.anonymity = Anonymity::Anonymous;
		// 40 + 10 + 15 + 10 = 75 with a 4s probe: warm band
		let (s, tier) = classify(&r, &Thresholds::default());
		assert_eq!(s, 75.0);
		assert_eq!(tier, Tier::Warm);

		r.metrics.response_time_ms = Some(9_000);
		// 40 + 0 + 15 + 10 = 65 but too slow for warm
		let (_, tier) = classify(&r, &Thresholds::default());
		assert_eq!(tier, Tier::Cold);
	}

	#[test]
	fn unmeasured_latency_never_reaches_hot() {
		let mut r = active_record();
		r.metrics.success_rate = 1.0;
		r.anonymity = Anonymity::Elite;
		// 40 + 0 + 20 + 10 = 70: would be warm on score, but latency unknown
		let (_, tier) = classify(&r, &Thresholds::default());
		assert_eq!(tier, Tier::Cold);
	}

	#[test]
	fn score_stays_in_bounds() {
		let mut r = active_record();
		r.metrics.success_rate = 1.0;
		r.metrics.response_time_ms = Some(1);
		r.anonymity = Anonymity::Elite;
		assert!(score(&r) <= 100.0);
		r.status = Status::Blacklisted;
		assert!(score(&r) >= 0.0);
	}

	#[test]
	fn threshold_order_is_enforced() {
		let mut t = Thresholds::default();
		assert!(t.validate().is_ok());
		t.theta_warm = 10.0;
		assert!(t.validate().is_err());
	}
}
