use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

pub struct Metrics {
	pub fetch_outcomes: Family<SourceOutcome, Counter>,
	pub validations: Counter,
	pub proxies_working: Counter,
	pub pool_evictions: Family<TierLabel, Counter>,
	pub tier_moves: Family<TierMove, Counter>,
	pub blacklist_purged: Counter,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct SourceOutcome {
	pub source: String,
	pub outcome: FetchOutcome,
}

#[derive(Copy, Clone, Hash, Debug, PartialEq, Eq, EncodeLabelValue)]
pub enum FetchOutcome {
	Attempt,
	Success,
	Empty,
	Error,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct TierLabel {
	pub tier: &'static str,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct TierMove {
	pub from: &'static str,
	pub to: &'static str,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let fetch_outcomes = Family::default();
		registry.register(
			"fetch_source",
			"Fetch attempts per source and outcome",
			fetch_outcomes.clone(),
		);

		let validations = Counter::default();
		registry.register(
			"validations",
			"Total candidate validations performed",
			validations.clone(),
		);

		let proxies_working = Counter::default();
		registry.register(
			"proxies_working",
			"Validations that found a working proxy",
			proxies_working.clone(),
		);

		let pool_evictions = Family::default();
		registry.register(
			"pool_evictions",
			"Records evicted from a full tier",
			pool_evictions.clone(),
		);

		let tier_moves = Family::default();
		registry.register(
			"tier_moves",
			"Records moved between tiers during rebalance",
			tier_moves.clone(),
		);

		let blacklist_purged = Counter::default();
		registry.register(
			"blacklist_purged",
			"Blacklist records purged by age",
			blacklist_purged.clone(),
		);

		Self {
			fetch_outcomes,
			validations,
			proxies_working,
			pool_evictions,
			tier_moves,
			blacklist_purged,
		}
	}

	/// A registry-less instance for tests and embedders that do not scrape.
	pub fn detached() -> Self {
		Self::new(&mut Registry::default())
	}

	pub fn record_fetch(&self, source: &str, outcome: FetchOutcome) {
		self
			.fetch_outcomes
			.get_or_create(&SourceOutcome {
				source: source.to_string(),
				outcome,
			})
			.inc();
	}
}
