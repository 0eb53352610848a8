use std::env;
use std::time::Instant;

use once_cell::sync::Lazy;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

pub static APPLICATION_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

/// Initializes the global tracing subscriber. Filtering comes from RUST_LOG
/// (default "info"); set LOG_FORMAT=json for machine-readable output.
///
/// Must be called at most once, before any logging happens.
pub fn setup_logging() {
	Lazy::force(&APPLICATION_START_TIME);
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let json = env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false);
	if json {
		tracing_subscriber::registry()
			.with(filter)
			.with(fmt::layer().json().flatten_event(true).with_target(true))
			.init();
	} else {
		tracing_subscriber::registry()
			.with(filter)
			.with(fmt::layer().with_target(true))
			.init();
	}
}

/// Test-only logging that routes through the capture writer so `cargo test`
/// output stays attached to the owning test.
pub mod testing {
	use std::sync::Once;

	use tracing_subscriber::EnvFilter;

	pub fn setup_test_logging() {
		static INIT: Once = Once::new();
		INIT.call_once(|| {
			let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
			let _ = tracing_subscriber::fmt()
				.with_env_filter(filter)
				.with_test_writer()
				.try_init();
		});
	}
}
