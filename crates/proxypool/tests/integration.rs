use std::sync::Arc;
use std::time::Duration;

use proxypool::client::Client;
use proxypool::config::{self, EchoConfig, ValidatorConfig};
use proxypool::fetch::{FetchError, Fetcher, Registry};
use proxypool::metrics::Metrics;
use proxypool::orchestrator::Orchestrator;
use proxypool::validate::{ErrorKind, Validator};
use proxypool::{Anonymity, Protocol, ProxyRecord, Tier, strng, telemetry};
use tokio::net::TcpListener;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn record(host: &str, port: u16) -> ProxyRecord {
	ProxyRecord::new(strng::new(host), port, Protocol::Http, strng::new("test"))
}

/// Echo endpoints as seen without a proxy: our own egress IP is 9.9.9.9.
async fn echo_server() -> MockServer {
	let server = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/ip"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"origin": "9.9.9.9"})))
		.mount(&server)
		.await;
	Mock::given(method("GET"))
		.and(path_regex("/geo/.*"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
			"status": "success",
			"countryCode": "US",
			"regionName": "California",
			"city": "Fresno",
			"isp": "Example Networks",
			"as": "AS64496"
		})))
		.mount(&server)
		.await;
	server
}

/// A mock standing in for the proxy under test. Requests arrive in
/// absolute-form, but the path matchers still see `/ip` and `/headers`.
async fn proxy_server(origin: &str, headers: serde_json::Value) -> MockServer {
	let server = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/ip"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"origin": origin})))
		.mount(&server)
		.await;
	Mock::given(method("GET"))
		.and(path("/headers"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"headers": headers})))
		.mount(&server)
		.await;
	server
}

fn validator_config(echo: &MockServer) -> ValidatorConfig {
	ValidatorConfig {
		timeout: Duration::from_secs(2),
		retry_count: 0,
		retry_delay: Duration::from_millis(50),
		echo: EchoConfig {
			ip_urls: vec![format!("{}/ip", echo.uri())],
			headers_urls: vec![format!("{}/headers", echo.uri())],
			geolocation_url: Some(format!("{}/geo/", echo.uri())),
		},
		..ValidatorConfig::default()
	}
}

fn validator(echo: &MockServer) -> Validator {
	let cfg = validator_config(echo);
	let client = Client::new(cfg.timeout).unwrap();
	Validator::new(cfg, client, Arc::new(Metrics::detached()))
}

async fn unused_port() -> u16 {
	// Bind-then-drop: connecting to the freed port is refused immediately.
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn validator_classifies_elite_proxy() {
	telemetry::testing::setup_test_logging();
	let echo = echo_server().await;
	let proxy = proxy_server("1.2.3.4", serde_json::json!({"Accept": "*/*"})).await;
	let v = validator(&echo);

	let candidate = record("127.0.0.1", proxy.address().port());
	let result = v.validate_one(&candidate).await;

	assert!(result.is_working, "error: {:?}", result.error);
	assert!(result.response_time_ms.is_some());
	assert_eq!(result.detected_ip.as_deref(), Some("1.2.3.4"));
	assert_eq!(result.anonymity, Anonymity::Elite);
	assert_eq!(result.country.as_deref(), Some("US"));
	assert_eq!(result.isp.as_deref(), Some("Example Networks"));
}

#[tokio::test]
async fn validator_classifies_anonymous_proxy_from_via_header() {
	telemetry::testing::setup_test_logging();
	let echo = echo_server().await;
	let proxy = proxy_server("1.2.3.4", serde_json::json!({"Via": "1.1 something"})).await;
	let v = validator(&echo);

	let result = v.validate_one(&record("127.0.0.1", proxy.address().port())).await;
	assert!(result.is_working);
	assert_eq!(result.anonymity, Anonymity::Anonymous);
}

#[tokio::test]
async fn validator_classifies_transparent_proxy_on_own_ip_echo() {
	telemetry::testing::setup_test_logging();
	let echo = echo_server().await;
	// The proxy echoes our own egress IP back: it hides nothing.
	let proxy = proxy_server("9.9.9.9", serde_json::json!({})).await;
	let v = validator(&echo);

	let result = v.validate_one(&record("127.0.0.1", proxy.address().port())).await;
	assert!(result.is_working);
	assert_eq!(result.anonymity, Anonymity::Transparent);
	assert_eq!(result.error, Some(ErrorKind::IpLeak));
}

#[tokio::test]
async fn validator_reports_unreachable_proxy_without_erroring() {
	telemetry::testing::setup_test_logging();
	let echo = echo_server().await;
	let v = validator(&echo);

	let dead = record("127.0.0.1", unused_port().await);
	let result = v.validate_one(&dead).await;
	assert!(!result.is_working);
	assert!(matches!(
		result.error,
		Some(ErrorKind::ConnectionRefused) | Some(ErrorKind::Other(_))
	));
	assert_eq!(result.anonymity, Anonymity::Unknown);
}

#[tokio::test]
async fn validator_reports_http_status_errors() {
	telemetry::testing::setup_test_logging();
	let echo = echo_server().await;
	let proxy = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/ip"))
		.respond_with(ResponseTemplate::new(502))
		.mount(&proxy)
		.await;
	let v = validator(&echo);

	let result = v.validate_one(&record("127.0.0.1", proxy.address().port())).await;
	assert!(!result.is_working);
	assert_eq!(result.error, Some(ErrorKind::HttpStatus(502)));
}

#[tokio::test]
async fn validator_batch_returns_one_result_per_candidate_in_order() {
	telemetry::testing::setup_test_logging();
	let echo = echo_server().await;
	let proxy = proxy_server("1.2.3.4", serde_json::json!({})).await;
	let v = validator(&echo);

	let alive = record("127.0.0.1", proxy.address().port());
	let dead = record("127.0.0.1", unused_port().await);
	let results = v.validate_batch(&[alive.clone(), dead.clone(), alive.clone()]).await;

	assert_eq!(results.len(), 3);
	assert_eq!(results[0].key, alive.key);
	assert!(results[0].is_working);
	assert_eq!(results[1].key, dead.key);
	assert!(!results[1].is_working);
	assert!(results[2].is_working);
}

struct StaticFetcher {
	name: &'static str,
	records: Vec<ProxyRecord>,
}

#[async_trait::async_trait]
impl Fetcher for StaticFetcher {
	fn name(&self) -> proxypool::Strng {
		strng::new(self.name)
	}

	async fn fetch(&self, _limit: Option<usize>) -> Result<Vec<ProxyRecord>, FetchError> {
		Ok(self.records.clone())
	}
}

struct FailingFetcher;

#[async_trait::async_trait]
impl Fetcher for FailingFetcher {
	fn name(&self) -> proxypool::Strng {
		strng::literal!("failing")
	}

	async fn fetch(&self, _limit: Option<usize>) -> Result<Vec<ProxyRecord>, FetchError> {
		Err(FetchError::Status(503))
	}
}

struct PanickingFetcher;

#[async_trait::async_trait]
impl Fetcher for PanickingFetcher {
	fn name(&self) -> proxypool::Strng {
		strng::literal!("panicking")
	}

	async fn fetch(&self, _limit: Option<usize>) -> Result<Vec<ProxyRecord>, FetchError> {
		panic!("source blew up");
	}
}

#[tokio::test]
async fn registry_isolates_failures_and_deduplicates() {
	telemetry::testing::setup_test_logging();

	// A yields 100 records; B fails; C yields 50, of which 20 duplicate A's.
	let a: Vec<ProxyRecord> = (0..100).map(|i| record(&format!("10.0.0.{i}"), 8080)).collect();
	let c: Vec<ProxyRecord> = (0..20)
		.map(|i| record(&format!("10.0.0.{i}"), 8080))
		.chain((0..30).map(|i| record(&format!("10.1.0.{i}"), 8080)))
		.collect();

	let mut registry = Registry::new(None, Arc::new(Metrics::detached()));
	registry.register(Arc::new(StaticFetcher {
		name: "source-a",
		records: a,
	}));
	registry.register(Arc::new(FailingFetcher));
	registry.register(Arc::new(StaticFetcher {
		name: "source-c",
		records: c,
	}));
	registry.register(Arc::new(PanickingFetcher));

	let merged = registry.fetch_all().await;
	assert_eq!(merged.len(), 130);

	let stats = registry.stats();
	assert_eq!(stats[&strng::new("failing")].errors, 1);
	assert_eq!(stats[&strng::new("panicking")].errors, 1);
	assert_eq!(stats[&strng::new("source-a")].successes, 1);
	assert_eq!(stats[&strng::new("source-a")].total_fetched, 100);
}

#[tokio::test]
async fn fetch_cycle_pools_working_proxies_end_to_end() {
	telemetry::testing::setup_test_logging();
	let echo = echo_server().await;
	let proxy = proxy_server("1.2.3.4", serde_json::json!({})).await;
	let data_dir = tempfile::tempdir().unwrap();

	// The upstream list source hands out exactly our proxy-under-test.
	let list = MockServer::start().await;
	Mock::given(method("GET"))
		.respond_with(
			ResponseTemplate::new(200)
				.set_body_string(format!("127.0.0.1:{}\n", proxy.address().port())),
		)
		.mount(&list)
		.await;

	let yaml = format!(
		r#"
dataDir: {data_dir}
validator:
  timeout: 2s
  retryCount: 0
  retryDelay: 50ms
echo:
  ipUrls: ["{echo}/ip"]
  headersUrls: ["{echo}/headers"]
  geolocationUrl: "{echo}/geo/"
fetchers:
  proxyscrape:
    baseUrl: "{list}/list"
    protocols: [http]
    jitter:
      min: 1ms
      max: 2ms
  mirror:
    enabled: false
"#,
		data_dir = data_dir.path().display(),
		echo = echo.uri(),
		list = list.uri(),
	);
	let cfg = config::parse_config(yaml).unwrap();
	let orchestrator = Arc::new(Orchestrator::new(&cfg, Arc::new(Metrics::detached())).unwrap());

	orchestrator.fetch_cycle().await.unwrap();

	// A clean fast proxy scores into the hot tier and is leasable.
	let leased = orchestrator.acquire(None, &Tier::SERVABLE).expect("a proxy should be pooled");
	assert_eq!(leased.key.port, proxy.address().port());
	assert!(leased.score >= 80.0, "score {}", leased.score);
	assert_eq!(orchestrator.pool().tier_of(&leased.key), Some(Tier::Hot));

	// Exclusive while leased; available again after release.
	assert!(orchestrator.acquire(None, &Tier::SERVABLE).is_none());
	orchestrator.release(&leased.key);
	assert!(orchestrator.acquire(None, &Tier::SERVABLE).is_some());

	let stats = orchestrator.stats();
	assert_eq!(stats.pools.total, 1);
	assert_eq!(stats.sources[&strng::new("proxyscrape")].successes, 1);
}

#[tokio::test]
async fn persisted_snapshot_survives_a_restart() {
	telemetry::testing::setup_test_logging();
	let echo = echo_server().await;
	let proxy = proxy_server("1.2.3.4", serde_json::json!({})).await;
	let data_dir = tempfile::tempdir().unwrap();

	let yaml = format!(
		r#"
dataDir: {data_dir}
validator:
  timeout: 2s
  retryCount: 0
echo:
  ipUrls: ["{echo}/ip"]
  headersUrls: ["{echo}/headers"]
fetchers:
  proxyscrape:
    enabled: false
  mirror:
    enabled: false
"#,
		data_dir = data_dir.path().display(),
		echo = echo.uri(),
	);

	let cfg = config::parse_config(yaml.clone()).unwrap();
	let first = Arc::new(Orchestrator::new(&cfg, Arc::new(Metrics::detached())).unwrap());
	let v = validator(&echo);
	let mut candidate = record("127.0.0.1", proxy.address().port());
	let result = v.validate_one(&candidate).await;
	candidate.apply_validation(&result);
	first.pool().add_many(vec![candidate.clone()]);
	first.persist_cycle().await.unwrap();

	assert!(data_dir.path().join("proxy_pools.json").exists());
	assert!(data_dir.path().join("backups").exists());

	// A fresh orchestrator over the same data dir picks the state back up.
	let cfg = config::parse_config(yaml).unwrap();
	let second = Arc::new(Orchestrator::new(&cfg, Arc::new(Metrics::detached())).unwrap());
	second.start().await.unwrap();
	assert_eq!(second.pool().tier_of(&candidate.key), Some(Tier::Hot));
	second.stop().await;
	// stop() is idempotent.
	second.stop().await;
}
