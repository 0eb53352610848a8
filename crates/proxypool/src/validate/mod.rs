use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::{OnceCell, Semaphore};

use crate::client::Client;
use crate::config::ValidatorConfig;
use crate::metrics::Metrics;
use crate::*;

/// Request headers that give away the presence of a proxy (or worse, the
/// caller's address) when echoed back by the headers endpoint.
const PROXY_HEADERS: &[&str] = &[
	"via",
	"x-forwarded-for",
	"x-real-ip",
	"forwarded",
	"proxy-connection",
	"x-proxy-id",
	"client-ip",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
	Timeout,
	ConnectionRefused,
	HttpStatus(u16),
	ParseError,
	IpLeak,
	Other(String),
}

impl ErrorKind {
	fn is_retriable(&self) -> bool {
		matches!(
			self,
			ErrorKind::Timeout | ErrorKind::ConnectionRefused | ErrorKind::Other(_)
		)
	}
}

impl Display for ErrorKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			ErrorKind::Timeout => f.write_str("timeout"),
			ErrorKind::ConnectionRefused => f.write_str("connection refused"),
			ErrorKind::HttpStatus(code) => write!(f, "http status {code}"),
			ErrorKind::ParseError => f.write_str("parse error"),
			ErrorKind::IpLeak => f.write_str("ip leak"),
			ErrorKind::Other(msg) => f.write_str(msg),
		}
	}
}

/// Outcome of probing one candidate. Returned to the caller, never stored:
/// the pool manager owns folding results into records.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
	pub key: ProxyKey,
	pub is_working: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub response_time_ms: Option<u64>,
	pub anonymity: Anonymity,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub detected_ip: Option<Strng>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub country: Option<Strng>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub region: Option<Strng>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub city: Option<Strng>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub isp: Option<Strng>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub asn: Option<Strng>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<ErrorKind>,
}

impl ValidationResult {
	fn pending(key: ProxyKey) -> ValidationResult {
		ValidationResult {
			key,
			is_working: false,
			response_time_ms: None,
			anonymity: Anonymity::Unknown,
			detected_ip: None,
			country: None,
			region: None,
			city: None,
			isp: None,
			asn: None,
			error: None,
		}
	}
}

#[derive(Deserialize)]
struct EchoIp {
	origin: String,
}

#[derive(Deserialize)]
struct EchoHeaders {
	headers: HashMap<String, String>,
}

#[derive(Deserialize)]
struct GeoLookup {
	status: Option<String>,
	#[serde(rename = "countryCode")]
	country_code: Option<String>,
	#[serde(rename = "regionName")]
	region_name: Option<String>,
	city: Option<String>,
	isp: Option<String>,
	#[serde(rename = "as")]
	asn: Option<String>,
}

/// Probes candidates through themselves against the configured echo
/// endpoints. Bounded concurrency, chunked batches, never errors: every
/// candidate yields a result.
pub struct Validator {
	cfg: ValidatorConfig,
	client: Client,
	semaphore: Semaphore,
	own_ip: OnceCell<Option<Strng>>,
	metrics: Arc<Metrics>,
}

impl Validator {
	pub fn new(cfg: ValidatorConfig, client: Client, metrics: Arc<Metrics>) -> Validator {
		let semaphore = Semaphore::new(cfg.max_concurrent);
		Validator {
			cfg,
			client,
			semaphore,
			own_ip: OnceCell::new(),
			metrics,
		}
	}

	/// The caller's own egress IP, learned once per process with a bare
	/// (unproxied) request. None when it cannot be learned; anonymity then
	/// degrades so Elite is never claimed without proof.
	pub async fn own_ip(&self) -> Option<Strng> {
		self
			.own_ip
			.get_or_init(|| async {
				for url in &self.cfg.echo.ip_urls {
					match fetch_json::<EchoIp>(self.client.bare(), url).await {
						Ok(echo) => {
							let ip = strng::new(normalize_origin(&echo.origin));
							info!(%ip, "learned own egress ip");
							return Some(ip);
						},
						Err(err) => {
							debug!(%url, %err, "own-ip probe failed");
						},
					}
				}
				warn!("could not learn own egress ip; elite anonymity will not be claimed");
				None
			})
			.await
			.clone()
	}

	/// Validates a batch. Chunks run sequentially with a pause between them;
	/// candidates inside a chunk run concurrently up to the semaphore cap.
	pub async fn validate_batch(&self, candidates: &[ProxyRecord]) -> Vec<ValidationResult> {
		let mut out = Vec::with_capacity(candidates.len());
		let mut chunks = candidates.chunks(self.cfg.batch_size).peekable();
		while let Some(chunk) = chunks.next() {
			let results =
				futures_util::future::join_all(chunk.iter().map(|c| self.validate_one(c))).await;
			out.extend(results);
			if chunks.peek().is_some() {
				tokio::time::sleep(self.cfg.chunk_pause).await;
			}
		}
		let working = out.iter().filter(|r| r.is_working).count();
		info!(
			total = out.len(),
			working, "validation batch complete"
		);
		out
	}

	pub async fn validate_one(&self, record: &ProxyRecord) -> ValidationResult {
		let Ok(_permit) = self.semaphore.acquire().await else {
			// The semaphore is never closed; this is unreachable in practice.
			let mut r = ValidationResult::pending(record.key.clone());
			r.error = Some(ErrorKind::Other("validator shut down".to_string()));
			return r;
		};
		self.metrics.validations.inc();
		let own_ip = self.own_ip().await;
		let result = self.probe(record.key.clone(), own_ip).await;
		if result.is_working {
			self.metrics.proxies_working.inc();
		}
		trace!(proxy = %result.key, working = result.is_working, "validated");
		result
	}

	async fn probe(&self, key: ProxyKey, own_ip: Option<Strng>) -> ValidationResult {
		let mut result = ValidationResult::pending(key);

		let client = match self.client.through_proxy(&result.key) {
			Ok(client) => client,
			Err(err) => {
				result.error = Some(ErrorKind::Other(err.to_string()));
				return result;
			},
		};

		// Probe 1: reachability through the proxy to the echo-ip endpoint.
		let Some(ip_url) = self.cfg.echo.ip_url_for(result.key.protocol) else {
			result.error = Some(ErrorKind::Other("no echo-ip endpoint configured".to_string()));
			return result;
		};
		let body = match self.request_with_retries(&client, ip_url).await {
			Ok((latency_ms, body)) => {
				result.is_working = true;
				result.response_time_ms = Some(latency_ms);
				body
			},
			Err(kind) => {
				result.error = Some(kind);
				return result;
			},
		};

		// Probe 2: the echoed origin is the address the world sees.
		match serde_json::from_str::<EchoIp>(&body) {
			Ok(echo) => result.detected_ip = Some(strng::new(normalize_origin(&echo.origin))),
			Err(_) => result.error = Some(ErrorKind::ParseError),
		}

		// Probe 3: anonymity classification from the echoed request headers.
		let headers = match self.cfg.echo.headers_url_for(result.key.protocol) {
			Some(url) => match self.request_with_retries(&client, url).await {
				Ok((_, body)) => serde_json::from_str::<EchoHeaders>(&body)
					.ok()
					.map(|e| e.headers),
				Err(_) => None,
			},
			None => None,
		};
		let (anonymity, leaked) = classify_anonymity(
			own_ip.as_deref(),
			result.detected_ip.as_deref(),
			headers.as_ref(),
		);
		result.anonymity = anonymity;
		if leaked {
			result.error = Some(ErrorKind::IpLeak);
		}

		// Probe 4: best-effort geolocation of the detected address.
		if let (Some(base), Some(ip)) = (&self.cfg.echo.geolocation_url, result.detected_ip.clone()) {
			self.lookup_geolocation(base, &ip, &mut result).await;
		}

		result
	}

	async fn lookup_geolocation(&self, base: &str, ip: &str, result: &mut ValidationResult) {
		let url = format!("{base}{ip}");
		match fetch_json::<GeoLookup>(self.client.bare(), &url).await {
			Ok(geo) => {
				if geo.status.as_deref() == Some("success") {
					result.country = geo.country_code.map(strng::new);
					result.region = geo.region_name.map(strng::new);
					result.city = geo.city.map(strng::new);
					result.isp = geo.isp.map(strng::new);
					result.asn = geo.asn.map(strng::new);
				}
			},
			Err(err) => {
				debug!(proxy = %result.key, %err, "geolocation lookup failed");
			},
		}
	}

	async fn request_with_retries(
		&self,
		client: &reqwest::Client,
		url: &str,
	) -> Result<(u64, String), ErrorKind> {
		let mut attempt = 0;
		loop {
			match request_once(client, url).await {
				Ok(ok) => return Ok(ok),
				Err(kind) => {
					if !kind.is_retriable() || attempt >= self.cfg.retry_count {
						return Err(kind);
					}
					attempt += 1;
					tokio::time::sleep(self.cfg.retry_delay).await;
				},
			}
		}
	}
}

async fn request_once(client: &reqwest::Client, url: &str) -> Result<(u64, String), ErrorKind> {
	let start = Instant::now();
	let response = client.get(url).send().await.map_err(classify_error)?;
	let latency_ms = start.elapsed().as_millis() as u64;
	let status = response.status();
	if !status.is_success() {
		return Err(ErrorKind::HttpStatus(status.as_u16()));
	}
	let body = response.text().await.map_err(classify_error)?;
	Ok((latency_ms, body))
}

async fn fetch_json<T: serde::de::DeserializeOwned>(
	client: &reqwest::Client,
	url: &str,
) -> Result<T, ErrorKind> {
	let (_, body) = request_once(client, url).await?;
	serde_json::from_str(&body).map_err(|_| ErrorKind::ParseError)
}

fn classify_error(err: reqwest::Error) -> ErrorKind {
	if err.is_timeout() {
		ErrorKind::Timeout
	} else if err.is_connect() {
		ErrorKind::ConnectionRefused
	} else {
		ErrorKind::Other(err.to_string())
	}
}

/// Echo endpoints report comma-joined chains when intermediate proxies append
/// themselves; the first entry is the effective origin.
fn normalize_origin(origin: &str) -> &str {
	origin.split(',').next().unwrap_or(origin).trim()
}

/// Classification rules, in order:
/// - echoed origin equals our own IP: the proxy exposes us (Transparent);
/// - headers probe failed entirely: Unknown;
/// - our IP appears in any echoed header value: Transparent;
/// - a proxy-identifying header is present: Anonymous;
/// - nothing identifies a proxy: Elite, unless our own IP could not be
///   learned, in which case Elite cannot be proven and Anonymous is reported.
///
/// The bool is true when the caller's address leaked through the proxy.
fn classify_anonymity(
	own_ip: Option<&str>,
	detected_ip: Option<&str>,
	headers: Option<&HashMap<String, String>>,
) -> (Anonymity, bool) {
	if let (Some(own), Some(detected)) = (own_ip, detected_ip) {
		if own == detected {
			return (Anonymity::Transparent, true);
		}
	}
	let Some(headers) = headers else {
		return (Anonymity::Unknown, false);
	};
	if let Some(own) = own_ip {
		if headers.values().any(|v| v.contains(own)) {
			return (Anonymity::Transparent, true);
		}
	}
	let has_proxy_header = headers
		.keys()
		.any(|k| PROXY_HEADERS.iter().any(|h| k.eq_ignore_ascii_case(h)));
	if has_proxy_header {
		return (Anonymity::Anonymous, false);
	}
	if own_ip.is_none() {
		return (Anonymity::Anonymous, false);
	}
	(Anonymity::Elite, false)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
		pairs
			.iter()
			.map(|(k, v)| (k.to_string(), v.to_string()))
			.collect()
	}

	#[test]
	fn via_header_means_anonymous() {
		let h = headers(&[("Via", "1.1 something"), ("Accept", "*/*")]);
		let (anonymity, leaked) = classify_anonymity(Some("9.9.9.9"), Some("1.2.3.4"), Some(&h));
		assert_eq!(anonymity, Anonymity::Anonymous);
		assert!(!leaked);
	}

	#[test]
	fn echoed_own_ip_means_transparent() {
		let h = headers(&[]);
		let (anonymity, leaked) = classify_anonymity(Some("9.9.9.9"), Some("9.9.9.9"), Some(&h));
		assert_eq!(anonymity, Anonymity::Transparent);
		assert!(leaked);
	}

	#[test]
	fn leak_through_forwarding_header_means_transparent() {
		let h = headers(&[("X-Forwarded-For", "9.9.9.9, 1.2.3.4")]);
		let (anonymity, leaked) = classify_anonymity(Some("9.9.9.9"), Some("1.2.3.4"), Some(&h));
		assert_eq!(anonymity, Anonymity::Transparent);
		assert!(leaked);
	}

	#[test]
	fn clean_headers_and_different_origin_means_elite() {
		let h = headers(&[("Accept", "*/*"), ("Host", "example.com")]);
		let (anonymity, leaked) = classify_anonymity(Some("9.9.9.9"), Some("1.2.3.4"), Some(&h));
		assert_eq!(anonymity, Anonymity::Elite);
		assert!(!leaked);
	}

	#[test]
	fn elite_degrades_to_anonymous_without_own_ip() {
		let h = headers(&[("Accept", "*/*")]);
		let (anonymity, _) = classify_anonymity(None, Some("1.2.3.4"), Some(&h));
		assert_eq!(anonymity, Anonymity::Anonymous);
	}

	#[test]
	fn failed_headers_probe_means_unknown() {
		let (anonymity, _) = classify_anonymity(Some("9.9.9.9"), Some("1.2.3.4"), None);
		assert_eq!(anonymity, Anonymity::Unknown);
	}

	#[test]
	fn origin_chains_keep_first_entry() {
		assert_eq!(normalize_origin("1.2.3.4, 10.0.0.1"), "1.2.3.4");
		assert_eq!(normalize_origin(" 1.2.3.4 "), "1.2.3.4");
	}

	#[test]
	fn header_matching_is_case_insensitive() {
		let h = headers(&[("X-FORWARDED-FOR", "1.2.3.4")]);
		let (anonymity, _) = classify_anonymity(Some("9.9.9.9"), Some("1.2.3.4"), Some(&h));
		assert_eq!(anonymity, Anonymity::Anonymous);
	}
}
