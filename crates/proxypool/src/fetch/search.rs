use serde::Deserialize;

use crate::client::Client;
use crate::config::SearchConfig;
use crate::fetch::{FetchError, Fetcher};
use crate::*;

/// Discovers candidates through an authenticated network-search API. Results
/// arrive pre-enriched with geolocation, so records carry it as provenance.
pub struct SearchFetcher {
	name: Strng,
	cfg: SearchConfig,
	client: Client,
}

#[derive(Deserialize)]
struct SearchResponse {
	#[serde(default)]
	matches: Vec<SearchMatch>,
}

#[derive(Deserialize)]
struct SearchMatch {
	ip_str: Option<String>,
	port: Option<u16>,
	isp: Option<String>,
	asn: Option<String>,
	#[serde(default)]
	location: SearchLocation,
}

#[derive(Deserialize, Default)]
struct SearchLocation {
	country_name: Option<String>,
	region_code: Option<String>,
	city: Option<String>,
}

impl SearchFetcher {
	pub fn new(cfg: SearchConfig, client: Client) -> SearchFetcher {
		SearchFetcher {
			name: strng::literal!("search"),
			cfg,
			client,
		}
	}

	async fn search(&self, key: &str, query: &str) -> Result<Vec<ProxyRecord>, FetchError> {
		let url = format!("{}/shodan/host/search", self.cfg.base_url);
		let limit = self.cfg.per_query_limit.to_string();
		let response = self
			.client
			.fetch()
			.get(&url)
			.query(&[("key", key), ("query", query), ("limit", &limit)])
			.send()
			.await?;
		let status = response.status();
		if status == reqwest::StatusCode::UNAUTHORIZED {
			return Err(FetchError::AuthRejected);
		}
		if !status.is_success() {
			return Err(FetchError::Status(status.as_u16()));
		}
		let parsed: SearchResponse = response.json().await?;

		let mut records = Vec::new();
		for m in parsed.matches {
			let (Some(host), Some(port)) = (m.ip_str, m.port) else {
				continue;
			};
			if port == 0 {
				continue;
			}
			let protocol = guess_protocol_from_port(port);
			let mut record = ProxyRecord::new(strng::new(host), port, protocol, self.name.clone());
			record.country = m.location.country_name.map(strng::new);
			record.region = m.location.region_code.map(strng::new);
			record.city = m.location.city.map(strng::new);
			record.isp = m.isp.map(strng::new);
			record.asn = m.asn.map(strng::new);
			record.tags = vec![self.name.clone(), strng::literal!("discovered")];
			record
				.metadata
				.insert("searchQuery".to_string(), serde_json::json!(query));
			records.push(record);
		}
		Ok(records)
	}
}

#[async_trait::async_trait]
impl Fetcher for SearchFetcher {
	fn name(&self) -> Strng {
		self.name.clone()
	}

	async fn fetch(&self, limit: Option<usize>) -> Result<Vec<ProxyRecord>, FetchError> {
		let Some(key) = self.cfg.api_key.clone() else {
			return Err(FetchError::AuthRejected);
		};

		let mut out: Vec<ProxyRecord> = Vec::new();
		let mut last_err = None;

		for (i, query) in self.cfg.queries.iter().enumerate() {
			if i > 0 {
				tokio::time::sleep(self.cfg.jitter.sample()).await;
			}
			match self.search(&key, query).await {
				Ok(records) => {
					debug!(source = %self.name, %query, count = records.len(), "query complete");
					out.extend(records);
				},
				Err(FetchError::AuthRejected) => {
					// A rejected credential will not recover mid-cycle.
					warn!(source = %self.name, "api key rejected, stopping for this cycle");
					return Err(FetchError::AuthRejected);
				},
				Err(err) => {
					warn!(source = %self.name, %query, %err, "query failed");
					last_err = Some(err);
				},
			}
			if let Some(limit) = limit {
				if out.len() >= limit {
					out.truncate(limit);
					break;
				}
			}
		}

		if out.is_empty() {
			if let Some(err) = last_err {
				return Err(err);
			}
		}
		Ok(out)
	}
}

/// Well-known port conventions; everything else is assumed plain http.
fn guess_protocol_from_port(port: u16) -> Protocol {
	match port {
		1080 | 1081 => Protocol::Socks5,
		1085 => Protocol::Socks4,
		443 | 8443 => Protocol::Https,
		_ => Protocol::Http,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn port_conventions() {
		assert_eq!(guess_protocol_from_port(1080), Protocol::Socks5);
		assert_eq!(guess_protocol_from_port(1085), Protocol::Socks4);
		assert_eq!(guess_protocol_from_port(8443), Protocol::Https);
		assert_eq!(guess_protocol_from_port(3128), Protocol::Http);
	}
}
