use crate::client::Client;
use crate::config::ProxyScrapeConfig;
use crate::fetch::{FetchError, Fetcher, parse_proxy_line};
use crate::*;

/// Pulls plain-text `host:port` lists from a free-proxy-list API, once per
/// configured protocol variant.
pub struct ProxyScrapeFetcher {
	name: Strng,
	cfg: ProxyScrapeConfig,
	client: Client,
}

impl ProxyScrapeFetcher {
	pub fn new(cfg: ProxyScrapeConfig, client: Client) -> ProxyScrapeFetcher {
		ProxyScrapeFetcher {
			name: strng::literal!("proxyscrape"),
			cfg,
			client,
		}
	}

	async fn fetch_protocol(&self, protocol: Protocol) -> Result<Vec<ProxyRecord>, FetchError> {
		let mut request = self.client.fetch().get(&self.cfg.base_url).query(&[
			("request", "displayproxies"),
			("protocol", protocol.scheme()),
			("timeout", "10000"),
			("country", "all"),
			("format", "textplain"),
		]);
		if let Some(key) = &self.cfg.api_key {
			request = request.query(&[("api_key", key.as_str())]);
		}
		let response = request.send().await?;
		let status = response.status();
		if !status.is_success() {
			return Err(FetchError::Status(status.as_u16()));
		}
		let body = response.text().await?;

		let records = body
			.lines()
			.filter_map(|line| parse_proxy_line(line, protocol))
			.map(|(host, port, protocol)| {
				let mut record = ProxyRecord::new(host, port, protocol, self.name.clone());
				record.source_url = Some(self.cfg.base_url.clone());
				record.tags = vec![self.name.clone(), strng::new(protocol.scheme())];
				record
			})
			.collect();
		Ok(records)
	}
}

#[async_trait::async_trait]
impl Fetcher for ProxyScrapeFetcher {
	fn name(&self) -> Strng {
		self.name.clone()
	}

	async fn fetch(&self, limit: Option<usize>) -> Result<Vec<ProxyRecord>, FetchError> {
		let mut out: Vec<ProxyRecord> = Vec::new();
		let mut last_err = None;

		for (i, protocol) in self.cfg.protocols.iter().enumerate() {
			if i > 0 {
				tokio::time::sleep(self.cfg.jitter.sample()).await;
			}
			match self.fetch_protocol(*protocol).await {
				Ok(records) => {
					debug!(source = %self.name, %protocol, count = records.len(), "variant fetched");
					out.extend(records);
				},
				Err(err) => {
					warn!(source = %self.name, %protocol, %err, "variant failed");
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
