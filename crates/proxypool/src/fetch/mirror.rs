use crate::client::Client;
use crate::config::MirrorConfig;
use crate::fetch::{FetchError, Fetcher, parse_proxy_line};
use crate::*;

/// Reads raw proxy-list files from a source-hosting mirror
/// (`{base}/{repo}/{branch}/{file}`). The protocol is inferred from the
/// filename stem; a bearer token is attached when configured.
pub struct MirrorFetcher {
	name: Strng,
	cfg: MirrorConfig,
	client: Client,
}

impl MirrorFetcher {
	pub fn new(cfg: MirrorConfig, client: Client) -> MirrorFetcher {
		MirrorFetcher {
			name: strng::literal!("mirror"),
			cfg,
			client,
		}
	}

	async fn fetch_file(&self, repo: &str, branch: &str, file: &str) -> Result<Vec<ProxyRecord>, FetchError> {
		let url = format!("{}/{repo}/{branch}/{file}", self.cfg.base_url);
		let mut request = self.client.fetch().get(&url);
		if let Some(token) = &self.cfg.token {
			request = request.bearer_auth(token);
		}
		let response = request.send().await?;
		let status = response.status();
		if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
			return Err(FetchError::AuthRejected);
		}
		if !status.is_success() {
			return Err(FetchError::Status(status.as_u16()));
		}
		let body = response.text().await?;

		let protocol = protocol_from_stem(file);
		let records = body
			.lines()
			.filter_map(|line| parse_proxy_line(line, protocol))
			.map(|(host, port, protocol)| {
				let mut record = ProxyRecord::new(host, port, protocol, self.name.clone());
				record.source_url = Some(url.clone());
				record.tags = vec![self.name.clone(), strng::new(protocol.scheme())];
				record
					.metadata
					.insert("mirrorRepo".to_string(), serde_json::json!(repo));
				record
			})
			.collect();
		Ok(records)
	}
}

#[async_trait::async_trait]
impl Fetcher for MirrorFetcher {
	fn name(&self) -> Strng {
		self.name.clone()
	}

	async fn fetch(&self, limit: Option<usize>) -> Result<Vec<ProxyRecord>, FetchError> {
		let mut out: Vec<ProxyRecord> = Vec::new();
		let mut last_err = None;
		let mut first = true;

		'sources: for source in &self.cfg.sources {
			for file in &source.files {
				if !first {
					tokio::time::sleep(self.cfg.jitter.sample()).await;
				}
				first = false;
				match self.fetch_file(&source.repo, &source.branch, file).await {
					Ok(records) => {
						debug!(source = %self.name, repo = %source.repo, %file, count = records.len(), "file fetched");
						out.extend(records);
					},
					Err(FetchError::AuthRejected) => {
						// A bad token fails every file the same way.
						warn!(source = %self.name, repo = %source.repo, "token rejected, stopping for this cycle");
						return Err(FetchError::AuthRejected);
					},
					Err(err) => {
						debug!(source = %self.name, repo = %source.repo, %file, %err, "file failed");
						last_err = Some(err);
					},
				}
				if let Some(limit) = limit {
					if out.len() >= limit {
						out.truncate(limit);
						break 'sources;
					}
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

/// "socks5.txt" carries socks5 rows; "proxies/https.txt" https; everything
/// unrecognized defaults to plain http.
fn protocol_from_stem(file: &str) -> Protocol {
	let lower = file.to_ascii_lowercase();
	if lower.contains("socks5") {
		Protocol::Socks5
	} else if lower.contains("socks4") {
		Protocol::Socks4
	} else if lower.contains("https") {
		Protocol::Https
	} else {
		Protocol::Http
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn stems_map_to_protocols() {
		assert_eq!(protocol_from_stem("proxies/socks5.txt"), Protocol::Socks5);
		assert_eq!(protocol_from_stem("socks4.txt"), Protocol::Socks4);
		assert_eq!(protocol_from_stem("proxies/https.txt"), Protocol::Https);
		assert_eq!(protocol_from_stem("http.txt"), Protocol::Http);
		assert_eq!(protocol_from_stem("list.txt"), Protocol::Http);
	}
}
