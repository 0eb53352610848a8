use crate::*;

/// User agent presented on every outbound request. Free proxy lists and echo
/// services throttle or block obvious bot agents.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Owns outbound HTTP client construction. One shared client serves all
/// fetcher traffic; probe clients are built per candidate because each one
/// routes through a different upstream proxy.
#[derive(Clone)]
pub struct Client {
	fetch: reqwest::Client,
	bare: reqwest::Client,
	probe_timeout: Duration,
}

impl Debug for Client {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Client").finish()
	}
}

impl Client {
	pub fn new(probe_timeout: Duration) -> anyhow::Result<Client> {
		let fetch = reqwest::Client::builder()
			.user_agent(USER_AGENT)
			.timeout(FETCH_TIMEOUT)
			.build()
			.context("building fetch client")?;
		let bare = reqwest::Client::builder()
			.user_agent(USER_AGENT)
			.timeout(probe_timeout)
			.build()
			.context("building bare client")?;
		Ok(Client {
			fetch,
			bare,
			probe_timeout,
		})
	}

	/// Client for fetcher traffic: 30s total deadline, no proxy.
	pub fn fetch(&self) -> &reqwest::Client {
		&self.fetch
	}

	/// Client with the probe deadline but no proxy; used to learn our own
	/// egress IP and for geolocation lookups.
	pub fn bare(&self) -> &reqwest::Client {
		&self.bare
	}

	/// Builds a client routing every request through the given candidate.
	pub fn through_proxy(&self, key: &ProxyKey) -> Result<reqwest::Client, reqwest::Error> {
		let proxy = reqwest::Proxy::all(key.to_string())?;
		reqwest::Client::builder()
			.user_agent(USER_AGENT)
			.proxy(proxy)
			.timeout(self.probe_timeout)
			.build()
	}
}
