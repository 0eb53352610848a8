use std::path::PathBuf;

use serde::Deserialize;

use crate::fetch::{FetchError, Fetcher, parse_proxy_line};
use crate::*;

/// Reads candidates from a local file: plain `host:port[:protocol]` lines, or
/// JSON (a bare array, or `{"proxies": [...]}`) mixing strings and objects.
pub struct FileFetcher {
	name: Strng,
	path: PathBuf,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FileEntry {
	Line(String),
	Node {
		host: Strng,
		port: u16,
		#[serde(default)]
		protocol: Option<Protocol>,
	},
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FileDoc {
	Wrapped { proxies: Vec<FileEntry> },
	Bare(Vec<FileEntry>),
}

impl FileFetcher {
	pub fn new(path: PathBuf) -> FileFetcher {
		let stem = path
			.file_name()
			.map(|n| n.to_string_lossy().to_string())
			.unwrap_or_else(|| "unnamed".to_string());
		FileFetcher {
			name: strng::format!("file-{stem}"),
			path,
		}
	}

	fn parse_json(&self, content: &str) -> Result<Vec<ProxyRecord>, FetchError> {
		let doc: FileDoc = serde_json::from_str(content)
			.map_err(|e| FetchError::Parse(format!("{}: {e}", self.path.display())))?;
		let entries = match doc {
			FileDoc::Wrapped { proxies } => proxies,
			FileDoc::Bare(entries) => entries,
		};
		let mut records = Vec::new();
		for entry in entries {
			match entry {
				FileEntry::Line(line) => {
					if let Some((host, port, protocol)) = parse_proxy_line(&line, Protocol::Http) {
						records.push(self.record(host, port, protocol));
					} else {
						debug!(source = %self.name, %line, "skipping unparseable entry");
					}
				},
				FileEntry::Node {
					host,
					port,
					protocol,
				} => {
					if port > 0 {
						records.push(self.record(host, port, protocol.unwrap_or(Protocol::Http)));
					}
				},
			}
		}
		Ok(records)
	}

	fn parse_text(&self, content: &str) -> Vec<ProxyRecord> {
		content
			.lines()
			.filter_map(|line| parse_proxy_line(line, Protocol::Http))
			.map(|(host, port, protocol)| self.record(host, port, protocol))
			.collect()
	}

	fn record(&self, host: Strng, port: u16, protocol: Protocol) -> ProxyRecord {
		let mut record = ProxyRecord::new(host, port, protocol, self.name.clone());
		record.source_url = Some(self.path.display().to_string());
		record
	}
}

#[async_trait::async_trait]
impl Fetcher for FileFetcher {
	fn name(&self) -> Strng {
		self.name.clone()
	}

	async fn fetch(&self, limit: Option<usize>) -> Result<Vec<ProxyRecord>, FetchError> {
		let content = fs_err::read_to_string(&self.path)?;
		let trimmed = content.trim_start();
		let mut records = if trimmed.starts_with('{') || trimmed.starts_with('[') {
			self.parse_json(&content)?
		} else {
			self.parse_text(&content)
		};
		if let Some(limit) = limit {
			records.truncate(limit);
		}
		Ok(records)
	}
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use super::*;

	fn write_temp(content: &str, suffix: &str) -> tempfile::NamedTempFile {
		let mut f = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
		f.write_all(content.as_bytes()).unwrap();
		f
	}

	#[tokio::test]
	async fn reads_plain_text_lines() {
		let f = write_temp("1.2.3.4:8080\n# comment\n5.6.7.8:1080:socks5\nbroken\n", ".txt");
		let fetcher = FileFetcher::new(f.path().to_path_buf());
		let records = fetcher.fetch(None).await.unwrap();
		assert_eq!(records.len(), 2);
		assert_eq!(records[0].key.port, 8080);
		assert_eq!(records[1].key.protocol, Protocol::Socks5);
		assert!(records[0].source.starts_with("file-"));
	}

	#[tokio::test]
	async fn reads_wrapped_json() {
		let f = write_temp(
			r#"{"proxies": ["1.2.3.4:8080", {"host": "5.6.7.8", "port": 3128, "protocol": "https"}]}"#,
			".json",
		);
		let fetcher = FileFetcher::new(f.path().to_path_buf());
		let records = fetcher.fetch(None).await.unwrap();
		assert_eq!(records.len(), 2);
		assert_eq!(records[1].key.protocol, Protocol::Https);
	}

	#[tokio::test]
	async fn limit_caps_output() {
		let f = write_temp("1.1.1.1:80\n2.2.2.2:80\n3.3.3.3:80\n", ".txt");
		let fetcher = FileFetcher::new(f.path().to_path_buf());
		let records = fetcher.fetch(Some(2)).await.unwrap();
		assert_eq!(records.len(), 2);
	}

	#[tokio::test]
	async fn missing_file_is_an_error_not_a_panic() {
		let fetcher = FileFetcher::new(PathBuf::from("/nonexistent/proxies.txt"));
		assert!(matches!(
			fetcher.fetch(None).await,
			Err(FetchError::Io(_))
		));
	}
}
