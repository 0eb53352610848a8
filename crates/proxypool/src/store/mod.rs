mod postgres;

pub use postgres::PostgresStore;
use serde::Serialize;

use crate::*;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
	#[error("postgres: {0}")]
	Postgres(#[from] tokio_postgres::Error),
	#[error("connection pool: {0}")]
	Pool(String),
	#[error("operation timed out")]
	Timeout,
	#[error("stored data invalid: {0}")]
	Corrupt(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OrderBy {
	Score,
	LastChecked,
	ResponseTime,
	FirstSeen,
}

impl OrderBy {
	fn column(&self) -> &'static str {
		match self {
			OrderBy::Score => "score",
			OrderBy::LastChecked => "last_checked",
			OrderBy::ResponseTime => "response_time_ms",
			OrderBy::FirstSeen => "first_seen",
		}
	}
}

#[derive(Debug, Clone)]
pub struct Page {
	/// 1-based.
	pub page: usize,
	pub page_size: usize,
	pub order_by: OrderBy,
	pub descending: bool,
}

impl Default for Page {
	fn default() -> Self {
		Page {
			page: 1,
			page_size: 50,
			order_by: OrderBy::Score,
			descending: true,
		}
	}
}

#[derive(Debug)]
pub struct QueryResult {
	pub proxies: Vec<ProxyRecord>,
	pub total: u64,
	pub page: usize,
	pub page_size: usize,
}

impl QueryResult {
	pub fn has_next(&self) -> bool {
		(self.page * self.page_size) < self.total as usize
	}

	pub fn has_prev(&self) -> bool {
		self.page > 1
	}
}

/// The narrow seam between the core and whatever relational store backs it.
/// Writes are fire-and-forget from the orchestrator's point of view: errors
/// are logged by the caller and never abort a cycle.
#[async_trait::async_trait]
pub trait DurableStore: Send + Sync {
	/// Makes the store ready for writes (schema, warm connections).
	async fn init(&self) -> Result<(), StoreError> {
		Ok(())
	}
	async fn upsert_many(&self, records: &[ProxyRecord]) -> Result<u64, StoreError>;
	async fn query(&self, filter: &ProxyFilter, page: &Page) -> Result<QueryResult, StoreError>;
	async fn ping(&self) -> Result<(), StoreError>;
}
