use std::str::FromStr;

use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};

use crate::config::StoreConfig;
use crate::store::{DurableStore, Page, QueryResult, StoreError};
use crate::*;

/// Schema is owned by this adapter; nothing else in the core knows the
/// column layout.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS proxy_nodes (
	host TEXT NOT NULL,
	port INTEGER NOT NULL,
	protocol TEXT NOT NULL,
	anonymity TEXT NOT NULL DEFAULT 'unknown',
	country TEXT,
	region TEXT,
	city TEXT,
	isp TEXT,
	asn TEXT,
	status TEXT NOT NULL DEFAULT 'inactive',
	response_time_ms BIGINT,
	success_rate DOUBLE PRECISION NOT NULL DEFAULT 0,
	total_requests BIGINT NOT NULL DEFAULT 0,
	successful_requests BIGINT NOT NULL DEFAULT 0,
	failed_requests BIGINT NOT NULL DEFAULT 0,
	consecutive_failures INTEGER NOT NULL DEFAULT 0,
	score DOUBLE PRECISION NOT NULL DEFAULT 0,
	source TEXT NOT NULL DEFAULT '',
	source_url TEXT,
	tags JSONB NOT NULL DEFAULT '[]',
	metadata JSONB NOT NULL DEFAULT '{}',
	first_seen TIMESTAMPTZ NOT NULL,
	created_at TIMESTAMPTZ NOT NULL,
	updated_at TIMESTAMPTZ NOT NULL,
	last_checked TIMESTAMPTZ,
	last_successful TIMESTAMPTZ,
	PRIMARY KEY (host, port, protocol)
);
CREATE INDEX IF NOT EXISTS proxy_nodes_status_idx ON proxy_nodes (status);
CREATE INDEX IF NOT EXISTS proxy_nodes_last_checked_idx ON proxy_nodes (last_checked);
CREATE INDEX IF NOT EXISTS proxy_nodes_score_idx ON proxy_nodes (score);
CREATE INDEX IF NOT EXISTS proxy_nodes_country_idx ON proxy_nodes (country);
";

const SELECT_FOR_UPDATE: &str =
	"SELECT first_seen FROM proxy_nodes WHERE host = $1 AND port = $2 AND protocol = $3 FOR UPDATE";

const UPDATE: &str = "UPDATE proxy_nodes SET
	anonymity = $4, country = $5, region = $6, city = $7, isp = $8, asn = $9,
	status = $10, response_time_ms = $11, success_rate = $12,
	total_requests = $13, successful_requests = $14, failed_requests = $15,
	consecutive_failures = $16, score = $17, source = $18, source_url = $19,
	tags = $20, metadata = $21, updated_at = $22, last_checked = $23,
	last_successful = $24
	WHERE host = $1 AND port = $2 AND protocol = $3";

const INSERT: &str = "INSERT INTO proxy_nodes (
	host, port, protocol, anonymity, country, region, city, isp, asn, status,
	response_time_ms, success_rate, total_requests, successful_requests,
	failed_requests, consecutive_failures, score, source, source_url, tags,
	metadata, updated_at, last_checked, last_successful, first_seen, created_at
	) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
	$15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26)";

const COLUMNS: &str = "host, port, protocol, anonymity, country, region, city, isp, asn, status,
	response_time_ms, success_rate, total_requests, successful_requests, failed_requests,
	consecutive_failures, score, source, source_url, tags, metadata,
	first_seen, updated_at, last_checked, last_successful";

/// Postgres-backed durable store behind a small connection pool.
pub struct PostgresStore {
	pool: Pool,
	min_connections: usize,
	op_timeout: Duration,
}

impl PostgresStore {
	pub fn connect(cfg: &StoreConfig) -> Result<PostgresStore, StoreError> {
		let pg = tokio_postgres::Config::from_str(&cfg.url)?;
		let manager = Manager::from_config(
			pg,
			NoTls,
			ManagerConfig {
				recycling_method: RecyclingMethod::Fast,
			},
		);
		let pool = Pool::builder(manager)
			.max_size(cfg.max_connections)
			.build()
			.map_err(|e| StoreError::Pool(e.to_string()))?;
		Ok(PostgresStore {
			pool,
			min_connections: cfg.min_connections,
			op_timeout: cfg.op_timeout,
		})
	}

	async fn client(&self) -> Result<deadpool_postgres::Object, StoreError> {
		match tokio::time::timeout(self.op_timeout, self.pool.get()).await {
			Ok(Ok(client)) => Ok(client),
			Ok(Err(e)) => Err(StoreError::Pool(e.to_string())),
			Err(_) => Err(StoreError::Timeout),
		}
	}

	async fn upsert_inner(&self, records: &[ProxyRecord]) -> Result<u64, StoreError> {
		let mut client = self.client().await?;
		let tx = client.transaction().await?;
		let select = tx.prepare_cached(SELECT_FOR_UPDATE).await?;
		let update = tx.prepare_cached(UPDATE).await?;
		let insert = tx.prepare_cached(INSERT).await?;

		for record in records {
			let host = record.key.host.as_str();
			let port = record.key.port as i32;
			let protocol = record.key.protocol.scheme();
			let now = Utc::now();

			let tags = serde_json::to_value(&record.tags)
				.map_err(|e| StoreError::Corrupt(e.to_string()))?;
			let metadata = serde_json::to_value(&record.metadata)
				.map_err(|e| StoreError::Corrupt(e.to_string()))?;
			let response_time_ms = record.metrics.response_time_ms.map(|ms| ms as i64);
			let anonymity = record.anonymity.name();
			let status = record.status.name();
			let country = record.country.as_deref();
			let region = record.region.as_deref();
			let city = record.city.as_deref();
			let isp = record.isp.as_deref();
			let asn = record.asn.as_deref();
			let total_requests = record.metrics.total_requests as i64;
			let successful_requests = record.metrics.successful_requests as i64;
			let failed_requests = record.metrics.failed_requests as i64;
			let consecutive_failures = record.metrics.consecutive_failures as i32;
			let source = record.source.as_str();

			let mutable: [&(dyn ToSql + Sync); 21] = [
				&anonymity,
				&country,
				&region,
				&city,
				&isp,
				&asn,
				&status,
				&response_time_ms,
				&record.metrics.success_rate,
				&total_requests,
				&successful_requests,
				&failed_requests,
				&consecutive_failures,
				&record.score,
				&source,
				&record.source_url,
				&tags,
				&metadata,
				&now,
				&record.last_checked,
				&record.last_successful,
			];

			let existing = tx.query_opt(&select, &[&host, &port, &protocol]).await?;
			let mut params: Vec<&(dyn ToSql + Sync)> = vec![&host, &port, &protocol];
			params.extend_from_slice(&mutable);
			if existing.is_some() {
				// first_seen and created_at survive the update untouched.
				tx.execute(&update, &params).await?;
			} else {
				params.push(&now);
				params.push(&now);
				tx.execute(&insert, &params).await?;
			}
		}

		tx.commit().await?;
		Ok(records.len() as u64)
	}

	async fn query_inner(&self, filter: &ProxyFilter, page: &Page) -> Result<QueryResult, StoreError> {
		let client = self.client().await?;

		let mut clauses: Vec<String> = Vec::new();
		let mut params: Vec<Box<dyn ToSql + Sync + Send>> = Vec::new();
		if let Some(protocols) = &filter.protocols {
			let values: Vec<String> = protocols.iter().map(|p| p.scheme().to_string()).collect();
			params.push(Box::new(values));
			clauses.push(format!("protocol = ANY(${})", params.len()));
		}
		if let Some(levels) = &filter.anonymity {
			let values: Vec<String> = levels.iter().map(|a| a.name().to_string()).collect();
			params.push(Box::new(values));
			clauses.push(format!("anonymity = ANY(${})", params.len()));
		}
		if let Some(countries) = &filter.countries {
			let values: Vec<String> = countries.iter().map(|c| c.to_string()).collect();
			params.push(Box::new(values));
			clauses.push(format!("country = ANY(${})", params.len()));
		}
		if let Some(min_score) = filter.min_score {
			params.push(Box::new(min_score));
			clauses.push(format!("score >= ${}", params.len()));
		}
		if let Some(max_rt) = filter.max_response_time_ms {
			params.push(Box::new(max_rt as i64));
			clauses.push(format!("response_time_ms <= ${}", params.len()));
		}
		let where_sql = if clauses.is_empty() {
			String::new()
		} else {
			format!(" WHERE {}", clauses.join(" AND "))
		};

		let page_number = page.page.max(1);
		let direction = if page.descending { "DESC" } else { "ASC" };
		let count_sql = format!("SELECT COUNT(*) FROM proxy_nodes{where_sql}");
		let data_sql = format!(
			"SELECT {COLUMNS} FROM proxy_nodes{where_sql} ORDER BY {} {direction} NULLS LAST LIMIT {} OFFSET {}",
			page.order_by.column(),
			page.page_size,
			(page_number - 1) * page.page_size,
		);

		let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| &**p as &(dyn ToSql + Sync)).collect();
		let total: i64 = client.query_one(&count_sql, &refs).await?.get(0);
		let rows = client.query(&data_sql, &refs).await?;
		let proxies = rows
			.iter()
			.map(record_from_row)
			.collect::<Result<Vec<_>, _>>()?;

		Ok(QueryResult {
			proxies,
			total: total.max(0) as u64,
			page: page_number,
			page_size: page.page_size,
		})
	}
}

#[async_trait::async_trait]
impl DurableStore for PostgresStore {
	/// Creates the schema when missing and pre-opens the minimum number of
	/// connections.
	async fn init(&self) -> Result<(), StoreError> {
		let client = self.client().await?;
		client.batch_execute(SCHEMA).await?;
		let mut held = vec![client];
		for _ in 1..self.min_connections {
			held.push(self.client().await?);
		}
		drop(held);
		Ok(())
	}

	/// Batch upsert keyed by the identity triple inside one transaction.
	async fn upsert_many(&self, records: &[ProxyRecord]) -> Result<u64, StoreError> {
		tokio::time::timeout(self.op_timeout, self.upsert_inner(records))
			.await
			.map_err(|_| StoreError::Timeout)?
	}

	async fn query(&self, filter: &ProxyFilter, page: &Page) -> Result<QueryResult, StoreError> {
		tokio::time::timeout(self.op_timeout, self.query_inner(filter, page))
			.await
			.map_err(|_| StoreError::Timeout)?
	}

	async fn ping(&self) -> Result<(), StoreError> {
		let client = self.client().await?;
		client.execute("SELECT 1", &[]).await?;
		Ok(())
	}
}

fn record_from_row(row: &Row) -> Result<ProxyRecord, StoreError> {
	let corrupt = |e: anyhow::Error| StoreError::Corrupt(e.to_string());

	let protocol: &str = row.get("protocol");
	let anonymity: &str = row.get("anonymity");
	let status: &str = row.get("status");
	let tags: serde_json::Value = row.get("tags");
	let metadata: serde_json::Value = row.get("metadata");

	let mut record = ProxyRecord::new(
		strng::new(row.get::<_, &str>("host")),
		row.get::<_, i32>("port") as u16,
		Protocol::from_str(protocol).map_err(corrupt)?,
		strng::new(row.get::<_, &str>("source")),
	);
	record.anonymity = Anonymity::from_str(anonymity).map_err(corrupt)?;
	record.status = Status::from_str(status).map_err(corrupt)?;
	record.country = row.get::<_, Option<&str>>("country").map(strng::new);
	record.region = row.get::<_, Option<&str>>("region").map(strng::new);
	record.city = row.get::<_, Option<&str>>("city").map(strng::new);
	record.isp = row.get::<_, Option<&str>>("isp").map(strng::new);
	record.asn = row.get::<_, Option<&str>>("asn").map(strng::new);
	record.metrics.response_time_ms = row
		.get::<_, Option<i64>>("response_time_ms")
		.map(|ms| ms.max(0) as u64);
	record.metrics.success_rate = row.get("success_rate");
	record.metrics.total_requests = row.get::<_, i64>("total_requests").max(0) as u64;
	record.metrics.successful_requests = row.get::<_, i64>("successful_requests").max(0) as u64;
	record.metrics.failed_requests = row.get::<_, i64>("failed_requests").max(0) as u64;
	record.metrics.consecutive_failures = row.get::<_, i32>("consecutive_failures").max(0) as u32;
	record.score = row.get("score");
	record.source_url = row.get::<_, Option<String>>("source_url");
	record.tags = serde_json::from_value(tags).map_err(|e| StoreError::Corrupt(e.to_string()))?;
	record.metadata =
		serde_json::from_value(metadata).map_err(|e| StoreError::Corrupt(e.to_string()))?;
	record.first_seen = row.get("first_seen");
	record.updated_at = row.get("updated_at");
	record.last_checked = row.get::<_, Option<DateTime<Utc>>>("last_checked");
	record.last_successful = row.get::<_, Option<DateTime<Utc>>>("last_successful");
	Ok(record)
}
