//! HTTP clients for the record store and the notification webhook.
//!
//! Requests are rate limited but never retried; callers re-run the whole sync instead.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::{Method, Request, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "sailrep-storage";

/// The record store rejects batch writes larger than this.
pub const MAX_RECORDS_PER_REQUEST: usize = 10;

pub const DEFAULT_API_URL: &str = "https://api.airtable.com/v0";

pub type Fields = Map<String, JsonValue>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("invalid store url {0}")]
    InvalidUrl(String),
    /// A chunked write stopped part way. `completed` holds the ids the store had
    /// already accepted.
    #[error("{source} after {} records were written", .completed.len())]
    Partial {
        completed: Vec<String>,
        source: Box<ClientError>,
    },
}

impl ClientError {
    fn after(self, completed: Vec<String>) -> Self {
        if completed.is_empty() {
            self
        } else {
            ClientError::Partial {
                completed,
                source: Box::new(self),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreRecord {
    pub id: String,
    #[serde(default)]
    pub fields: Fields,
}

#[derive(Debug, Deserialize)]
struct ListPage {
    #[serde(default)]
    records: Vec<StoreRecord>,
    #[serde(default)]
    offset: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateBody<'a> {
    records: Vec<NewRecord<'a>>,
}

#[derive(Debug, Serialize)]
struct NewRecord<'a> {
    fields: &'a Fields,
}

#[derive(Debug, Deserialize)]
struct DeleteResponse {
    #[serde(default)]
    records: Vec<DeletedRecord>,
}

#[derive(Debug, Deserialize)]
struct DeletedRecord {
    id: String,
    #[serde(default)]
    deleted: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    pub fn per_second(requests: u32) -> Self {
        let requests = requests.max(1);
        Self {
            capacity: requests,
            refill_every: Duration::from_secs(1) / requests,
        }
    }
}

/// Request budget that refills one token per `refill_every`, up to `capacity`.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, capacity: u32, every: Duration) {
        if every.is_zero() {
            self.tokens = capacity;
            return;
        }
        let earned = self.last_refill.elapsed().as_nanos() / every.as_nanos();
        if earned == 0 {
            return;
        }
        let earned = u32::try_from(earned).unwrap_or(u32::MAX);
        self.tokens = self.tokens.saturating_add(earned).min(capacity);
        if self.tokens == capacity {
            self.last_refill = Instant::now();
        } else {
            // Keep the partial interval so fractional refills are not lost.
            self.last_refill += every * earned;
        }
    }

    fn until_next(&self, every: Duration) -> Duration {
        every.saturating_sub(self.last_refill.elapsed())
    }
}

impl TokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity,
            refill_every: config.refill_every,
            state: Mutex::new(BucketState {
                tokens: config.capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn available(&self) -> u32 {
        let mut state = self.state.lock().await;
        state.refill(self.capacity, self.refill_every);
        state.tokens
    }

    /// Waits until a token is free and consumes it.
    pub async fn take(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                state.refill(self.capacity, self.refill_every);
                if state.tokens > 0 {
                    state.tokens -= 1;
                    return;
                }
                state.until_next(self.refill_every)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreClientConfig {
    pub api_url: String,
    pub base_id: String,
    pub api_key: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub rate_limit: Option<TokenBucketConfig>,
}

impl Default for StoreClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            base_id: String::new(),
            api_key: String::new(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            rate_limit: Some(TokenBucketConfig::per_second(5)),
        }
    }
}

/// Client for a table-oriented REST record store (Airtable API shape).
#[derive(Debug)]
pub struct StoreClient {
    client: reqwest::Client,
    api_url: Url,
    base_id: String,
    api_key: String,
    limiter: Option<Arc<TokenBucket>>,
}

impl StoreClient {
    pub fn new(config: StoreClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let api_url = Url::parse(&config.api_url)
            .with_context(|| format!("parsing store api url {}", config.api_url))?;
        if api_url.cannot_be_a_base() {
            anyhow::bail!("store api url {} cannot be a base", config.api_url);
        }

        Ok(Self {
            client,
            api_url,
            base_id: config.base_id,
            api_key: config.api_key,
            limiter: config.rate_limit.map(|c| Arc::new(TokenBucket::new(c))),
        })
    }

    pub fn table_url(&self, table: &str) -> Result<Url, ClientError> {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|()| ClientError::InvalidUrl(self.api_url.to_string()))?
            .pop_if_empty()
            .push(&self.base_id)
            .push(table);
        Ok(url)
    }

    fn list_request(
        &self,
        table: &str,
        fields: &[&str],
        offset: Option<&str>,
    ) -> Result<Request, ClientError> {
        let mut query: Vec<(&str, &str)> = fields.iter().map(|f| ("fields[]", *f)).collect();
        if let Some(offset) = offset {
            query.push(("offset", offset));
        }
        Ok(self
            .client
            .get(self.table_url(table)?)
            .bearer_auth(&self.api_key)
            .query(&query)
            .build()?)
    }

    fn create_request(&self, table: &str, rows: &[Fields]) -> Result<Request, ClientError> {
        let body = CreateBody {
            records: rows.iter().map(|fields| NewRecord { fields }).collect(),
        };
        Ok(self
            .client
            .post(self.table_url(table)?)
            .bearer_auth(&self.api_key)
            .json(&body)
            .build()?)
    }

    fn delete_request(&self, table: &str, ids: &[String]) -> Result<Request, ClientError> {
        let query: Vec<(&str, &str)> = ids.iter().map(|id| ("records[]", id.as_str())).collect();
        Ok(self
            .client
            .delete(self.table_url(table)?)
            .bearer_auth(&self.api_key)
            .query(&query)
            .build()?)
    }

    async fn execute<T: DeserializeOwned>(&self, request: Request) -> Result<T, ClientError> {
        if let Some(limiter) = &self.limiter {
            limiter.take().await;
        }

        let method: Method = request.method().clone();
        let url = request.url().to_string();
        let span = info_span!("store_request", %method, url = %url);

        self.send(request, url).instrument(span).await
    }

    async fn send<T: DeserializeOwned>(&self, request: Request, url: String) -> Result<T, ClientError> {
        let resp = self.client.execute(request).await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::HttpStatus {
                status: status.as_u16(),
                url,
                body,
            });
        }
        debug!(status = status.as_u16(), "store request ok");
        Ok(resp.json::<T>().await?)
    }

    async fn create_chunk(&self, table: &str, rows: &[Fields]) -> Result<ListPage, ClientError> {
        let request = self.create_request(table, rows)?;
        self.execute(request).await
    }

    async fn delete_chunk(&self, table: &str, ids: &[String]) -> Result<Vec<String>, ClientError> {
        let request = self.delete_request(table, ids)?;
        let resp: DeleteResponse = self.execute(request).await?;
        Ok(resp
            .records
            .into_iter()
            .filter(|r| r.deleted)
            .map(|r| r.id)
            .collect())
    }

    /// Every record in `table`, following the store's pagination cursor.
    pub async fn list_records(
        &self,
        table: &str,
        fields: &[&str],
    ) -> Result<Vec<StoreRecord>, ClientError> {
        let mut records = Vec::new();
        let mut offset: Option<String> = None;
        loop {
            let request = self.list_request(table, fields, offset.as_deref())?;
            let page: ListPage = self.execute(request).await?;
            records.extend(page.records);
            match page.offset {
                Some(next) if !next.is_empty() => offset = Some(next),
                _ => break,
            }
        }
        Ok(records)
    }

    /// Inserts `rows`, returning the created records in request order.
    ///
    /// Rows go out in chunks of [`MAX_RECORDS_PER_REQUEST`]. A failure after the first
    /// chunk is reported as [`ClientError::Partial`].
    pub async fn create_records(
        &self,
        table: &str,
        rows: &[Fields],
    ) -> Result<Vec<StoreRecord>, ClientError> {
        let mut created: Vec<StoreRecord> = Vec::with_capacity(rows.len());
        for chunk in rows.chunks(MAX_RECORDS_PER_REQUEST) {
            match self.create_chunk(table, chunk).await {
                Ok(page) => created.extend(page.records),
                Err(err) => return Err(err.after(created.into_iter().map(|r| r.id).collect())),
            }
        }
        Ok(created)
    }

    /// Deletes `ids`, returning the ids the store confirmed as deleted. Chunked like
    /// [`StoreClient::create_records`].
    pub async fn delete_records(
        &self,
        table: &str,
        ids: &[String],
    ) -> Result<Vec<String>, ClientError> {
        let mut deleted = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(MAX_RECORDS_PER_REQUEST) {
            match self.delete_chunk(table, chunk).await {
                Ok(ids) => deleted.extend(ids),
                Err(err) => return Err(err.after(deleted)),
            }
        }
        Ok(deleted)
    }
}

/// Posts plain-text messages to an incoming chat webhook.
#[derive(Debug, Clone)]
pub struct WebhookClient {
    client: reqwest::Client,
    url: Url,
}

impl WebhookClient {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building webhook client")?;
        let url = Url::parse(url).with_context(|| format!("parsing webhook url {url}"))?;
        Ok(Self { client, url })
    }

    pub async fn post_text(&self, message: &str) -> Result<(), ClientError> {
        let resp = self
            .client
            .post(self.url.clone())
            .json(&serde_json::json!({ "text": message }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ClientError::HttpStatus {
                status: status.as_u16(),
                url: self.url.to_string(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}
