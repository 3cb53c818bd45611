//! HTTP data source for the field-operations backend.
//!
//! - Connection pooling shared by the four collection fetches
//! - Bounded concurrency via a semaphore
//! - Automatic retry with exponential backoff on 429 and transport errors
//! - Bodies go through [`crate::ingest`], so aliasing and bad records are
//!   handled before anything reaches the engine

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, warn};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;

use crate::error::{JourneyError, Result};
use crate::ingest::{
    parse_collection, ClientRecord, ExpenseRecordWire, MeetingRecord, Normalizer, PingRecord,
};
use crate::refresh::{DataSource, JourneyQuery};
use crate::types::{ClientLocation, ExpenseRecord, Meeting, Ping};

// Concurrency settings
const MAX_CONCURRENCY: usize = 4; // One slot per collection in a refresh cycle
const MAX_RETRIES: u32 = 3;
const REQUEST_TIMEOUT_SECS: u64 = 30;

type QueryParams = Vec<(&'static str, String)>;

/// Backoff state shared by all requests.
struct Backoff {
    consecutive_429s: AtomicU32,
}

impl Backoff {
    fn new() -> Self {
        Self {
            consecutive_429s: AtomicU32::new(0),
        }
    }

    fn record_success(&self) {
        self.consecutive_429s.store(0, Ordering::Relaxed);
    }

    fn record_429(&self) -> Duration {
        let count = self.consecutive_429s.fetch_add(1, Ordering::Relaxed) + 1;
        // 2s, 4s, 8s, 16s, then capped
        Duration::from_millis(1000 * (1 << count.min(4)))
    }

    fn after_transport_error(retry: u32) -> Duration {
        Duration::from_millis(500 * (1 << retry.min(6)))
    }
}

/// Fetches collections from the backend REST API.
pub struct HttpDataSource {
    client: Client,
    base_url: String,
    auth_header: Option<String>,
    permits: Arc<Semaphore>,
    backoff: Backoff,
}

impl HttpDataSource {
    /// Create a data source for `base_url`, optionally sending a bearer token.
    pub fn new(base_url: &str, api_token: Option<&str>) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(JourneyError::Config {
                message: "base_url must not be empty".to_string(),
            });
        }

        let client = Client::builder()
            .pool_max_idle_per_host(MAX_CONCURRENCY)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| JourneyError::Http {
                message: format!("Failed to create HTTP client: {}", e),
                status_code: None,
            })?;

        Ok(Self {
            client,
            base_url: base_url.to_string(),
            auth_header: api_token.map(|t| format!("Bearer {}", t.trim())),
            permits: Arc::new(Semaphore::new(MAX_CONCURRENCY)),
            backoff: Backoff::new(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn query_params(query: &JourneyQuery) -> QueryParams {
        vec![
            ("agentId", query.agent_id.clone()),
            ("startDate", query.range.start.to_string()),
            ("endDate", query.range.end.to_string()),
        ]
    }

    async fn get_text(&self, collection: &str, path: &str, params: &QueryParams) -> Result<String> {
        let _permit = self.permits.acquire().await.map_err(|e| JourneyError::Internal {
            message: format!("Request limiter closed: {}", e),
        })?;

        let url = self.endpoint(path);
        let mut retries = 0;

        loop {
            let mut request = self.client.get(&url).query(params);
            if let Some(auth) = &self.auth_header {
                request = request.header("Authorization", auth);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();

                    if status == StatusCode::TOO_MANY_REQUESTS {
                        retries += 1;
                        if retries > MAX_RETRIES {
                            return Err(JourneyError::Http {
                                message: format!("Max retries exceeded for {} (429)", collection),
                                status_code: Some(status.as_u16()),
                            });
                        }

                        let backoff = self.backoff.record_429();
                        warn!(
                            "[HttpDataSource] 429 for {}, retry {} after {:?}",
                            collection, retries, backoff
                        );
                        tokio::time::sleep(backoff).await;
                        continue;
                    }

                    if !status.is_success() {
                        return Err(JourneyError::Http {
                            message: format!("{} request failed", collection),
                            status_code: Some(status.as_u16()),
                        });
                    }

                    self.backoff.record_success();
                    return resp.text().await.map_err(|e| JourneyError::Http {
                        message: format!("Failed to read {} body: {}", collection, e),
                        status_code: Some(status.as_u16()),
                    });
                }
                Err(e) => {
                    retries += 1;
                    if retries > MAX_RETRIES {
                        return Err(JourneyError::Http {
                            message: format!("Request error for {}: {}", collection, e),
                            status_code: None,
                        });
                    }

                    let backoff = Backoff::after_transport_error(retries);
                    warn!(
                        "[HttpDataSource] Error for {}: {}, retry {} after {:?}",
                        collection, e, retries, backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn fetch_collection<W, T>(
        &self,
        collection: &str,
        path: &str,
        params: QueryParams,
        normalize: fn(&mut Normalizer, Vec<W>) -> Vec<T>,
    ) -> Result<Vec<T>>
    where
        W: DeserializeOwned,
    {
        let body = self.get_text(collection, path, &params).await?;
        let records: Vec<W> = parse_collection(collection, &body)?;

        let mut normalizer = Normalizer::new();
        let items = normalize(&mut normalizer, records);
        debug!(
            "[HttpDataSource] {}: {:?}",
            collection,
            normalizer.report()
        );
        Ok(items)
    }
}

impl DataSource for HttpDataSource {
    fn name(&self) -> &str {
        &self.base_url
    }

    fn fetch_pings<'a>(&'a self, query: &'a JourneyQuery) -> BoxFuture<'a, Result<Vec<Ping>>> {
        self.fetch_collection::<PingRecord, _>(
            "pings",
            "/pings",
            Self::query_params(query),
            Normalizer::pings,
        )
        .boxed()
    }

    fn fetch_meetings<'a>(
        &'a self,
        query: &'a JourneyQuery,
    ) -> BoxFuture<'a, Result<Vec<Meeting>>> {
        self.fetch_collection::<MeetingRecord, _>(
            "meetings",
            "/meetings",
            Self::query_params(query),
            Normalizer::meetings,
        )
        .boxed()
    }

    fn fetch_expenses<'a>(
        &'a self,
        query: &'a JourneyQuery,
    ) -> BoxFuture<'a, Result<Vec<ExpenseRecord>>> {
        self.fetch_collection::<ExpenseRecordWire, _>(
            "expenses",
            "/expenses",
            Self::query_params(query),
            Normalizer::expenses,
        )
        .boxed()
    }

    fn fetch_clients(&self) -> BoxFuture<'_, Result<Vec<ClientLocation>>> {
        self.fetch_collection::<ClientRecord, _>(
            "clients",
            "/clients",
            Vec::new(),
            Normalizer::clients,
        )
        .boxed()
    }
}
