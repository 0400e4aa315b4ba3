//! BitMEX REST client
//!
//! Only the public instrument listing is needed: it seeds the instrument
//! cache with reference data and last prices before the socket starts
//! streaming trades.

use std::time::Duration;

use reqwest::Client;
use tracing::{debug, instrument};

use rtd_core::{Instrument, RtdError, RtdResult};

use crate::types::{InstrumentResponse, BITMEX_API_BASE};

/// Maximum page size accepted by `GET /instrument`
const PAGE_SIZE: usize = 500;

/// BitMEX REST API client
#[derive(Clone)]
pub struct BitmexClient {
    client: Client,
    base_url: String,
}

impl BitmexClient {
    /// Create a client against the production API
    pub fn new() -> RtdResult<Self> {
        Self::with_base_url(BITMEX_API_BASE)
    }

    /// Create a client against a custom base URL (testnet, proxies)
    pub fn with_base_url(base_url: impl Into<String>) -> RtdResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RtdError::network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// List instruments, optionally filtered by state (e.g. "Open")
    #[instrument(skip(self))]
    pub async fn list_instruments(&self, state: Option<&str>) -> RtdResult<Vec<Instrument>> {
        let url = format!("{}/instrument", self.base_url);
        let filter = state.map(|s| serde_json::json!({ "state": s }).to_string());

        let mut instruments = Vec::new();
        let mut start = 0usize;

        loop {
            let mut params = vec![
                ("count", PAGE_SIZE.to_string()),
                ("start", start.to_string()),
            ];
            if let Some(ref f) = filter {
                params.push(("filter", f.clone()));
            }

            debug!("Fetching BitMEX instruments from {} (start={})", url, start);

            let response = self
                .client
                .get(&url)
                .query(&params)
                .send()
                .await
                .map_err(|e| RtdError::network(format!("Failed to fetch instruments: {}", e)))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(RtdError::api(format!(
                    "BitMEX API error ({}): {}",
                    status, body
                )));
            }

            let body = response
                .text()
                .await
                .map_err(|e| RtdError::network(format!("Failed to read instruments: {}", e)))?;
            let page: Vec<InstrumentResponse> = serde_json::from_str(&body).map_err(|e| {
                RtdError::parse(format!("Failed to parse instruments response: {}", e))
            })?;

            let page_len = page.len();
            instruments.extend(page.into_iter().map(InstrumentResponse::to_instrument));

            if page_len < PAGE_SIZE {
                break;
            }
            start += page_len;
        }

        debug!("Fetched {} BitMEX instruments", instruments.len());
        Ok(instruments)
    }
}

impl std::fmt::Debug for BitmexClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitmexClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}
