//! App Store lookup client

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::error::{ConnectivityError, StoreError};
use crate::traits::StoreLookup;
use crate::types::StoreApp;

const USER_AGENT: &str = "iTunes-iPhone/5.1.1 (3)";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Lookup client for the public iTunes search API
#[derive(Debug, Clone)]
pub struct ItunesStore {
    client: reqwest::Client,
    base_url: String,
}

impl ItunesStore {
    pub fn new(base_url: impl Into<String>) -> Result<Self, StoreError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ConnectivityError::new(&base_url, e))?;

        Ok(Self { client, base_url })
    }

    fn lookup_url(&self, country: &str) -> String {
        format!("{}/{}/lookup", self.base_url, country.to_lowercase())
    }

    async fn get(&self, url: &str, bundle_id: &str) -> Result<reqwest::Response, reqwest::Error> {
        self.client
            .get(url)
            .query(&[("bundleId", bundle_id)])
            .send()
            .await
    }
}

#[async_trait]
impl StoreLookup for ItunesStore {
    async fn lookup_bundle_id(&self, country: &str, bundle_id: &str) -> Result<StoreApp, StoreError> {
        let url = self.lookup_url(country);

        // One retry on transport failure
        let response = match self.get(&url, bundle_id).await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("Store lookup for {} failed, retrying: {}", bundle_id, e);
                self.get(&url, bundle_id)
                    .await
                    .map_err(|e| ConnectivityError::new(&url, e))?
            }
        };

        if !response.status().is_success() {
            return Err(StoreError::Status(response.status().as_u16()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| StoreError::InvalidResponse(e.to_string()))?;

        parse_lookup(bundle_id, body)
    }
}

/// Extract the single app from a lookup response
pub fn parse_lookup(bundle_id: &str, mut body: Value) -> Result<StoreApp, StoreError> {
    let count = body
        .get("resultCount")
        .and_then(Value::as_u64)
        .ok_or_else(|| StoreError::InvalidResponse("missing resultCount".into()))?;

    match count {
        0 => return Err(StoreError::NotFound(bundle_id.to_string())),
        1 => {}
        _ => return Err(StoreError::NotUnique(bundle_id.to_string())),
    }

    let data = match body.get_mut("results").and_then(|r| r.get_mut(0)).map(Value::take) {
        Some(Value::Object(data)) => data,
        _ => return Err(StoreError::InvalidResponse("missing result entry".into())),
    };
    let track_id = data
        .get("trackId")
        .and_then(Value::as_u64)
        .ok_or_else(|| StoreError::InvalidResponse("result without trackId".into()))?;

    Ok(StoreApp { track_id, data })
}
