//! Client for the backend job/app store
//!
//! The backend is a plain JSON-over-HTTP service. Every transport failure
//! is reported as [`ConnectivityError`]; anything the backend answers is a
//! [`BackendError`] describing the unexpected response.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use pf_core::{BackendError, ConnectivityError};
use pf_protocol::records::{collection_values, created_id, id_from_value};
use pf_protocol::{Account, AppRecord, DeviceRegistration, JobRecord, ResultRecord, RunRecord};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Operations the worker needs from the backend store
#[async_trait]
pub trait Backend: Send + Sync {
    /// Base URL handed to agents so they can report back
    fn base_url(&self) -> &str;

    async fn device_exists(&self, uuid: &str) -> Result<bool, BackendError>;

    async fn post_device(&self, registration: &DeviceRegistration) -> Result<(), BackendError>;

    /// Unique identifiers of all registered accounts
    async fn accounts(&self) -> Result<BTreeSet<String>, BackendError>;

    async fn post_account(&self, account: &Account) -> Result<(), BackendError>;

    /// Resolve (or create) the worker with this name and return its id
    async fn worker_for_name(&self, name: &str) -> Result<String, BackendError>;

    /// Claim the next job for a device; `None` when there is no work
    async fn claim_job(&self, worker_id: &str, device: &str)
        -> Result<Option<JobRecord>, BackendError>;

    async fn get_job(&self, job_id: &str) -> Result<JobRecord, BackendError>;

    /// Create or update a job, returning the id the backend reports
    async fn post_job(&self, job: &JobRecord) -> Result<Option<String>, BackendError>;

    /// Register app metadata, returning the app id
    async fn post_app(&self, app: &Map<String, Value>) -> Result<String, BackendError>;

    /// The app record for a bundle id (and version), if exactly one matches
    async fn app_by_bundle_id(
        &self,
        bundle_id: &str,
        version: Option<&str>,
    ) -> Result<Option<AppRecord>, BackendError>;

    /// Download an app archive to `dest`; `false` if the backend has none
    async fn fetch_app_archive(&self, app_id: &str, dest: &Path) -> Result<bool, BackendError>;

    async fn has_app_archive(&self, app_id: &str) -> Result<bool, BackendError>;

    async fn upload_app_archive(&self, app_id: &str, archive: &Path) -> Result<(), BackendError>;

    /// Create or update a run, returning its id
    async fn post_run(&self, run: &RunRecord) -> Result<String, BackendError>;

    /// Attach a result to a run, returning the result id
    async fn post_result(&self, result: &ResultRecord) -> Result<String, BackendError>;
}

/// Register a device and its accounts unless the backend already knows it.
///
/// Accounts missing from the backend are posted first; a failure to add
/// one account is logged and does not block the others.
pub async fn register_device(
    backend: &dyn Backend,
    registration: &DeviceRegistration,
    accounts: &[Account],
) -> Result<(), BackendError> {
    if backend.device_exists(&registration.uuid).await? {
        tracing::debug!("Device {} already registered", registration.uuid);
        return Ok(());
    }

    let known = backend.accounts().await?;
    for account in accounts {
        if known.contains(&account.unique_identifier) {
            continue;
        }
        match backend.post_account(account).await {
            Ok(()) => tracing::info!("Registered account {}", account.apple_id),
            Err(BackendError::Connectivity(e)) => return Err(e.into()),
            Err(e) => tracing::error!("Unable to add account {}: {}", account.apple_id, e),
        }
    }

    backend.post_device(registration).await?;
    tracing::info!("Registered device {}", registration.uuid);
    Ok(())
}

/// [`Backend`] over HTTP
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Result<Self, BackendError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ConnectivityError::new(&base_url, e))?;

        Ok(Self { client, base_url })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(
        &self,
        url: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<Response, BackendError> {
        request
            .send()
            .await
            .map_err(|e| ConnectivityError::new(url, e).into())
    }

    async fn get(&self, url: &str) -> Result<Response, BackendError> {
        self.send(url, self.client.get(url)).await
    }

    async fn post_json<T: Serialize + ?Sized + Sync>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<Response, BackendError> {
        self.send(url, self.client.post(url).json(body)).await
    }

    /// POST a record and read the id the backend assigned under `key`
    async fn create<T: Serialize + ?Sized + Sync>(
        &self,
        path: &str,
        body: &T,
        key: &str,
    ) -> Result<String, BackendError> {
        let url = self.url(path);
        let response = expect_ok(&url, self.post_json(&url, body).await?).await?;
        let body: Value = read_json(&url, response).await?;
        created_id(&body, key).ok_or_else(|| BackendError::InvalidResponse {
            endpoint: url,
            message: format!("missing {}", key),
        })
    }
}

async fn unexpected(url: &str, response: Response) -> BackendError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    BackendError::UnexpectedStatus {
        endpoint: url.to_string(),
        status,
        body,
    }
}

async fn expect_ok(url: &str, response: Response) -> Result<Response, BackendError> {
    if response.status() == StatusCode::OK {
        Ok(response)
    } else {
        Err(unexpected(url, response).await)
    }
}

async fn read_json<T: DeserializeOwned>(url: &str, response: Response) -> Result<T, BackendError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| ConnectivityError::new(url, e))?;
    serde_json::from_slice(&bytes).map_err(|e| BackendError::InvalidResponse {
        endpoint: url.to_string(),
        message: e.to_string(),
    })
}

/// Account identifiers from an `/accounts` listing.
///
/// Keyed listings use the identifier as key; records also carry it as
/// `uniqueIdentifier`.
fn account_identifiers(listing: Value) -> BTreeSet<String> {
    let mut identifiers = BTreeSet::new();
    if let Value::Object(map) = &listing {
        identifiers.extend(map.keys().cloned());
    }
    identifiers.extend(
        collection_values(listing)
            .iter()
            .filter_map(|record| record.get("uniqueIdentifier").and_then(id_from_value)),
    );
    identifiers
}

#[async_trait]
impl Backend for HttpBackend {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn device_exists(&self, uuid: &str) -> Result<bool, BackendError> {
        let url = self.url(&format!("/devices/{}", uuid));
        let response = self.get(&url).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            _ => Err(unexpected(&url, response).await),
        }
    }

    async fn post_device(&self, registration: &DeviceRegistration) -> Result<(), BackendError> {
        let url = self.url("/devices");
        expect_ok(&url, self.post_json(&url, registration).await?).await?;
        Ok(())
    }

    async fn accounts(&self) -> Result<BTreeSet<String>, BackendError> {
        let url = self.url("/accounts");
        let response = self.get(&url).await?;
        if response.status() != StatusCode::OK {
            tracing::warn!("Account listing failed with HTTP {}", response.status());
            return Ok(BTreeSet::new());
        }
        Ok(account_identifiers(read_json(&url, response).await?))
    }

    async fn post_account(&self, account: &Account) -> Result<(), BackendError> {
        let url = self.url("/accounts");
        expect_ok(&url, self.post_json(&url, account).await?).await?;
        Ok(())
    }

    async fn worker_for_name(&self, name: &str) -> Result<String, BackendError> {
        let url = self.url("/workers");
        let mut created = false;

        loop {
            let response = self
                .send(&url, self.client.get(&url).query(&[("name", name)]))
                .await?;

            if response.status() == StatusCode::NOT_FOUND && !created {
                tracing::info!("Creating worker {}", name);
                let body = serde_json::json!({ "name": name });
                expect_ok(&url, self.post_json(&url, &body).await?).await?;
                created = true;
                continue;
            }

            let response = expect_ok(&url, response).await?;
            let workers = collection_values(read_json(&url, response).await?);
            if workers.len() != 1 {
                return Err(BackendError::Ambiguous {
                    endpoint: url,
                    count: workers.len(),
                });
            }

            return workers[0]
                .get("_id")
                .and_then(id_from_value)
                .ok_or_else(|| BackendError::InvalidResponse {
                    endpoint: url,
                    message: "worker record has no _id".into(),
                });
        }
    }

    async fn claim_job(
        &self,
        worker_id: &str,
        device: &str,
    ) -> Result<Option<JobRecord>, BackendError> {
        let url = self.url(&format!("/jobs/getandsetworker/{}/device/{}", worker_id, device));
        let response = self.get(&url).await?;
        match response.status() {
            StatusCode::OK => read_json(&url, response).await.map(Some),
            StatusCode::NO_CONTENT => Ok(None),
            _ => Err(unexpected(&url, response).await),
        }
    }

    async fn get_job(&self, job_id: &str) -> Result<JobRecord, BackendError> {
        let url = self.url(&format!("/jobs/{}", job_id));
        let response = expect_ok(&url, self.get(&url).await?).await?;
        read_json(&url, response).await
    }

    async fn post_job(&self, job: &JobRecord) -> Result<Option<String>, BackendError> {
        let url = self.url("/jobs");
        let response = expect_ok(&url, self.post_json(&url, job).await?).await?;
        let body: Value = read_json(&url, response).await?;
        Ok(created_id(&body, "jobId"))
    }

    async fn post_app(&self, app: &Map<String, Value>) -> Result<String, BackendError> {
        self.create("/apps", app, "appId").await
    }

    async fn app_by_bundle_id(
        &self,
        bundle_id: &str,
        version: Option<&str>,
    ) -> Result<Option<AppRecord>, BackendError> {
        let url = self.url(&format!("/apps/bundleid/{}", bundle_id));
        let mut request = self.client.get(&url);
        if let Some(version) = version {
            request = request.query(&[("version", version)]);
        }

        let response = self.send(&url, request).await?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Ok(None),
            status => {
                tracing::error!("{} request failed: HTTP {}", url, status);
                return Ok(None);
            }
        }

        let mut apps = collection_values(read_json(&url, response).await?);
        if apps.len() != 1 {
            tracing::debug!("{} returned {} results", url, apps.len());
            return Ok(None);
        }

        serde_json::from_value(apps.remove(0))
            .map(Some)
            .map_err(|e| BackendError::InvalidResponse {
                endpoint: url,
                message: e.to_string(),
            })
    }

    async fn fetch_app_archive(&self, app_id: &str, dest: &Path) -> Result<bool, BackendError> {
        let url = self.url(&format!("/apps/{}/ipa", app_id));
        let response = self.get(&url).await?;
        if response.status() != StatusCode::OK {
            tracing::warn!("Unable to get app archive for app {}: HTTP {}", app_id, response.status());
            return Ok(false);
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ConnectivityError::new(&url, e))?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &bytes).await?;
        tracing::debug!("Fetched {} bytes of app {} to {}", bytes.len(), app_id, dest.display());
        Ok(true)
    }

    async fn has_app_archive(&self, app_id: &str) -> Result<bool, BackendError> {
        let url = self.url(&format!("/apps/{}/ipa", app_id));
        let response = self.send(&url, self.client.head(&url)).await?;
        Ok(response.status() == StatusCode::OK)
    }

    async fn upload_app_archive(&self, app_id: &str, archive: &Path) -> Result<(), BackendError> {
        let url = self.url(&format!("/apps/{}/ipa", app_id));
        let data = tokio::fs::read(archive).await?;
        let file_name = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.ipa", app_id));

        let form = Form::new().part("ipa", Part::bytes(data).file_name(file_name));
        expect_ok(&url, self.send(&url, self.client.post(&url).multipart(form)).await?).await?;
        Ok(())
    }

    async fn post_run(&self, run: &RunRecord) -> Result<String, BackendError> {
        self.create("/runs", run, "runId").await
    }

    async fn post_result(&self, result: &ResultRecord) -> Result<String, BackendError> {
        self.create("/results", result, "resultId").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_account_identifiers_from_keyed_listing() {
        let listing = json!({
            "1001": {"_id": "x1", "uniqueIdentifier": "1001"},
            "1002": {"_id": "x2"}
        });
        let ids = account_identifiers(listing);
        assert!(ids.contains("1001"));
        assert!(ids.contains("1002"));
    }

    #[test]
    fn test_account_identifiers_from_array() {
        let listing = json!([{"uniqueIdentifier": 1003}, {"appleId": "x@example.com"}]);
        assert_eq!(
            account_identifiers(listing),
            BTreeSet::from(["1003".to_string()])
        );
    }

    #[test]
    fn test_base_url_is_normalised() {
        let backend = HttpBackend::new("http://localhost:8000/").unwrap();
        assert_eq!(backend.base_url(), "http://localhost:8000");
        assert_eq!(backend.url("/jobs"), "http://localhost:8000/jobs");
    }
}
