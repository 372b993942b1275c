//! Client for the on-device automation agent ("pilot")
//!
//! Long-running agent tasks (store installs, auto executions) are started
//! with a POST and then observed by polling `GET /status` until the agent
//! is idle or reports a different task.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::Serialize;
use serde_json::Value;

use pf_core::{AgentProtocolError, ConnectivityError, DeviceSerial, TunnelError};
use pf_protocol::pilot::{
    AlternateInstallRequest, InjectRequest, StoreInstallRequest, TaskRequest,
};
use pf_protocol::{PilotStatus, TaskInfo};
use pf_tunnel::TunnelHandle;

/// Operations offered by the agent
#[async_trait]
pub trait Pilot: Send + Sync {
    /// Bundle ids of all apps the agent sees installed
    async fn installed_applications(&self) -> Result<BTreeSet<String>, AgentProtocolError>;

    /// Buy and install an app from the store and wait for the install to end.
    ///
    /// Returns whether the app is present afterwards. Fails with
    /// [`AgentProtocolError::AlreadyInstalled`] if it was present before.
    async fn install_from_store(
        &self,
        app_info: &Value,
        account_identifier: &str,
        task_info: TaskInfo,
    ) -> Result<bool, AgentProtocolError>;

    /// Request an install from the alternate package source without waiting
    async fn install_from_alternate_source(
        &self,
        bundle_id: &str,
        task_info: TaskInfo,
    ) -> Result<bool, AgentProtocolError>;

    /// Bring an app to the foreground
    async fn open(&self, bundle_id: &str, task_info: TaskInfo) -> Result<bool, AgentProtocolError>;

    /// Start the automated execution of an app and wait for it to finish
    async fn run_auto_execution(
        &self,
        bundle_id: &str,
        task_info: TaskInfo,
    ) -> Result<bool, AgentProtocolError>;

    /// Inject a command into a running process, returning the agent's answer
    async fn inject(
        &self,
        process: &str,
        command: &str,
        task_info: TaskInfo,
    ) -> Result<Value, AgentProtocolError>;
}

/// Where the agent is reached
#[derive(Debug, Clone)]
pub enum PilotEndpoint {
    /// A fixed base URL
    Fixed(String),
    /// The device's current tunnel endpoint, looked up per request
    Tunnel {
        handle: TunnelHandle,
        serial: DeviceSerial,
    },
}

impl PilotEndpoint {
    fn base_url(&self) -> Result<String, TunnelError> {
        let url = match self {
            PilotEndpoint::Fixed(url) => url.clone(),
            PilotEndpoint::Tunnel { handle, serial } => handle
                .base_url(serial)
                .ok_or_else(|| TunnelError::NoEndpoint(serial.to_string()))?,
        };
        Ok(url.trim_end_matches('/').to_string())
    }
}

/// [`Pilot`] over HTTP
pub struct PilotClient {
    client: reqwest::Client,
    endpoint: PilotEndpoint,
    status_poll: Duration,
}

impl PilotClient {
    pub fn new(endpoint: PilotEndpoint, status_poll: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            status_poll,
        }
    }

    fn url(&self, path: &str) -> Result<String, AgentProtocolError> {
        Ok(format!("{}{}", self.endpoint.base_url()?, path))
    }

    async fn send(
        &self,
        url: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<Response, AgentProtocolError> {
        request
            .send()
            .await
            .map_err(|e| ConnectivityError::new(url, e).into())
    }

    async fn post<T: Serialize + Sync>(&self, path: &str, body: &T) -> Result<Response, AgentProtocolError> {
        let url = self.url(path)?;
        self.send(&url, self.client.post(&url).json(body)).await
    }

    /// Block until the agent is idle or has moved on from `expected`
    async fn wait_for_task_finished(&self, expected: Option<&TaskInfo>) -> Result<(), AgentProtocolError> {
        loop {
            let url = self.url("/status")?;
            let response = expect_ok(&url, self.send(&url, self.client.get(&url)).await?).await?;
            let status: PilotStatus = read_json(&url, response).await?;

            if status.is_finished_for(expected) {
                break;
            }
            tracing::debug!("Waiting for agent task to finish...");
            tokio::time::sleep(self.status_poll).await;
        }

        tracing::info!("Agent task finished");
        Ok(())
    }
}

async fn expect_ok(url: &str, response: Response) -> Result<Response, AgentProtocolError> {
    if response.status() == StatusCode::OK {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(AgentProtocolError::Status {
        endpoint: url.to_string(),
        status,
        body,
    })
}

async fn read_json<T: serde::de::DeserializeOwned>(
    url: &str,
    response: Response,
) -> Result<T, AgentProtocolError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| ConnectivityError::new(url, e))?;
    serde_json::from_slice(&bytes).map_err(|e| AgentProtocolError::InvalidResponse {
        endpoint: url.to_string(),
        message: e.to_string(),
    })
}

/// Bundle ids from an `/applications` body: object keys or array strings
fn bundle_ids(body: &[u8]) -> Result<BTreeSet<String>, serde_json::Error> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(BTreeSet::new());
    }
    let ids = match serde_json::from_slice(body)? {
        Value::Object(map) => map.into_iter().map(|(k, _)| k).collect(),
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(id) => Some(id),
                _ => None,
            })
            .collect(),
        _ => BTreeSet::new(),
    };
    Ok(ids)
}

#[async_trait]
impl Pilot for PilotClient {
    async fn installed_applications(&self) -> Result<BTreeSet<String>, AgentProtocolError> {
        let url = self.url("/applications")?;
        let response = expect_ok(&url, self.send(&url, self.client.get(&url)).await?).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| ConnectivityError::new(&url, e))?;
        bundle_ids(&body).map_err(|e| AgentProtocolError::InvalidResponse {
            endpoint: url,
            message: e.to_string(),
        })
    }

    async fn install_from_store(
        &self,
        app_info: &Value,
        account_identifier: &str,
        mut task_info: TaskInfo,
    ) -> Result<bool, AgentProtocolError> {
        task_info.insert("worker_action".into(), Value::from("install_appstore"));

        // store metadata names the bundle id `bundle-id`
        let bundle_id = app_info.get("bundle-id").and_then(Value::as_str);
        if let Some(bundle_id) = bundle_id {
            if self.installed_applications().await?.contains(bundle_id) {
                return Err(AgentProtocolError::AlreadyInstalled(bundle_id.to_string()));
            }
        }

        let request = StoreInstallRequest {
            app_info,
            account_identifier,
            task_info: &task_info,
        };
        let response = self.post("/install/appstore", &request).await?;
        if response.status() != StatusCode::OK {
            tracing::error!(
                "Initiating install failed with HTTP {}: {}",
                response.status(),
                response.text().await.unwrap_or_default()
            );
            return Ok(false);
        }

        self.wait_for_task_finished(None).await?;

        match bundle_id {
            Some(bundle_id) => Ok(self.installed_applications().await?.contains(bundle_id)),
            None => Ok(true),
        }
    }

    async fn install_from_alternate_source(
        &self,
        bundle_id: &str,
        task_info: TaskInfo,
    ) -> Result<bool, AgentProtocolError> {
        let request = AlternateInstallRequest {
            bundle_id,
            task_info: &task_info,
        };
        let response = self.post("/install/cydia", &request).await?;
        if response.status() != StatusCode::OK {
            tracing::error!("Install of {} failed with HTTP {}", bundle_id, response.status());
            return Ok(false);
        }
        Ok(true)
    }

    async fn open(&self, bundle_id: &str, task_info: TaskInfo) -> Result<bool, AgentProtocolError> {
        let request = TaskRequest {
            task_info: &task_info,
        };
        let response = self.post(&format!("/open/{}", bundle_id), &request).await?;
        if response.status() != StatusCode::OK {
            tracing::error!("Open of {} failed with HTTP {}", bundle_id, response.status());
            return Ok(false);
        }
        Ok(true)
    }

    async fn run_auto_execution(
        &self,
        bundle_id: &str,
        mut task_info: TaskInfo,
    ) -> Result<bool, AgentProtocolError> {
        tracing::info!("Starting execution of {}", bundle_id);
        task_info.insert("bundleId".into(), Value::from(bundle_id));

        let request = TaskRequest {
            task_info: &task_info,
        };
        let response = self.post(&format!("/execute/{}", bundle_id), &request).await?;
        if response.status() != StatusCode::OK {
            tracing::error!("Execution of {} failed with HTTP {}", bundle_id, response.status());
            return Ok(false);
        }

        self.wait_for_task_finished(Some(&task_info)).await?;
        tracing::info!("Execution of {} finished", bundle_id);
        Ok(true)
    }

    async fn inject(
        &self,
        process: &str,
        command: &str,
        task_info: TaskInfo,
    ) -> Result<Value, AgentProtocolError> {
        let request = InjectRequest {
            process,
            command,
            task_info: &task_info,
        };
        let url = self.url("/inject")?;
        let response = expect_ok(&url, self.send(&url, self.client.post(&url).json(&request)).await?).await?;

        let body = response
            .bytes()
            .await
            .map_err(|e| ConnectivityError::new(&url, e))?;
        if body.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&body).map_err(|e| AgentProtocolError::InvalidResponse {
            endpoint: url,
            message: e.to_string(),
        })
    }
}
