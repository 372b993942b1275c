//! Agent (pilot) wire contract

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Free-form task context echoed back by the agent in its status
pub type TaskInfo = Map<String, Value>;

/// Response of `GET /status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PilotStatus {
    pub task_running: bool,
    #[serde(default)]
    pub task_info: Option<Value>,
}

impl PilotStatus {
    /// Whether a caller waiting on `expected` may stop polling.
    ///
    /// The wait is over once the agent is idle, or once it reports a task
    /// context different from the caller's (a newer task took over).
    pub fn is_finished_for(&self, expected: Option<&TaskInfo>) -> bool {
        if !self.task_running {
            return true;
        }
        match expected {
            Some(expected) if !expected.is_empty() => match &self.task_info {
                Some(Value::Object(current)) => current != expected,
                _ => true,
            },
            _ => false,
        }
    }
}

/// Body of `POST /install/appstore`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreInstallRequest<'a> {
    pub app_info: &'a Value,
    pub account_identifier: &'a str,
    pub task_info: &'a TaskInfo,
}

/// Body of `POST /install/cydia`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlternateInstallRequest<'a> {
    pub bundle_id: &'a str,
    pub task_info: &'a TaskInfo,
}

/// Body of `POST /open/{bundleId}` and `POST /execute/{bundleId}`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest<'a> {
    pub task_info: &'a TaskInfo,
}

/// Body of `POST /inject`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectRequest<'a> {
    pub process: &'a str,
    pub command: &'a str,
    pub task_info: &'a TaskInfo,
}
