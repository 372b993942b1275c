//! Job records as stored by the backend

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::records::deserialize_opt_id;

/// Kind of work a job asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Install the app (if needed) and drive it through the agent
    RunApp,
    /// Make sure the app is installed
    InstallApp,
    /// Inject a command into a running process
    ExecCmd,
    /// Any type this worker does not know how to execute
    #[serde(other)]
    Unsupported,
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobType::RunApp => write!(f, "run_app"),
            JobType::InstallApp => write!(f, "install_app"),
            JobType::ExecCmd => write!(f, "exec_cmd"),
            JobType::Unsupported => write!(f, "unsupported"),
        }
    }
}

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Finished,
    Failed,
    /// Missing or unknown state
    #[default]
    #[serde(other)]
    Undefined,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Undefined => write!(f, "undefined"),
            JobState::Pending => write!(f, "pending"),
            JobState::Running => write!(f, "running"),
            JobState::Finished => write!(f, "finished"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

/// Where an app comes from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppType {
    /// Purchased through the App Store
    #[default]
    #[serde(rename = "AppStoreApp")]
    AppStore,
    /// Installed from the alternate (Cydia) package source
    #[serde(rename = "CydiaApp")]
    Cydia,
    #[serde(other)]
    Unsupported,
}

/// Type-specific job payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_id: Option<String>,

    /// Required app version; any installed version is accepted when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default)]
    pub app_type: AppType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_country: Option<String>,

    /// Account (DSPersonID) to purchase with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,

    /// Opaque strategy handed to the agent when running an app
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_strategy: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A job as claimed from and written back to the backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    #[serde(
        rename = "_id",
        default,
        deserialize_with = "deserialize_opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub job_type: Option<JobType>,

    #[serde(default)]
    pub state: JobState,

    #[serde(rename = "jobInfo", default)]
    pub job_info: JobInfo,

    // Older exec_cmd jobs carry their payload at the top level
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
