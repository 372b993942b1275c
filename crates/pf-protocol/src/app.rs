//! App, run and result records

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::records::deserialize_opt_id;

/// App metadata as registered with the backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppRecord {
    #[serde(
        rename = "_id",
        default,
        deserialize_with = "deserialize_opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Size of the stored archive; the backend sends either a number or a string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size_bytes: Option<Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AppRecord {
    /// Archive size in bytes, if the backend reported a usable one
    pub fn archive_size(&self) -> Option<u64> {
        match self.file_size_bytes.as_ref()? {
            Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .filter(|size| *size > 0)
    }
}

/// State of a single execution attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Pending,
    Running,
    Finished,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Pending => write!(f, "pending"),
            RunState::Running => write!(f, "running"),
            RunState::Finished => write!(f, "finished"),
            RunState::Failed => write!(f, "failed"),
        }
    }
}

/// Body of `POST /runs`; carries `_id` when updating an existing run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Backend id of the app being run
    pub app: String,

    pub state: RunState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_strategy: Option<Value>,
}

impl RunRecord {
    /// A new run for `app` in the given state
    pub fn new(app: impl Into<String>, state: RunState) -> Self {
        Self {
            id: None,
            app: app.into(),
            state,
            execution_strategy: None,
        }
    }

    /// Update of an existing run
    pub fn update(id: impl Into<String>, app: impl Into<String>, state: RunState) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::new(app, state)
        }
    }

    pub fn with_execution_strategy(mut self, strategy: Option<Value>) -> Self {
        self.execution_strategy = strategy;
        self
    }
}

/// Body of `POST /results`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    /// Run the result belongs to
    pub run: String,
    pub result_info: ResultInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultInfo {
    #[serde(rename = "type")]
    pub result_type: String,
    pub data: Value,
}
