//! Error taxonomy for pilot-fleet

use std::path::PathBuf;
use thiserror::Error;

/// Network failure reaching a remote endpoint (backend or agent).
///
/// A device loop that sees this presumes its device or the backend is
/// unreachable and stops; it is restarted by rediscovery, not retried in place.
#[derive(Error, Debug, Clone)]
#[error("Unable to reach {target}: {message}")]
pub struct ConnectivityError {
    /// URL or endpoint that could not be reached
    pub target: String,
    /// Underlying transport error
    pub message: String,
}

impl ConnectivityError {
    pub fn new(target: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self {
            target: target.into(),
            message: error.to_string(),
        }
    }
}

/// Unexpected or ambiguous backend responses
#[derive(Error, Debug)]
pub enum BackendError {
    /// Response status the call does not accept
    #[error("Unexpected response from {endpoint}: HTTP {status}")]
    UnexpectedStatus {
        endpoint: String,
        status: u16,
        body: String,
    },

    /// A lookup that must resolve to exactly one record did not
    #[error("Ambiguous result from {endpoint}: {count} matches")]
    Ambiguous { endpoint: String, count: usize },

    /// Body could not be decoded or lacks a required field
    #[error("Invalid response from {endpoint}: {message}")]
    InvalidResponse { endpoint: String, message: String },

    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),

    /// Local file handling around archive transfers
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunnel (relay) failures
#[derive(Error, Debug)]
pub enum TunnelError {
    /// No relay endpoint is currently registered for the device
    #[error("No tunnel endpoint for device {0}")]
    NoEndpoint(String),

    /// Local listener could not be allocated
    #[error("Failed to bind relay listener: {0}")]
    Bind(#[source] std::io::Error),

    /// Opening a channel to the device port failed
    #[error("Failed to connect to port {port} on device {serial}: {message}")]
    Connect {
        serial: String,
        port: u16,
        message: String,
    },

    /// Device enumeration on the transport failed
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Malformed or failed exchanges with the on-device agent
#[derive(Error, Debug)]
pub enum AgentProtocolError {
    /// Agent answered with a non-success status
    #[error("Agent request {endpoint} failed with HTTP {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    /// Agent response body could not be decoded
    #[error("Invalid agent response from {endpoint}: {message}")]
    InvalidResponse { endpoint: String, message: String },

    /// Store install requested for an app that is already present
    #[error("App already installed: {0}")]
    AlreadyInstalled(String),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),
}

/// Failures of the device-local tooling
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Tool could not be spawned
    #[error("Failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    /// Tool ran but reported failure
    #[error("{tool} failed ({status}): {stderr}")]
    Command {
        tool: String,
        status: String,
        stderr: String,
    },

    /// Tool output could not be interpreted
    #[error("Unexpected output from {tool}: {message}")]
    Parse { tool: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// App Store lookup failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Bundle id not found in store: {0}")]
    NotFound(String),

    #[error("Bundle id not unique in store: {0}")]
    NotUnique(String),

    #[error("Invalid store response: {0}")]
    InvalidResponse(String),

    #[error("Store request failed with HTTP {0}")]
    Status(u16),

    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),
}

/// Anything that makes a job fail
#[derive(Error, Debug)]
pub enum JobExecutionError {
    /// Job payload lacks a required field
    #[error("Missing job field: {0}")]
    MissingField(&'static str),

    /// Installed version differs from the requested one
    #[error("Wrong version of {bundle_id} installed: {installed} (requested {requested})")]
    VersionConflict {
        bundle_id: String,
        installed: String,
        requested: String,
    },

    #[error("Unsupported app type")]
    UnsupportedAppType,

    /// No account usable for a store purchase
    #[error("No account available for store country {0}")]
    NoAccount(String),

    #[error("Installing {0} failed")]
    InstallFailed(String),

    /// Agent refused to start the execution
    #[error("Execution of {0} could not be started")]
    ExecutionFailed(String),

    /// Backend holds no app record to attach runs/archives to
    #[error("No app record for {0}")]
    MissingAppRecord(String),

    #[error("Archiving {bundle_id} failed: {message}")]
    Archive { bundle_id: String, message: String },

    #[error("App lookup failed: {0}")]
    Lookup(#[from] StoreError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentProtocolError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
}

impl JobExecutionError {
    /// Whether the failure means the backend or the device cannot be reached
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            JobExecutionError::Backend(BackendError::Connectivity(_))
                | JobExecutionError::Agent(AgentProtocolError::Connectivity(_))
        )
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
}
