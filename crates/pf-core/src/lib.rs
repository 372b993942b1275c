//! pf-core: Core abstractions and configuration for pilot-fleet
//!
//! Shared types, the error taxonomy, worker configuration, and the seams to
//! everything outside the worker: device tooling, the multiplexed device
//! transport, and the App Store lookup service.

pub mod config;
pub mod device;
pub mod error;
pub mod idevice;
pub mod store;
pub mod storefront;
pub mod traits;
pub mod types;

pub use device::Device;
pub use error::{
    AgentProtocolError, BackendError, ConfigError, ConnectivityError, DeviceError,
    JobExecutionError, StoreError, TunnelError,
};
pub use types::{DeviceSerial, InstalledApp, RawAccount, StoreApp};
