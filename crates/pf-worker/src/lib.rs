//! pf-worker: worker daemon for pilot-fleet
//!
//! Runs one device loop per attached device. Each loop claims jobs from
//! the backend and executes them against the device, using the on-device
//! agent ("pilot") reached through the device's tunnel endpoint.

pub mod backend;
pub mod backoff;
pub mod device_loop;
pub mod job;
pub mod pilot;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use backend::{Backend, HttpBackend};
pub use device_loop::{DeviceLoop, LoopExit};
pub use job::{Job, JobContext, JobFactory};
pub use pilot::{Pilot, PilotClient, PilotEndpoint};
pub use supervisor::Supervisor;
