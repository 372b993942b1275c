//! pf-protocol: Wire types for pilot-fleet
//!
//! JSON records exchanged with the backend store (jobs, apps, runs,
//! accounts, workers) and with the on-device agent ("pilot"). The backend
//! keys records by `_id`; unknown fields are carried through untouched so
//! that read-modify-write updates do not drop data.

pub mod account;
pub mod app;
pub mod job;
pub mod pilot;
pub mod records;

pub use account::{Account, DeviceRegistration, WorkerRecord};
pub use app::{AppRecord, ResultInfo, ResultRecord, RunRecord, RunState};
pub use job::{AppType, JobInfo, JobRecord, JobState, JobType};
pub use pilot::{PilotStatus, TaskInfo};
