//! Jobs claimed from the backend
//!
//! A [`Job`] is one of a closed set of variants built by [`JobFactory`]
//! from a backend record. Jobs with a persisted id move their backend
//! record through `running` and then `finished` or `failed`; jobs created
//! internally (without an id) never touch the backend job record.

mod exec;
mod install;
mod run;

pub use exec::ExecuteCmdJob;
pub use install::InstallAppJob;
pub use run::RunAppJob;

use std::sync::Arc;

use tracing::Instrument;

use pf_core::config::WorkerConfig;
use pf_core::traits::StoreLookup;
use pf_core::{BackendError, Device, JobExecutionError};
use pf_protocol::{JobRecord, JobState, JobType};

use crate::backend::Backend;
use crate::pilot::Pilot;

/// Everything a job needs to act on one device
#[derive(Clone)]
pub struct JobContext {
    pub backend: Arc<dyn Backend>,
    pub device: Arc<Device>,
    pub pilot: Arc<dyn Pilot>,
    pub store: Arc<dyn StoreLookup>,
    pub config: Arc<WorkerConfig>,
}

/// A unit of work for one device
#[derive(Debug)]
pub enum Job {
    InstallApp(InstallAppJob),
    RunApp(RunAppJob),
    ExecuteCmd(ExecuteCmdJob),
}

impl Job {
    /// Backend id, if the job is persisted
    pub fn id(&self) -> Option<&str> {
        match self {
            Job::InstallApp(job) => job.id(),
            Job::RunApp(job) => job.id(),
            Job::ExecuteCmd(job) => job.id(),
        }
    }

    pub fn job_type(&self) -> JobType {
        match self {
            Job::InstallApp(_) => JobType::InstallApp,
            Job::RunApp(_) => JobType::RunApp,
            Job::ExecuteCmd(_) => JobType::ExecCmd,
        }
    }

    /// Execute the job and record its outcome on the backend job record
    pub async fn execute(&mut self, ctx: &JobContext) -> Result<bool, JobExecutionError> {
        let id = self.id().map(str::to_string);
        let span = tracing::info_span!(
            "job",
            id = id.as_deref().unwrap_or("-"),
            job_type = %self.job_type()
        );

        async {
            tracing::info!("Executing job on {}", ctx.device);

            if let Some(id) = &id {
                set_state(ctx.backend.as_ref(), id, JobState::Running).await?;
            }

            let result = match self {
                Job::InstallApp(job) => job.execute(ctx).await,
                Job::RunApp(job) => job.execute(ctx).await,
                Job::ExecuteCmd(job) => job.execute(ctx).await,
            };

            let Some(id) = &id else {
                return result;
            };

            let state = match &result {
                Ok(_) => JobState::Finished,
                Err(e) => {
                    tracing::error!("Job execution failed: {}", e);
                    JobState::Failed
                }
            };
            match (set_state(ctx.backend.as_ref(), id, state).await, result) {
                (Ok(()), result) => result,
                (Err(update), Ok(_)) => Err(update.into()),
                (Err(update), Err(e)) => {
                    tracing::warn!("Unable to mark job failed: {}", update);
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }
}

/// Read the job record, set its state and write it back
async fn set_state(backend: &dyn Backend, id: &str, state: JobState) -> Result<(), BackendError> {
    let mut record = backend.get_job(id).await?;
    record.state = state;
    backend.post_job(&record).await?;
    tracing::debug!("Job {} is now {}", id, state);
    Ok(())
}

/// Builds jobs from backend records
pub struct JobFactory;

impl JobFactory {
    /// Build the job a record describes.
    ///
    /// Records without an id or with a missing or unsupported type yield
    /// no job; the caller treats that like an empty queue.
    pub fn job_from_record(record: JobRecord) -> Option<Job> {
        let Some(id) = record.id.clone() else {
            tracing::error!("Job record has no id: {:?}", record);
            return None;
        };

        let job = match record.job_type {
            Some(JobType::RunApp) => {
                Job::RunApp(RunAppJob::new(Some(id.clone()), record.job_info))
            }
            Some(JobType::InstallApp) => {
                Job::InstallApp(InstallAppJob::new(Some(id.clone()), record.job_info))
            }
            Some(JobType::ExecCmd) => {
                Job::ExecuteCmd(ExecuteCmdJob::from_record(id.clone(), record))
            }
            Some(JobType::Unsupported) => {
                tracing::error!("Job {} has an unsupported type", id);
                return None;
            }
            None => {
                tracing::error!("Job {} does not contain a type", id);
                return None;
            }
        };

        tracing::info!("Job created: {} ({})", id, job.job_type());
        Some(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestBed;
    use serde_json::json;

    fn record(value: serde_json::Value) -> JobRecord {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_factory_maps_types() {
        let run = JobFactory::job_from_record(record(json!({
            "_id": "j1", "type": "run_app", "jobInfo": {"bundleId": "com.example.app"}
        })));
        assert!(matches!(run, Some(Job::RunApp(_))));

        let install = JobFactory::job_from_record(record(json!({"_id": "j2", "type": "install_app"})));
        assert_eq!(install.unwrap().job_type(), JobType::InstallApp);

        let exec = JobFactory::job_from_record(record(json!({"_id": "j3", "type": "exec_cmd"})));
        assert_eq!(exec.unwrap().id(), Some("j3"));
    }

    #[test]
    fn test_factory_rejects_unknown_or_missing_type_and_id() {
        assert!(JobFactory::job_from_record(record(json!({"_id": "j1", "type": "reboot"}))).is_none());
        assert!(JobFactory::job_from_record(record(json!({"_id": "j1"}))).is_none());
        assert!(JobFactory::job_from_record(record(json!({"type": "run_app"}))).is_none());
    }

    #[tokio::test]
    async fn test_persisted_job_moves_to_finished() {
        let bed = TestBed::new();
        bed.backend.add_job(record(json!({
            "_id": "j1", "type": "exec_cmd", "state": "pending",
            "jobInfo": {"process": "SpringBoard", "command": "lock"}
        })));

        let mut job = JobFactory::job_from_record(bed.backend.job("j1")).unwrap();
        assert!(job.execute(&bed.context()).await.unwrap());

        assert_eq!(bed.backend.job("j1").state, JobState::Finished);
        assert_eq!(
            bed.backend.state().job_states,
            vec![("j1".to_string(), JobState::Running), ("j1".to_string(), JobState::Finished)]
        );
    }

    #[tokio::test]
    async fn test_failed_job_is_marked_failed() {
        let bed = TestBed::new();
        bed.backend.add_job(record(json!({"_id": "j1", "type": "exec_cmd", "jobInfo": {}})));

        let mut job = JobFactory::job_from_record(bed.backend.job("j1")).unwrap();
        let err = job.execute(&bed.context()).await.unwrap_err();

        assert!(matches!(err, JobExecutionError::MissingField("process")));
        assert_eq!(bed.backend.job("j1").state, JobState::Failed);
        assert!(bed.pilot.state().injections.is_empty());
    }
}
