//! Injecting commands into running processes

use pf_core::JobExecutionError;
use pf_protocol::{JobRecord, TaskInfo};

use super::JobContext;

/// Injects a (process, command) pair through the agent
#[derive(Debug, Clone)]
pub struct ExecuteCmdJob {
    id: Option<String>,
    process: Option<String>,
    command: Option<String>,
}

impl ExecuteCmdJob {
    pub fn new(id: Option<String>, process: Option<String>, command: Option<String>) -> Self {
        Self { id, process, command }
    }

    /// Payload comes from `jobInfo`, falling back to the record's top level
    pub fn from_record(id: String, record: JobRecord) -> Self {
        Self::new(
            Some(id),
            record.job_info.process.or(record.process),
            record.job_info.command.or(record.command),
        )
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub async fn execute(&mut self, ctx: &JobContext) -> Result<bool, JobExecutionError> {
        let process = self
            .process
            .as_deref()
            .ok_or(JobExecutionError::MissingField("process"))?;
        let command = self
            .command
            .as_deref()
            .ok_or(JobExecutionError::MissingField("command"))?;

        tracing::info!("Injecting into {}: {}", process, command);
        let response = ctx.pilot.inject(process, command, TaskInfo::new()).await?;
        tracing::debug!("Inject response: {}", response);
        Ok(true)
    }
}
