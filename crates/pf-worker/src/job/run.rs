//! Running apps through the agent

use base64::Engine;
use serde_json::Value;

use pf_core::JobExecutionError;
use pf_protocol::{AppType, JobInfo, ResultInfo, ResultRecord, RunRecord, RunState, TaskInfo};

use super::install::{remove_archive, InstallAppJob};
use super::JobContext;

/// Installs an app if needed, then drives one automated run of it
#[derive(Debug, Clone)]
pub struct RunAppJob {
    id: Option<String>,
    info: JobInfo,
}

impl RunAppJob {
    pub fn new(id: Option<String>, info: JobInfo) -> Self {
        Self { id, info }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub async fn execute(&mut self, ctx: &JobContext) -> Result<bool, JobExecutionError> {
        let bundle_id = self
            .info
            .bundle_id
            .clone()
            .ok_or(JobExecutionError::MissingField("bundleId"))?;

        let mut install = InstallAppJob::new(None, self.info.clone());
        let newly_installed = install.execute(ctx).await?;
        tracing::debug!("{} is installed (newly: {})", bundle_id, newly_installed);

        let app_id = match install.app_id() {
            Some(app_id) => app_id.to_string(),
            None => self.lookup_app_id(ctx, &bundle_id).await?,
        };

        let run_id = ctx
            .backend
            .post_run(&RunRecord::new(&app_id, RunState::Running))
            .await?;
        tracing::info!("Created run {} for {}", run_id, bundle_id);

        match self
            .run(ctx, &bundle_id, &app_id, &run_id, newly_installed)
            .await
        {
            Ok(()) => Ok(true),
            Err(e) => {
                let failed = RunRecord::update(&run_id, &app_id, RunState::Failed)
                    .with_execution_strategy(self.info.execution_strategy.clone());
                if let Err(update) = ctx.backend.post_run(&failed).await {
                    tracing::warn!("Unable to mark run {} failed: {}", run_id, update);
                }
                Err(e)
            }
        }
    }

    /// App id for apps the install step does not register
    async fn lookup_app_id(&self, ctx: &JobContext, bundle_id: &str) -> Result<String, JobExecutionError> {
        let version = match self.info.app_type {
            AppType::AppStore => self.info.version.as_deref(),
            _ => None,
        };
        ctx.backend
            .app_by_bundle_id(bundle_id, version)
            .await?
            .and_then(|record| record.id)
            .ok_or_else(|| JobExecutionError::MissingAppRecord(bundle_id.to_string()))
    }

    async fn run(
        &self,
        ctx: &JobContext,
        bundle_id: &str,
        app_id: &str,
        run_id: &str,
        uninstall_after: bool,
    ) -> Result<(), JobExecutionError> {
        let strategy = self.info.execution_strategy.clone();

        let mut task_info = TaskInfo::new();
        task_info.insert("runId".into(), Value::from(run_id));
        task_info.insert("backendUrl".into(), Value::from(ctx.backend.base_url()));
        if let Some(strategy) = &strategy {
            task_info.insert("executionStrategy".into(), strategy.clone());
        }

        tracing::info!("Starting execution of {}", bundle_id);
        if !ctx.pilot.run_auto_execution(bundle_id, task_info).await? {
            return Err(JobExecutionError::ExecutionFailed(bundle_id.to_string()));
        }

        if ctx.config.save_run_results {
            if let Err(e) = save_run_results(ctx, bundle_id, run_id).await {
                tracing::warn!("Unable to save results of run {}: {}", run_id, e);
            }
        }

        if uninstall_after {
            tracing::info!("Uninstalling {}", bundle_id);
            if !ctx.device.uninstall(bundle_id).await? {
                tracing::warn!("Device reported failure uninstalling {}", bundle_id);
            }
        }

        ctx.backend
            .post_run(&RunRecord::update(run_id, app_id, RunState::Finished).with_execution_strategy(strategy))
            .await?;
        Ok(())
    }
}

/// Attach the app's full container to the run as a base64 `app_archive` result
async fn save_run_results(ctx: &JobContext, bundle_id: &str, run_id: &str) -> Result<(), JobExecutionError> {
    tracing::info!("Saving app archive of run {}", run_id);

    let Some(path) = ctx
        .device
        .archive(bundle_id, &ctx.config.archive_dir, false)
        .await?
    else {
        return Err(JobExecutionError::Archive {
            bundle_id: bundle_id.to_string(),
            message: "device produced no archive".into(),
        });
    };

    let data = tokio::fs::read(&path).await;
    remove_archive(&path).await;
    let data = data.map_err(|e| JobExecutionError::Archive {
        bundle_id: bundle_id.to_string(),
        message: e.to_string(),
    })?;

    let result = ResultRecord {
        run: run_id.to_string(),
        result_info: ResultInfo {
            result_type: "app_archive".into(),
            data: Value::String(base64::engine::general_purpose::STANDARD.encode(data)),
        },
    };
    let result_id = ctx.backend.post_result(&result).await?;
    tracing::debug!("Stored result {} for run {}", result_id, run_id);
    Ok(())
}
