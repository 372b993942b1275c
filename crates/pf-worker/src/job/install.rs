//! Installing apps on a device
//!
//! Resolution order for App Store apps:
//! 1. installed at a compatible version and known to the backend: nothing to do
//! 2. installed at a different version: fail
//! 3. not installed, backend holds a small enough archive: push it to the device
//! 4. otherwise buy/install through the agent and register the app

use std::path::Path;

use serde_json::Value;

use pf_core::JobExecutionError;
use pf_protocol::{AppRecord, AppType, JobInfo, TaskInfo};

use super::JobContext;

/// Ensures an app is installed on the device
#[derive(Debug, Clone)]
pub struct InstallAppJob {
    id: Option<String>,
    info: JobInfo,
    app_id: Option<String>,
}

impl InstallAppJob {
    pub fn new(id: Option<String>, info: JobInfo) -> Self {
        Self {
            id,
            info,
            app_id: None,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Backend id of the installed app, once known
    pub fn app_id(&self) -> Option<&str> {
        self.app_id.as_deref()
    }

    /// Install the app; returns whether it was newly installed
    pub async fn execute(&mut self, ctx: &JobContext) -> Result<bool, JobExecutionError> {
        let bundle_id = self
            .info
            .bundle_id
            .clone()
            .ok_or(JobExecutionError::MissingField("bundleId"))?;

        let newly_installed = match self.info.app_type {
            AppType::AppStore => self.install_from_store(ctx, &bundle_id).await?,
            AppType::Cydia => {
                tracing::info!("Installing {} from the alternate source", bundle_id);
                if !ctx
                    .pilot
                    .install_from_alternate_source(&bundle_id, TaskInfo::new())
                    .await?
                {
                    return Err(JobExecutionError::InstallFailed(bundle_id));
                }
                return Ok(true);
            }
            AppType::Unsupported => return Err(JobExecutionError::UnsupportedAppType),
        };

        if let Some(app_id) = self.app_id.clone() {
            self.archive_app_binary(ctx, &bundle_id, &app_id).await?;
        }

        Ok(newly_installed)
    }

    async fn install_from_store(
        &mut self,
        ctx: &JobContext,
        bundle_id: &str,
    ) -> Result<bool, JobExecutionError> {
        let installed_apps = ctx.device.installed_apps().await?;
        let version = self.info.version.as_deref();

        let installed = installed_apps.get(bundle_id);
        if let (Some(app), Some(requested)) = (installed, version) {
            if app.version != requested {
                return Err(JobExecutionError::VersionConflict {
                    bundle_id: bundle_id.to_string(),
                    installed: app.version.clone(),
                    requested: requested.to_string(),
                });
            }
        }
        let already_installed = installed.is_some();

        let record = ctx.backend.app_by_bundle_id(bundle_id, version).await?;
        tracing::debug!("Backend record for {}: {:?}", bundle_id, record);
        self.app_id = record.as_ref().and_then(|r| r.id.clone());

        if already_installed {
            if self.app_id.is_some() {
                tracing::info!("{} is already installed and registered", bundle_id);
                return Ok(false);
            }
        } else if let Some(record) = &record {
            if self.install_from_archive(ctx, bundle_id, record).await? {
                return Ok(true);
            }
        }

        let country = self
            .info
            .store_country
            .as_deref()
            .unwrap_or(&ctx.config.default_store_country)
            .to_lowercase();
        let store_app = ctx.store.lookup_bundle_id(&country, bundle_id).await?;

        let account = if already_installed {
            installed.and_then(|app| app.account_id.clone())
        } else {
            match &self.info.account_id {
                Some(account) => Some(account.clone()),
                None => ctx
                    .device
                    .account_for_country(&country)
                    .await?
                    .map(|account| account.unique_identifier.clone()),
            }
        };
        let account = account
            .filter(|account| !account.is_empty())
            .ok_or_else(|| JobExecutionError::NoAccount(country.clone()))?;
        tracing::debug!("Using account {}", account);

        if !already_installed {
            tracing::info!("Installing {} from the store", bundle_id);
            let mut task_info = TaskInfo::new();
            task_info.insert("backendUrl".into(), Value::from(ctx.backend.base_url()));

            if !ctx
                .pilot
                .install_from_store(&store_app.purchase_info(), &account, task_info)
                .await?
            {
                return Err(JobExecutionError::InstallFailed(bundle_id.to_string()));
            }
        }

        let app_id = ctx.backend.post_app(&store_app.registration(&account)).await?;
        tracing::info!("Registered {} as app {}", bundle_id, app_id);
        self.app_id = Some(app_id);

        Ok(!already_installed)
    }

    /// Push the backend's archive to the device.
    ///
    /// Returns `false` when the archive path does not apply or did not
    /// produce an installed app; the caller then falls back to the store.
    async fn install_from_archive(
        &self,
        ctx: &JobContext,
        bundle_id: &str,
        record: &AppRecord,
    ) -> Result<bool, JobExecutionError> {
        let Some(app_id) = record.id.as_deref() else {
            return Ok(false);
        };
        let policy = &ctx.config.install;

        match record.archive_size() {
            None => {
                tracing::info!("Skipping archive install of {}: unknown archive size", bundle_id);
                return Ok(false);
            }
            Some(size) if size > policy.max_archive_install_bytes => {
                tracing::info!("Skipping archive install of {}: archive too large ({} bytes)", bundle_id, size);
                return Ok(false);
            }
            Some(size) => tracing::info!("Installing {} from backend archive ({} bytes)", bundle_id, size),
        }

        let path = ctx.config.archive_dir.join(format!("{}.ipa", bundle_id));
        if !ctx.backend.fetch_app_archive(app_id, &path).await? {
            tracing::warn!("Unable to get app archive from backend for app {}", app_id);
            return Ok(false);
        }

        let pushed = ctx.device.install(&path).await;
        remove_archive(&path).await;
        match pushed {
            Ok(true) => {}
            Ok(false) => tracing::warn!("Device reported failure installing {}", bundle_id),
            Err(e) => tracing::warn!("Unable to push {} to the device: {}", bundle_id, e),
        }

        let retries = policy.install_retries;
        for attempt in 0..=retries {
            if ctx.device.installed_apps().await?.contains_key(bundle_id) {
                return Ok(true);
            }
            if attempt < retries {
                tokio::time::sleep(ctx.config.poll.install_retry_interval).await;
            }
        }

        tracing::warn!("Installing {} from archive failed, installing from the store instead", bundle_id);
        Ok(false)
    }

    /// Upload the app binary unless the backend has it or the OS cannot export it
    async fn archive_app_binary(
        &self,
        ctx: &JobContext,
        bundle_id: &str,
        app_id: &str,
    ) -> Result<(), JobExecutionError> {
        match ctx.device.os_major_version().await? {
            Some(major) if major <= ctx.config.install.archive_max_os_major => {}
            major => {
                tracing::debug!("Skipping app archiving on OS major version {:?}", major);
                return Ok(());
            }
        }

        if ctx.backend.has_app_archive(app_id).await? {
            return Ok(());
        }

        tracing::debug!("Archiving {}", bundle_id);
        let path = ctx
            .device
            .archive(bundle_id, &ctx.config.archive_dir, true)
            .await?
            .ok_or_else(|| JobExecutionError::Archive {
                bundle_id: bundle_id.to_string(),
                message: "device produced no archive".into(),
            })?;

        let uploaded = ctx.backend.upload_app_archive(app_id, &path).await;
        remove_archive(&path).await;
        uploaded?;

        tracing::info!("Uploaded archive of {} for app {}", bundle_id, app_id);
        Ok(())
    }
}

pub(super) async fn remove_archive(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::warn!("Unable to remove {}: {}", path.display(), e);
    }
}
