//! In-memory fakes for the worker's collaborators

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use pf_core::config::WorkerConfig;
use pf_core::traits::{DeviceTools, StoreLookup};
use pf_core::{
    AgentProtocolError, BackendError, ConnectivityError, Device, DeviceError, DeviceSerial,
    InstalledApp, RawAccount, StoreApp, StoreError,
};
use pf_protocol::{
    Account, AppRecord, DeviceRegistration, JobRecord, JobState, ResultRecord, RunRecord, TaskInfo,
};
use pf_tunnel::TunnelTable;

use crate::backend::Backend;
use crate::job::JobContext;
use crate::pilot::Pilot;

pub const DEVICE: &str = "device-1";
pub const BACKEND_URL: &str = "http://backend.test";

/// Store metadata as the lookup service returns it
pub fn store_app(bundle_id: &str, track_id: u64) -> StoreApp {
    let data = json!({
        "trackId": track_id,
        "bundleId": bundle_id,
        "trackName": "Example",
        "version": "1.0",
        "price": 0.0,
        "artistName": "Example Inc."
    });
    StoreApp {
        track_id,
        data: data.as_object().cloned().unwrap(),
    }
}

// ---------------------------------------------------------------------------
// Device tooling

pub struct ToolsState {
    pub devices: Vec<DeviceSerial>,
    pub free_bytes: u64,
    pub info: BTreeMap<String, String>,
    pub apps: BTreeMap<String, InstalledApp>,
    /// Whether pushed archives show up in the catalogue
    pub install_takes_effect: bool,
    /// Make `install` fail as if the installer could not be spawned
    pub install_spawn_fails: bool,
    pub installs: Vec<PathBuf>,
    pub uninstalls: Vec<String>,
    /// `app_only` flag of every archive request
    pub archives: Vec<bool>,
    pub catalogue_reads: usize,
}

pub struct FakeTools {
    state: Mutex<ToolsState>,
}

impl FakeTools {
    pub fn new() -> Self {
        let info = BTreeMap::from([
            ("DeviceName".to_string(), "Lab iPhone".to_string()),
            ("ProductVersion".to_string(), "8.4".to_string()),
        ]);
        Self {
            state: Mutex::new(ToolsState {
                devices: vec![DeviceSerial::new(DEVICE)],
                free_bytes: 8 << 30,
                info,
                apps: BTreeMap::new(),
                install_takes_effect: true,
                install_spawn_fails: false,
                installs: Vec::new(),
                uninstalls: Vec::new(),
                archives: Vec::new(),
                catalogue_reads: 0,
            }),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, ToolsState> {
        self.state.lock().unwrap()
    }

    pub fn install_app(&self, bundle_id: &str, version: &str, account_id: Option<&str>) {
        self.state().apps.insert(
            bundle_id.to_string(),
            InstalledApp {
                name: "Example".into(),
                version: version.into(),
                account_id: account_id.map(str::to_string),
            },
        );
    }

    pub fn set_info(&self, key: &str, value: &str) {
        self.state().info.insert(key.into(), value.into());
    }

    pub fn set_devices(&self, serials: &[&str]) {
        self.state().devices = serials.iter().map(|s| DeviceSerial::new(*s)).collect();
    }
}

#[async_trait]
impl DeviceTools for FakeTools {
    async fn list_devices(&self) -> Result<Vec<DeviceSerial>, DeviceError> {
        Ok(self.state().devices.clone())
    }

    async fn device_info(&self, _serial: &DeviceSerial) -> Result<BTreeMap<String, String>, DeviceError> {
        Ok(self.state().info.clone())
    }

    async fn free_bytes(&self, _serial: &DeviceSerial) -> Result<u64, DeviceError> {
        Ok(self.state().free_bytes)
    }

    async fn locale(&self, _serial: &DeviceSerial) -> Result<String, DeviceError> {
        Ok("de_DE".into())
    }

    async fn known_accounts(&self, _serial: &DeviceSerial) -> Result<Vec<RawAccount>, DeviceError> {
        Ok(vec![RawAccount {
            apple_id: "de@example.com".into(),
            unique_identifier: "111".into(),
            store_front: Some("143443-4,29".into()),
        }])
    }

    async fn installed_apps(
        &self,
        _serial: &DeviceSerial,
    ) -> Result<BTreeMap<String, InstalledApp>, DeviceError> {
        let mut state = self.state();
        state.catalogue_reads += 1;
        Ok(state.apps.clone())
    }

    async fn install(&self, _serial: &DeviceSerial, archive: &Path) -> Result<bool, DeviceError> {
        let takes_effect = {
            let mut state = self.state();
            state.installs.push(archive.to_path_buf());
            if state.install_spawn_fails {
                return Err(DeviceError::Spawn {
                    tool: "ideviceinstaller".into(),
                    source: std::io::ErrorKind::NotFound.into(),
                });
            }
            state.install_takes_effect
        };
        if takes_effect {
            if let Some(bundle_id) = archive.file_stem().and_then(|s| s.to_str()) {
                self.install_app(bundle_id, "1.0", None);
            }
        }
        Ok(true)
    }

    async fn uninstall(&self, _serial: &DeviceSerial, bundle_id: &str) -> Result<bool, DeviceError> {
        let mut state = self.state();
        state.uninstalls.push(bundle_id.to_string());
        Ok(state.apps.remove(bundle_id).is_some())
    }

    async fn archive(
        &self,
        _serial: &DeviceSerial,
        bundle_id: &str,
        dest_dir: &Path,
        app_only: bool,
    ) -> Result<Option<PathBuf>, DeviceError> {
        self.state().archives.push(app_only);
        std::fs::create_dir_all(dest_dir)?;
        let path = dest_dir.join(format!("{}.ipa", bundle_id));
        let kind = if app_only { "app" } else { "full" };
        std::fs::write(&path, format!("{}:{}", kind, bundle_id))?;
        Ok(Some(path))
    }
}

// ---------------------------------------------------------------------------
// Backend

#[derive(Default)]
pub struct BackendState {
    pub unreachable: bool,
    /// Connectivity failures left before worker resolution succeeds
    pub worker_failures: usize,
    pub worker_lookups: usize,
    pub claim_error: bool,

    pub devices: BTreeSet<String>,
    pub posted_devices: Vec<DeviceRegistration>,
    pub accounts: BTreeSet<String>,
    pub posted_accounts: Vec<Account>,

    pub queue: VecDeque<JobRecord>,
    pub claims: Vec<(String, String)>,
    pub jobs: BTreeMap<String, JobRecord>,
    pub job_states: Vec<(String, JobState)>,

    pub apps: Vec<AppRecord>,
    pub posted_apps: Vec<Map<String, Value>>,
    pub archives: BTreeSet<String>,
    pub uploaded: Vec<String>,
    pub runs: Vec<RunRecord>,
    pub results: Vec<ResultRecord>,
}

#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<BackendState>,
}

impl FakeBackend {
    pub fn state(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap()
    }

    fn reachable(&self) -> Result<MutexGuard<'_, BackendState>, BackendError> {
        let state = self.state();
        if state.unreachable {
            return Err(ConnectivityError::new(BACKEND_URL, "connection refused").into());
        }
        Ok(state)
    }

    pub fn add_job(&self, record: JobRecord) {
        let id = record.id.clone().unwrap_or_default();
        self.state().jobs.insert(id, record);
    }

    /// Queue a job for claiming
    pub fn enqueue(&self, record: JobRecord) {
        let mut state = self.state();
        if let Some(id) = record.id.clone() {
            state.jobs.insert(id, record.clone());
        }
        state.queue.push_back(record);
    }

    pub fn job(&self, id: &str) -> JobRecord {
        self.state().jobs[id].clone()
    }

    pub fn add_app(&self, record: AppRecord) {
        self.state().apps.push(record);
    }

    pub fn add_archive(&self, app_id: &str) {
        self.state().archives.insert(app_id.to_string());
    }
}

#[async_trait]
impl Backend for FakeBackend {
    fn base_url(&self) -> &str {
        BACKEND_URL
    }

    async fn device_exists(&self, uuid: &str) -> Result<bool, BackendError> {
        Ok(self.reachable()?.devices.contains(uuid))
    }

    async fn post_device(&self, registration: &DeviceRegistration) -> Result<(), BackendError> {
        let mut state = self.reachable()?;
        state.devices.insert(registration.uuid.clone());
        state.posted_devices.push(registration.clone());
        Ok(())
    }

    async fn accounts(&self) -> Result<BTreeSet<String>, BackendError> {
        Ok(self.reachable()?.accounts.clone())
    }

    async fn post_account(&self, account: &Account) -> Result<(), BackendError> {
        let mut state = self.reachable()?;
        state.accounts.insert(account.unique_identifier.clone());
        state.posted_accounts.push(account.clone());
        Ok(())
    }

    async fn worker_for_name(&self, _name: &str) -> Result<String, BackendError> {
        let mut state = self.state();
        state.worker_lookups += 1;
        if state.worker_failures > 0 {
            state.worker_failures -= 1;
            return Err(ConnectivityError::new(BACKEND_URL, "connection refused").into());
        }
        Ok("worker-1".into())
    }

    async fn claim_job(&self, worker_id: &str, device: &str) -> Result<Option<JobRecord>, BackendError> {
        let mut state = self.reachable()?;
        state.claims.push((worker_id.to_string(), device.to_string()));
        if state.claim_error {
            return Err(BackendError::UnexpectedStatus {
                endpoint: "/jobs/getandsetworker".into(),
                status: 500,
                body: String::new(),
            });
        }
        Ok(state.queue.pop_front())
    }

    async fn get_job(&self, job_id: &str) -> Result<JobRecord, BackendError> {
        self.reachable()?
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| BackendError::UnexpectedStatus {
                endpoint: format!("/jobs/{}", job_id),
                status: 404,
                body: String::new(),
            })
    }

    async fn post_job(&self, job: &JobRecord) -> Result<Option<String>, BackendError> {
        let mut state = self.reachable()?;
        let id = job.id.clone().unwrap_or_default();
        state.job_states.push((id.clone(), job.state));
        state.jobs.insert(id.clone(), job.clone());
        Ok(Some(id))
    }

    async fn post_app(&self, app: &Map<String, Value>) -> Result<String, BackendError> {
        let mut state = self.reachable()?;
        state.posted_apps.push(app.clone());
        Ok(format!("app-{}", state.posted_apps.len()))
    }

    async fn app_by_bundle_id(
        &self,
        bundle_id: &str,
        version: Option<&str>,
    ) -> Result<Option<AppRecord>, BackendError> {
        let state = self.reachable()?;
        let matches: Vec<&AppRecord> = state
            .apps
            .iter()
            .filter(|app| app.bundle_id.as_deref() == Some(bundle_id))
            .filter(|app| version.is_none() || app.version.as_deref() == version)
            .collect();
        Ok(match matches.as_slice() {
            [app] => Some((*app).clone()),
            _ => None,
        })
    }

    async fn fetch_app_archive(&self, app_id: &str, dest: &Path) -> Result<bool, BackendError> {
        if !self.reachable()?.archives.contains(app_id) {
            return Ok(false);
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dest, format!("ipa:{}", app_id))?;
        Ok(true)
    }

    async fn has_app_archive(&self, app_id: &str) -> Result<bool, BackendError> {
        Ok(self.reachable()?.archives.contains(app_id))
    }

    async fn upload_app_archive(&self, app_id: &str, archive: &Path) -> Result<(), BackendError> {
        std::fs::metadata(archive)?;
        let mut state = self.reachable()?;
        state.uploaded.push(app_id.to_string());
        state.archives.insert(app_id.to_string());
        Ok(())
    }

    async fn post_run(&self, run: &RunRecord) -> Result<String, BackendError> {
        let mut state = self.reachable()?;
        state.runs.push(run.clone());
        let created = state.runs.iter().filter(|r| r.id.is_none()).count();
        Ok(run.id.clone().unwrap_or_else(|| format!("run-{}", created)))
    }

    async fn post_result(&self, result: &ResultRecord) -> Result<String, BackendError> {
        let mut state = self.reachable()?;
        state.results.push(result.clone());
        Ok(format!("result-{}", state.results.len()))
    }
}

// ---------------------------------------------------------------------------
// Agent

pub struct PilotState {
    pub install_accepted: bool,
    pub execution_accepted: bool,
    pub store_installs: Vec<(Value, String, TaskInfo)>,
    pub alternate_installs: Vec<String>,
    pub opened: Vec<String>,
    pub executions: Vec<(String, TaskInfo)>,
    pub injections: Vec<(String, String)>,
}

/// Agent fake whose installs land in the device's catalogue
pub struct FakePilot {
    tools: Arc<FakeTools>,
    state: Mutex<PilotState>,
}

impl FakePilot {
    pub fn new(tools: Arc<FakeTools>) -> Self {
        Self {
            tools,
            state: Mutex::new(PilotState {
                install_accepted: true,
                execution_accepted: true,
                store_installs: Vec::new(),
                alternate_installs: Vec::new(),
                opened: Vec::new(),
                executions: Vec::new(),
                injections: Vec::new(),
            }),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, PilotState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl Pilot for FakePilot {
    async fn installed_applications(&self) -> Result<BTreeSet<String>, AgentProtocolError> {
        Ok(self.tools.state().apps.keys().cloned().collect())
    }

    async fn install_from_store(
        &self,
        app_info: &Value,
        account_identifier: &str,
        task_info: TaskInfo,
    ) -> Result<bool, AgentProtocolError> {
        let bundle_id = app_info["bundle-id"].as_str().unwrap_or_default().to_string();
        if self.installed_applications().await?.contains(&bundle_id) {
            return Err(AgentProtocolError::AlreadyInstalled(bundle_id));
        }

        let accepted = {
            let mut state = self.state();
            state
                .store_installs
                .push((app_info.clone(), account_identifier.to_string(), task_info));
            state.install_accepted
        };
        if accepted {
            let version = app_info["version"].as_str().unwrap_or("1.0");
            self.tools.install_app(&bundle_id, version, Some(account_identifier));
        }
        Ok(accepted)
    }

    async fn install_from_alternate_source(
        &self,
        bundle_id: &str,
        _task_info: TaskInfo,
    ) -> Result<bool, AgentProtocolError> {
        self.state().alternate_installs.push(bundle_id.to_string());
        self.tools.install_app(bundle_id, "1.0", None);
        Ok(true)
    }

    async fn open(&self, bundle_id: &str, _task_info: TaskInfo) -> Result<bool, AgentProtocolError> {
        self.state().opened.push(bundle_id.to_string());
        Ok(true)
    }

    async fn run_auto_execution(
        &self,
        bundle_id: &str,
        mut task_info: TaskInfo,
    ) -> Result<bool, AgentProtocolError> {
        task_info.insert("bundleId".into(), Value::from(bundle_id));
        let mut state = self.state();
        state.executions.push((bundle_id.to_string(), task_info));
        Ok(state.execution_accepted)
    }

    async fn inject(
        &self,
        process: &str,
        command: &str,
        _task_info: TaskInfo,
    ) -> Result<Value, AgentProtocolError> {
        self.state()
            .injections
            .push((process.to_string(), command.to_string()));
        Ok(json!({"status": "ok"}))
    }
}

// ---------------------------------------------------------------------------
// Store

#[derive(Default)]
pub struct FakeStore {
    apps: Mutex<BTreeMap<String, StoreApp>>,
}

impl FakeStore {
    pub fn add(&self, app: StoreApp) {
        let bundle_id = app.data["bundleId"].as_str().unwrap_or_default().to_string();
        self.apps.lock().unwrap().insert(bundle_id, app);
    }
}

#[async_trait]
impl StoreLookup for FakeStore {
    async fn lookup_bundle_id(&self, _country: &str, bundle_id: &str) -> Result<StoreApp, StoreError> {
        self.apps
            .lock()
            .unwrap()
            .get(bundle_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(bundle_id.to_string()))
    }
}

// ---------------------------------------------------------------------------

/// One device wired to fakes, with archives going to a temp directory
pub struct TestBed {
    pub tools: Arc<FakeTools>,
    pub backend: Arc<FakeBackend>,
    pub pilot: Arc<FakePilot>,
    pub store: Arc<FakeStore>,
    pub tunnels: Arc<TunnelTable>,
    pub config: WorkerConfig,
    device: Arc<Device>,
    _scratch: tempfile::TempDir,
}

impl TestBed {
    pub fn new() -> Self {
        let tools = Arc::new(FakeTools::new());
        let scratch = tempfile::tempdir().unwrap();
        let config = WorkerConfig {
            archive_dir: scratch.path().join("apparchive"),
            ..WorkerConfig::default()
        };

        let tunnels = Arc::new(TunnelTable::new());
        tunnels.insert(DeviceSerial::new(DEVICE), "127.0.0.1:40100".parse().unwrap());

        Self {
            device: Arc::new(Device::new(DeviceSerial::new(DEVICE), tools.clone())),
            pilot: Arc::new(FakePilot::new(tools.clone())),
            tools,
            backend: Arc::new(FakeBackend::default()),
            store: Arc::new(FakeStore::default()),
            tunnels,
            config,
            _scratch: scratch,
        }
    }

    pub fn with_config(mut self, update: impl FnOnce(&mut WorkerConfig)) -> Self {
        update(&mut self.config);
        self
    }

    pub fn archive_dir(&self) -> &Path {
        &self.config.archive_dir
    }

    pub fn context(&self) -> JobContext {
        JobContext {
            backend: self.backend.clone(),
            device: self.device.clone(),
            pilot: self.pilot.clone(),
            store: self.store.clone(),
            config: Arc::new(self.config.clone()),
        }
    }
}
