//! Device-local tooling

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::DeviceError;
use crate::types::{DeviceSerial, InstalledApp, RawAccount};

/// Raw queries and operations against attached devices.
///
/// Implementations wrap whatever tooling talks to the hardware; the worker
/// only depends on the structured values returned here.
#[async_trait]
pub trait DeviceTools: Send + Sync {
    /// Serials of all currently attached devices
    async fn list_devices(&self) -> Result<Vec<DeviceSerial>, DeviceError>;

    /// Raw device properties (`DeviceName`, `ProductVersion`, ...)
    async fn device_info(&self, serial: &DeviceSerial)
        -> Result<BTreeMap<String, String>, DeviceError>;

    /// Free space on the data partition
    async fn free_bytes(&self, serial: &DeviceSerial) -> Result<u64, DeviceError>;

    /// Locale setting, e.g. `de_DE`
    async fn locale(&self, serial: &DeviceSerial) -> Result<String, DeviceError>;

    /// Store accounts known to the device
    async fn known_accounts(&self, serial: &DeviceSerial) -> Result<Vec<RawAccount>, DeviceError>;

    /// User-installed apps keyed by bundle id
    async fn installed_apps(
        &self,
        serial: &DeviceSerial,
    ) -> Result<BTreeMap<String, InstalledApp>, DeviceError>;

    /// Push an archive to the device; `Ok(false)` if the tool reported failure
    async fn install(&self, serial: &DeviceSerial, archive: &Path) -> Result<bool, DeviceError>;

    /// Remove an app; `Ok(false)` if the tool reported failure
    async fn uninstall(&self, serial: &DeviceSerial, bundle_id: &str) -> Result<bool, DeviceError>;

    /// Copy an installed app into `dest_dir`, returning the archive path.
    ///
    /// With `app_only` the archive holds the app bundle without its documents.
    async fn archive(
        &self,
        serial: &DeviceSerial,
        bundle_id: &str,
        dest_dir: &Path,
        app_only: bool,
    ) -> Result<Option<PathBuf>, DeviceError>;
}
