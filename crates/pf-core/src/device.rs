//! An attached device and its point-in-time properties

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;

use pf_protocol::{Account, DeviceRegistration};

use crate::error::DeviceError;
use crate::storefront::resolve_store_country;
use crate::traits::DeviceTools;
use crate::types::{major_version, DeviceSerial, InstalledApp};

/// Handle to one attached device.
///
/// Static properties (device info, locale, accounts) are read once per
/// handle; storage and the installed-app catalogue are read fresh on every
/// call.
pub struct Device {
    serial: DeviceSerial,
    tools: Arc<dyn DeviceTools>,
    info: OnceCell<BTreeMap<String, String>>,
    locale: OnceCell<String>,
    accounts: OnceCell<Vec<Account>>,
}

impl Device {
    pub fn new(serial: DeviceSerial, tools: Arc<dyn DeviceTools>) -> Self {
        Self {
            serial,
            tools,
            info: OnceCell::new(),
            locale: OnceCell::new(),
            accounts: OnceCell::new(),
        }
    }

    pub fn serial(&self) -> &DeviceSerial {
        &self.serial
    }

    /// Raw device properties
    pub async fn info(&self) -> Result<&BTreeMap<String, String>, DeviceError> {
        self.info
            .get_or_try_init(|| self.tools.device_info(&self.serial))
            .await
    }

    /// Major OS version, if the device reports a parseable `ProductVersion`
    pub async fn os_major_version(&self) -> Result<Option<u32>, DeviceError> {
        Ok(self
            .info()
            .await?
            .get("ProductVersion")
            .and_then(|v| major_version(v)))
    }

    pub async fn locale(&self) -> Result<&str, DeviceError> {
        self.locale
            .get_or_try_init(|| self.tools.locale(&self.serial))
            .await
            .map(String::as_str)
    }

    /// Store accounts with their storefront resolved to a country
    pub async fn accounts(&self) -> Result<&[Account], DeviceError> {
        self.accounts
            .get_or_try_init(|| async {
                let raw = self.tools.known_accounts(&self.serial).await?;
                if raw.is_empty() {
                    tracing::warn!("No accounts found for device {}", self.serial);
                }
                let mut accounts = Vec::with_capacity(raw.len());
                for entry in raw {
                    let resolved = resolve_store_country(entry.store_front.as_deref(), "");
                    let store_country = if resolved.is_empty() {
                        resolve_store_country(entry.store_front.as_deref(), self.locale().await?)
                    } else {
                        resolved
                    };
                    accounts.push(Account {
                        unique_identifier: entry.unique_identifier,
                        apple_id: entry.apple_id,
                        store_country,
                        password: None,
                    });
                }
                Ok::<_, DeviceError>(accounts)
            })
            .await
            .map(Vec::as_slice)
    }

    /// First known account purchasing from `country`
    pub async fn account_for_country(&self, country: &str) -> Result<Option<&Account>, DeviceError> {
        let country = country.to_lowercase();
        Ok(self
            .accounts()
            .await?
            .iter()
            .find(|account| account.store_country == country))
    }

    /// Registration body for the backend
    pub async fn registration(&self) -> Result<DeviceRegistration, DeviceError> {
        let accounts = self
            .accounts()
            .await?
            .iter()
            .map(|account| account.unique_identifier.clone())
            .collect();
        let device_info: Map<String, Value> = self
            .info()
            .await?
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();

        Ok(DeviceRegistration {
            uuid: self.serial.to_string(),
            accounts,
            device_info,
        })
    }

    pub async fn free_bytes(&self) -> Result<u64, DeviceError> {
        self.tools.free_bytes(&self.serial).await
    }

    pub async fn installed_apps(&self) -> Result<BTreeMap<String, InstalledApp>, DeviceError> {
        self.tools.installed_apps(&self.serial).await
    }

    pub async fn install(&self, archive: &Path) -> Result<bool, DeviceError> {
        self.tools.install(&self.serial, archive).await
    }

    pub async fn uninstall(&self, bundle_id: &str) -> Result<bool, DeviceError> {
        self.tools.uninstall(&self.serial, bundle_id).await
    }

    pub async fn archive(
        &self,
        bundle_id: &str,
        dest_dir: &Path,
        app_only: bool,
    ) -> Result<Option<PathBuf>, DeviceError> {
        self.tools
            .archive(&self.serial, bundle_id, dest_dir, app_only)
            .await
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Device: {}>", self.serial)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device").field("serial", &self.serial).finish()
    }
}
