//! Device tooling backed by the libimobiledevice command-line tools
//!
//! Every query spawns one of `idevice_id`, `ideviceinfo` or
//! `ideviceinstaller`. Structured queries ask for `--xml` output and are
//! read as property lists.

use async_trait::async_trait;
use plist::{Dictionary, Value};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::process::Command;

use crate::error::DeviceError;
use crate::traits::DeviceTools;
use crate::types::{DeviceSerial, InstalledApp, RawAccount};

const IDEVICE_ID: &str = "idevice_id";
const IDEVICEINFO: &str = "ideviceinfo";
const IDEVICEINSTALLER: &str = "ideviceinstaller";

/// [`DeviceTools`] implementation that shells out to libimobiledevice
#[derive(Debug, Clone, Default)]
pub struct IdeviceTools;

impl IdeviceTools {
    pub fn new() -> Self {
        Self
    }

    async fn ideviceinfo(
        &self,
        serial: &DeviceSerial,
        domain: Option<&str>,
        key: Option<&str>,
        xml: bool,
    ) -> Result<String, DeviceError> {
        let mut args = vec!["--udid", serial.as_str()];
        if xml {
            args.push("--xml");
        }
        if let Some(domain) = domain {
            args.extend(["--domain", domain]);
        }
        if let Some(key) = key {
            args.extend(["--key", key]);
        }
        run_tool(IDEVICEINFO, &args).await
    }

    /// Run an installer action whose only result is success or failure
    async fn installer_action(&self, args: &[&str]) -> Result<bool, DeviceError> {
        match run_tool(IDEVICEINSTALLER, args).await {
            Ok(output) => {
                tracing::debug!("{} output: {}", IDEVICEINSTALLER, output.trim());
                Ok(!output.trim().is_empty())
            }
            Err(DeviceError::Command { status, stderr, .. }) => {
                tracing::error!("{} {:?} failed ({}): {}", IDEVICEINSTALLER, args, status, stderr);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

/// Run a tool to completion and return its stdout
pub async fn run_tool(tool: &str, args: &[&str]) -> Result<String, DeviceError> {
    tracing::trace!("Running {} {:?}", tool, args);

    let output = Command::new(tool)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| DeviceError::Spawn {
            tool: tool.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(DeviceError::Command {
            tool: tool.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[async_trait]
impl DeviceTools for IdeviceTools {
    async fn list_devices(&self) -> Result<Vec<DeviceSerial>, DeviceError> {
        let output = run_tool(IDEVICE_ID, &["--list"]).await?;
        Ok(parse_device_list(&output))
    }

    async fn device_info(
        &self,
        serial: &DeviceSerial,
    ) -> Result<BTreeMap<String, String>, DeviceError> {
        let output = self.ideviceinfo(serial, None, None, true).await?;
        parse_device_info(&output)
    }

    async fn free_bytes(&self, serial: &DeviceSerial) -> Result<u64, DeviceError> {
        let output = self
            .ideviceinfo(serial, Some("com.apple.disk_usage"), Some("TotalDataAvailable"), false)
            .await?;
        match output.trim().parse::<u64>() {
            Ok(free) => Ok(free),
            Err(_) => {
                tracing::warn!(
                    "Unable to get free space for device {}. Output: {}",
                    serial,
                    output.trim()
                );
                Ok(0)
            }
        }
    }

    async fn locale(&self, serial: &DeviceSerial) -> Result<String, DeviceError> {
        let output = self
            .ideviceinfo(serial, Some("com.apple.international"), Some("Locale"), false)
            .await?;
        Ok(output.trim().to_string())
    }

    async fn known_accounts(&self, serial: &DeviceSerial) -> Result<Vec<RawAccount>, DeviceError> {
        let output = self
            .ideviceinfo(
                serial,
                Some("com.apple.mobile.iTunes.store"),
                Some("KnownAccounts"),
                true,
            )
            .await?;
        parse_known_accounts(&output)
    }

    async fn installed_apps(
        &self,
        serial: &DeviceSerial,
    ) -> Result<BTreeMap<String, InstalledApp>, DeviceError> {
        let list = ["--udid", serial.as_str(), "--list-apps", "-o", "list_user"];

        let mut xml = list.to_vec();
        xml.extend(["-o", "xml"]);

        let output = run_tool(IDEVICEINSTALLER, &xml).await?;
        if output.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        match parse_installed_apps(&output) {
            Ok(apps) => Ok(apps),
            Err(e) => {
                tracing::warn!("Failed to parse the XML app list ({}), falling back to text", e);
                let output = run_tool(IDEVICEINSTALLER, &list).await?;
                Ok(parse_installed_apps_text(&output))
            }
        }
    }

    async fn install(&self, serial: &DeviceSerial, archive: &Path) -> Result<bool, DeviceError> {
        let archive = archive.to_string_lossy();
        self.installer_action(&["--udid", serial.as_str(), "--install", &*archive])
            .await
    }

    async fn uninstall(&self, serial: &DeviceSerial, bundle_id: &str) -> Result<bool, DeviceError> {
        self.installer_action(&["--udid", serial.as_str(), "--uninstall", bundle_id])
            .await
    }

    async fn archive(
        &self,
        serial: &DeviceSerial,
        bundle_id: &str,
        dest_dir: &Path,
        app_only: bool,
    ) -> Result<Option<PathBuf>, DeviceError> {
        tokio::fs::create_dir_all(dest_dir).await?;

        let copy = format!("copy={}", dest_dir.to_string_lossy());
        let mut args = vec![
            "--udid",
            serial.as_str(),
            "--archive",
            bundle_id,
            "-o",
            copy.as_str(),
            "-o",
            "remove",
        ];
        if app_only {
            args.extend(["-o", "app_only"]);
        }

        if !self.installer_action(&args).await? {
            return Ok(None);
        }

        let path = dest_dir.join(format!("{}.ipa", bundle_id));
        if tokio::fs::try_exists(&path).await? {
            Ok(Some(path))
        } else {
            tracing::warn!("Archive of {} not found at {}", bundle_id, path.display());
            Ok(None)
        }
    }
}

/// Parse `idevice_id --list` output into serials
pub fn parse_device_list(output: &str) -> Vec<DeviceSerial> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        // newer releases append " (USB)" or " (Network)"
        .filter_map(|line| line.split_whitespace().next())
        .map(DeviceSerial::from)
        .collect()
}

/// Parse an XML property list printed by a tool
fn read_plist(tool: &str, output: &str) -> Result<Value, DeviceError> {
    Value::from_reader_xml(output.as_bytes()).map_err(|e| DeviceError::Parse {
        tool: tool.to_string(),
        message: e.to_string(),
    })
}

/// Render a scalar plist value as text; containers and blobs yield `None`
fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Integer(i) => Some(i.to_string()),
        Value::Real(r) => Some(r.to_string()),
        Value::Boolean(b) => Some(b.to_string()),
        _ => None,
    }
}

fn string_field(entry: &Dictionary, key: &str) -> Option<String> {
    entry.get(key).and_then(scalar).filter(|value| !value.is_empty())
}

/// Parse `ideviceinfo --xml` output; nested entries are skipped
pub fn parse_device_info(output: &str) -> Result<BTreeMap<String, String>, DeviceError> {
    let value = read_plist(IDEVICEINFO, output)?;
    let Some(dict) = value.as_dictionary() else {
        return Err(DeviceError::Parse {
            tool: IDEVICEINFO.to_string(),
            message: "device info is not a dictionary".to_string(),
        });
    };

    Ok(dict
        .iter()
        .filter_map(|(key, value)| scalar(value).map(|value| (key.clone(), value)))
        .collect())
}

/// Parse the `KnownAccounts` array.
///
/// Entries without a `DSPersonID` are dropped. Empty output means the
/// device knows no accounts.
pub fn parse_known_accounts(output: &str) -> Result<Vec<RawAccount>, DeviceError> {
    if output.trim().is_empty() {
        return Ok(Vec::new());
    }

    let value = read_plist(IDEVICEINFO, output)?;
    let entries = value.as_array().map(Vec::as_slice).unwrap_or_default();

    Ok(entries
        .iter()
        .filter_map(Value::as_dictionary)
        .filter_map(|entry| {
            Some(RawAccount {
                unique_identifier: string_field(entry, "DSPersonID")?,
                apple_id: string_field(entry, "AppleID").unwrap_or_default(),
                store_front: string_field(entry, "AccountStoreFront"),
            })
        })
        .collect())
}

/// Parse `ideviceinstaller --list-apps -o xml` output.
///
/// `ApplicationDSID` carries the purchasing account.
pub fn parse_installed_apps(output: &str) -> Result<BTreeMap<String, InstalledApp>, DeviceError> {
    let value = read_plist(IDEVICEINSTALLER, output)?;
    let Some(entries) = value.as_array() else {
        return Err(DeviceError::Parse {
            tool: IDEVICEINSTALLER.to_string(),
            message: "app list is not an array".to_string(),
        });
    };

    let mut apps = BTreeMap::new();
    for entry in entries.iter().filter_map(Value::as_dictionary) {
        let Some(bundle_id) = string_field(entry, "CFBundleIdentifier") else {
            continue;
        };
        let name = string_field(entry, "CFBundleDisplayName")
            .or_else(|| string_field(entry, "CFBundleName"))
            .unwrap_or_else(|| fallback_name(&bundle_id));
        let version =
            string_field(entry, "CFBundleShortVersionString").unwrap_or_else(|| "-2".to_string());

        apps.insert(
            bundle_id,
            InstalledApp {
                name,
                version,
                account_id: string_field(entry, "ApplicationDSID"),
            },
        );
    }
    Ok(apps)
}

fn legacy_app_line() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?P<bundleId>.*) - (?P<name>.*) (?P<version>(\d+\.*)+)$").ok())
        .as_ref()
}

/// Parse plain `ideviceinstaller --list-apps` output, used when the XML
/// listing is unreadable.
///
/// Current releases print CSV with a `CFBundleIdentifier` header; older
/// ones print `bundle.id - Name 1.2.3` lines. Neither names the account.
pub fn parse_installed_apps_text(output: &str) -> BTreeMap<String, InstalledApp> {
    let mut lines = output.lines().map(str::trim).filter(|l| !l.is_empty());
    let mut apps = BTreeMap::new();

    let Some(first) = lines.next() else {
        return apps;
    };

    if first.starts_with("CFBundleIdentifier") {
        let columns: Vec<String> = split_csv(first);
        let col = |name: &str| columns.iter().position(|c| c == name);
        let bundle_col = col("CFBundleIdentifier").unwrap_or(0);
        let version_col = col("CFBundleShortVersionString").or_else(|| col("CFBundleVersion"));
        let name_col = col("CFBundleDisplayName").or_else(|| col("CFBundleName"));

        for line in lines {
            let fields = split_csv(line);
            let Some(bundle_id) = fields.get(bundle_col).filter(|b| !b.is_empty()) else {
                continue;
            };
            let version = version_col
                .and_then(|i| fields.get(i))
                .cloned()
                .unwrap_or_else(|| "-2".to_string());
            let name = name_col
                .and_then(|i| fields.get(i))
                .filter(|n| !n.is_empty())
                .cloned()
                .unwrap_or_else(|| fallback_name(bundle_id));
            apps.insert(
                bundle_id.clone(),
                InstalledApp {
                    name,
                    version,
                    account_id: None,
                },
            );
        }
    } else if let Some(pattern) = legacy_app_line() {
        for line in std::iter::once(first).chain(lines) {
            let Some(caps) = pattern.captures(line) else {
                continue;
            };
            apps.insert(
                caps["bundleId"].to_string(),
                InstalledApp {
                    name: caps["name"].to_string(),
                    version: caps["version"].to_string(),
                    account_id: None,
                },
            );
        }
    }

    apps
}

fn fallback_name(bundle_id: &str) -> String {
    tracing::warn!("Using last part of bundle id {} as app name", bundle_id);
    bundle_id.rsplit('.').next().unwrap_or(bundle_id).to_string()
}

/// Split one CSV line, honouring double-quoted fields
fn split_csv(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut field).trim().to_string()),
            _ => field.push(c),
        }
    }
    fields.push(field.trim().to_string());
    fields
}
