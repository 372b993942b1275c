//! Core domain types

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Unique serial (UDID) of an attached device
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceSerial(pub String);

impl DeviceSerial {
    /// Create a new device serial
    pub fn new(serial: impl Into<String>) -> Self {
        Self(serial.into())
    }

    /// Get the raw serial string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceSerial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DeviceSerial {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DeviceSerial {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Entry of a device's installed-app catalogue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledApp {
    pub name: String,
    pub version: String,
    /// DSPersonID of the account that purchased the app
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

/// Account entry as the device reports it, before storefront resolution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawAccount {
    pub apple_id: String,
    pub unique_identifier: String,
    /// Raw `AccountStoreFront` value, e.g. `143443-4,29`
    pub store_front: Option<String>,
}

/// An app as found in the App Store lookup service
#[derive(Debug, Clone, PartialEq)]
pub struct StoreApp {
    pub track_id: u64,
    /// Full lookup record
    pub data: Map<String, Value>,
}

impl StoreApp {
    fn field(&self, key: &str) -> Value {
        self.data.get(key).cloned().unwrap_or(Value::Null)
    }

    /// Purchase descriptor handed to the agent's store install endpoint.
    ///
    /// The agent expects the store's own buy-button attribute names.
    pub fn purchase_info(&self) -> Value {
        serde_json::json!({
            "adam-id": self.track_id.to_string(),
            "bundle-id": self.field("bundleId"),
            "title": self.field("trackName"),
            "version": self.field("version"),
            "price": self.field("price"),
            "artist-name": self.field("artistName"),
        })
    }

    /// App metadata to register with the backend, attributed to `account`
    pub fn registration(&self, account: &str) -> Map<String, Value> {
        let mut data = self.data.clone();
        data.insert("account".into(), Value::String(account.to_string()));
        data.insert("name".into(), self.field("trackName"));
        data
    }
}

/// Major component of a dotted OS version ("8.4.1" -> 8)
pub fn major_version(product_version: &str) -> Option<u32> {
    product_version.trim().split('.').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_app() -> StoreApp {
        let data = json!({
            "trackId": 284882215,
            "bundleId": "com.example.app",
            "trackName": "Example",
            "version": "3.1",
            "price": 0.0,
            "artistName": "Example Inc."
        });
        StoreApp {
            track_id: 284882215,
            data: data.as_object().cloned().unwrap(),
        }
    }

    #[test]
    fn test_major_version() {
        assert_eq!(major_version("8.4.1"), Some(8));
        assert_eq!(major_version("10.3"), Some(10));
        assert_eq!(major_version(""), None);
        assert_eq!(major_version("beta"), None);
    }

    #[test]
    fn test_purchase_info_uses_store_keys() {
        let info = store_app().purchase_info();
        assert_eq!(info["bundle-id"], "com.example.app");
        assert_eq!(info["adam-id"], "284882215");
        assert_eq!(info["title"], "Example");
    }

    #[test]
    fn test_registration_names_app_and_account() {
        let data = store_app().registration("1234567");
        assert_eq!(data["account"], "1234567");
        assert_eq!(data["name"], "Example");
        assert_eq!(data["bundleId"], "com.example.app");
    }
}
