//! Store accounts, device registration and worker identity records

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::records::deserialize_opt_id;

/// A store account known to a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// DSPersonID of the account
    pub unique_identifier: String,
    pub apple_id: String,
    /// Lowercase ISO country code of the account's storefront
    pub store_country: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Body of `POST /devices`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRegistration {
    pub uuid: String,
    /// Unique identifiers of the accounts signed in on the device
    pub accounts: Vec<String>,
    pub device_info: Map<String, Value>,
}

/// A worker as returned by `GET /workers?name=`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    #[serde(
        rename = "_id",
        default,
        deserialize_with = "deserialize_opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,

    #[serde(default)]
    pub name: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
