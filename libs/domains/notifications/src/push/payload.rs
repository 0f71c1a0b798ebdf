//! Push task and its APNs alert payload.

use serde::Serialize;

const TITLE_LOC_KEY: &str = "PUSH_EXPIRING_APN_TITLE";
const BODY_LOC_KEY: &str = "PUSH_EXPIRING_APN_BODY";

/// One device's reminder, built from one row of the device query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationTask {
    pub device_token: String,
    pub expiring_soon_items_count: i64,
    pub closest_expiring_item_name: String,
}

impl NotificationTask {
    /// Localized alert: the title names the closest item, the body carries the count.
    pub fn payload(&self) -> ApnsPayload {
        ApnsPayload {
            aps: Aps {
                alert: Alert {
                    title_loc_key: TITLE_LOC_KEY,
                    title_loc_args: vec![self.closest_expiring_item_name.clone()],
                    loc_key: BODY_LOC_KEY,
                    loc_args: vec![self.expiring_soon_items_count.to_string()],
                },
            },
            sound: "default",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApnsPayload {
    pub aps: Aps,
    /// Top-level, outside `aps`.
    pub sound: &'static str,
}

impl ApnsPayload {
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Aps {
    pub alert: Alert,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Alert {
    pub title_loc_key: &'static str,
    pub title_loc_args: Vec<String>,
    pub loc_key: &'static str,
    pub loc_args: Vec<String>,
}
