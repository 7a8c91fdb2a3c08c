//! Direct transport: no network endpoint, packets travel over the payload channel

use crate::types::AppData;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectTransportOptions {
    pub max_message_size: u32,
    #[serde(skip)]
    pub app_data: AppData,
}

impl Default for DirectTransportOptions {
    fn default() -> Self {
        Self {
            max_message_size: 262_144,
            app_data: AppData::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DirectTransportData {
    pub max_message_size: u32,
}
