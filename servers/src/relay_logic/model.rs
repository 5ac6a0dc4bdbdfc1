use lib_relay::core::Registration;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResponse {
    pub id: String,
    pub queue_ref: String,
}

impl From<Registration> for RegistrationResponse {
    fn from(reg: Registration) -> Self {
        Self { id: reg.id, queue_ref: reg.queue_ref.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PublisherResponse {
    pub queue_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRequest {
    pub x: i64,
    pub y: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicsRequest {
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdateRequest {
    pub field_name: String,
    pub field_value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReloadResponse {
    pub generation: u64,
}
