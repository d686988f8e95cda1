//! Request bodies for the authority REST surface

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Request body for the create endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct NewGroupRequest {
    pub group_name: String,
}

/// Request body for the join endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct JoinGroupRequest {
    pub group_id: String,
}

/// Request body for the seek endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SeekRequest {
    pub position_ticks: i64,
}

/// Request body for the set-new-queue endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct NewQueueRequest {
    pub playing_queue: Vec<String>,
    pub playing_item_position: i64,
    pub start_position_ticks: i64,
}

/// Request body for the ready endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReadyRequest {
    pub when: DateTime<Utc>,
    pub position_ticks: i64,
    pub is_playing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playlist_item_id: Option<String>,
}

/// Request body for the buffering endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BufferingRequest {
    pub when: DateTime<Utc>,
    pub position_ticks: i64,
    pub is_playing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playlist_item_id: Option<String>,
}

/// Request body for the latency report endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PingRequest {
    pub ping: i64,
}
