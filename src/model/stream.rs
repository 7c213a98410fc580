use chrono::{DateTime, Utc};
use serde::Serialize;

/// Engine-owned, updated at ≥2 Hz while a timeline runs; cleared on stop.
#[derive(Debug, Clone, Serialize)]
pub struct PlaybackPosition {
    pub timeline_id: i64,
    pub current_time: f64,
    pub current_cue_id: Option<u32>,
    pub current_cue_index: Option<usize>,
    pub loop_count: u32,
    pub total_cues: usize,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Starting,
    Running,
    Degraded,
    Restarting,
    Stopped,
    Error,
}

/// Engine-owned, per active stream. Exclusively owned by the Timeline Executor;
/// readable by the Stream Router, the Health Watchdog, and status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct StreamState {
    pub id: i64,
    pub status: StreamStatus,
    pub started_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub output_urls: Vec<String>,
    pub destination_ids: Vec<i64>,
    pub last_segment_completed_at: DateTime<Utc>,
}

/// Engine-owned, per camera.
#[derive(Debug, Clone, Serialize)]
pub struct RelayState {
    pub camera_id: i64,
    pub local_rtmp_url: String,
    pub last_restart_at: Option<DateTime<Utc>>,
}
