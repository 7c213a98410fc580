use serde::{Deserialize, Serialize};

use super::cue::Track;

/// A graphic overlay asset. Immutable during a timeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub id: i64,
    pub kind: AssetKind,
    /// Local path, HTTP(S) image URL, or drawing export URL, depending on `kind`.
    pub source: String,
    pub position_x: f64,
    pub position_y: f64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub opacity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    LocalFile,
    RemoteImage,
    RemoteDrawing,
}

/// A composition of cues over a fixed duration, optionally looping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeline {
    pub id: i64,
    pub duration: f64,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    #[serde(rename = "loop")]
    pub loop_playback: bool,
    pub tracks: Vec<Track>,
}

impl Timeline {
    pub fn enabled_tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter().filter(|t| t.enabled)
    }
}
