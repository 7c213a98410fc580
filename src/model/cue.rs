use serde::{Deserialize, Serialize};

use super::camera::Preset;

/// Replaces the sentinel encoding (`pan == -1.0` meaning "ignore, use camera-side
/// token") with an explicit sum type, per the design note on sentinel values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Coordinate {
    Absolute { pan: f64, tilt: f64, zoom: f64 },
    UseCameraSideToken,
}

impl Coordinate {
    /// `(pan, tilt)` of -1.0 is the source data's sentinel for "no absolute
    /// coordinate, use the camera-side preset token". Anything else, including
    /// an out-of-range value, is treated as a usable absolute coordinate — the
    /// PTZ controller is responsible for falling back if the move itself fails.
    pub fn from_preset(preset: &Preset) -> Self {
        if preset.pan == -1.0 || preset.tilt == -1.0 {
            Coordinate::UseCameraSideToken
        } else {
            Coordinate::Absolute {
                pan: preset.pan,
                tilt: preset.tilt,
                zoom: preset.zoom,
            }
        }
    }
}

/// Dynamic `action_params` JSON becomes this tagged variant, validated once at
/// timeline load (per the design note on `action_params`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action_type", rename_all = "snake_case")]
pub enum CueAction {
    ShowCamera {
        camera_id: i64,
        preset_id: Option<i64>,
    },
    ShowOverlay {
        asset_id: i64,
    },
}

/// An ordered interval inside a track specifying an action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cue {
    pub order: u32,
    pub start_time: f64,
    pub duration: f64,
    #[serde(flatten)]
    pub action: CueAction,
}

impl Cue {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Video,
    Overlay,
}

/// A track owns an ordered set of cues. On the video track, cues may have gaps
/// but must not overlap. On an overlay track, cues must not overlap within the
/// same track; different overlay tracks may overlap, composited by layer order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub kind: TrackKind,
    pub layer: u32,
    pub enabled: bool,
    pub cues: Vec<Cue>,
}
