use serde::{Deserialize, Serialize};

/// Identity and network location of a camera. Referenced by value at timeline
/// start; the engine never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Camera {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub stream_path: String,
    /// Opaque credentials string (e.g. `user:pass`), never logged.
    pub credentials: Option<String>,
    pub onvif_port: Option<u16>,
    pub kind: CameraKind,
}

impl Camera {
    /// The RTSP URL this camera's relay process reads from.
    pub fn rtsp_url(&self) -> String {
        let auth = self
            .credentials
            .as_deref()
            .map(|c| format!("{c}@"))
            .unwrap_or_default();
        format!(
            "rtsp://{auth}{}:{}{}",
            self.address, self.port, self.stream_path
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraKind {
    Stationary,
    Ptz,
}

/// A named PTZ coordinate. A preset belongs to exactly one camera.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preset {
    pub id: i64,
    pub camera_id: i64,
    pub name: String,
    /// Normalized ONVIF pan, range [-1, 1]. `-1.0` is the sentinel meaning
    /// "use the camera-side token instead" in the source data; callers should
    /// go through [`crate::model::Coordinate::from_preset`] rather than reading
    /// these fields directly.
    pub pan: f64,
    pub tilt: f64,
    pub zoom: f64,
    pub camera_side_token: Option<String>,
}
