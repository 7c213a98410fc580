//! PTZ Controller (C4). Pre-positions and moves PTZ cameras to preset
//! coordinates via ONVIF. Grounded in
//! `original_source/backend/services/ptz_service.py`'s `move_to_preset`
//! policy: prefer an absolute move to normalized coordinates, falling back
//! to the camera-side preset token (`GotoPreset`) when the coordinates are
//! the sentinel value or the absolute move itself fails.

mod onvif;

use std::time::Duration;

use tracing::{error, info, warn};

pub use onvif::OnvifClient;

use crate::error::Result;
use crate::model::{Camera, Coordinate, Preset};

const SETTLE_TIME: Duration = Duration::from_secs(2);

/// Splits a `user:pass` credentials string into its two parts.
fn split_credentials(credentials: &str) -> (&str, &str) {
    match credentials.split_once(':') {
        Some((user, pass)) => (user, pass),
        None => (credentials, ""),
    }
}

pub struct PtzController {
    onvif: OnvifClient,
}

impl PtzController {
    pub fn new() -> Self {
        Self { onvif: OnvifClient::new() }
    }

    /// Moves `camera` to `preset`. Never fails the caller's segment: errors
    /// are logged and swallowed, per §4.4 ("the engine never fails a segment
    /// because PTZ failed").
    pub async fn move_to_preset(&self, camera: &Camera, preset: &Preset) {
        if let Err(e) = self.try_move_to_preset(camera, preset).await {
            warn!(camera_id = camera.id, preset_id = preset.id, error = %e, "PTZ move failed, continuing");
        }
    }

    async fn try_move_to_preset(&self, camera: &Camera, preset: &Preset) -> Result<()> {
        let Some(credentials) = camera.credentials.as_deref() else {
            warn!(camera_id = camera.id, "no credentials configured, skipping PTZ move");
            return Ok(());
        };
        let (username, password) = split_credentials(credentials);
        let port = camera.onvif_port.unwrap_or(80);

        let conn = self.onvif.get_onvif_camera(&camera.address, port, username, password).await?;
        let profiles = self.onvif.get_profiles(&conn).await?;
        let Some(profile_token) = profiles.first() else {
            return Err(crate::error::EngineError::Onvif("camera returned no media profiles".into()));
        };

        match Coordinate::from_preset(preset) {
            Coordinate::Absolute { pan, tilt, zoom } => {
                match self.onvif.absolute_move(&conn, profile_token, pan, tilt, zoom).await {
                    Ok(()) => {
                        info!(camera_id = camera.id, preset_id = preset.id, "absolute PTZ move completed");
                        tokio::time::sleep(SETTLE_TIME).await;
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(camera_id = camera.id, error = %e, "absolute move failed, falling back to GotoPreset");
                    }
                }
            }
            Coordinate::UseCameraSideToken => {}
        }

        let token = preset.camera_side_token.clone().unwrap_or_else(|| preset.id.to_string());
        self.onvif.goto_preset(&conn, profile_token, &token).await?;
        info!(camera_id = camera.id, preset_id = preset.id, "GotoPreset completed");
        tokio::time::sleep(SETTLE_TIME).await;
        Ok(())
    }

    /// Reads the camera's current PTZ position.
    pub async fn get_position(&self, camera: &Camera) -> Result<(f64, f64, f64)> {
        let credentials = camera.credentials.as_deref().unwrap_or_default();
        let (username, password) = split_credentials(credentials);
        let port = camera.onvif_port.unwrap_or(80);
        let conn = self.onvif.get_onvif_camera(&camera.address, port, username, password).await?;
        let profiles = self.onvif.get_profiles(&conn).await?;
        let profile_token = profiles
            .first()
            .ok_or_else(|| crate::error::EngineError::Onvif("camera returned no media profiles".into()))?;
        self.onvif.get_status(&conn, profile_token).await
    }

    /// Saves the camera's current (or given) position as a named preset,
    /// returning the camera-assigned preset token.
    pub async fn set_preset(&self, camera: &Camera, preset_name: &str, preset_token: Option<&str>) -> Result<String> {
        let credentials = camera.credentials.as_deref().unwrap_or_default();
        let (username, password) = split_credentials(credentials);
        let port = camera.onvif_port.unwrap_or(80);
        let conn = self.onvif.get_onvif_camera(&camera.address, port, username, password).await?;
        let profiles = self.onvif.get_profiles(&conn).await?;
        let profile_token = profiles
            .first()
            .ok_or_else(|| crate::error::EngineError::Onvif("camera returned no media profiles".into()))?;
        match self.onvif.set_preset(&conn, profile_token, preset_name, preset_token).await {
            Ok(token) => Ok(token),
            Err(e) => {
                error!(camera_id = camera.id, error = %e, "SetPreset failed");
                Err(e)
            }
        }
    }
}

impl Default for PtzController {
    fn default() -> Self {
        Self::new()
    }
}
