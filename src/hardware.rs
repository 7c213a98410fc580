//! Hardware Probe (C1). Runs once at engine start: detects the available
//! hardware encoder and the concurrency ceiling it implies.
//!
//! Grounded in `original_source/backend/services/hardware_detector.py`'s
//! `HardwareCapabilities`/`_probe_ffmpeg_encoders` detection order: a
//! platform-specific hardware marker is checked first, then the transcoder's
//! own encoder list is consulted to confirm the corresponding encoder is
//! actually built in, falling back to software.

use std::path::Path;

use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareCapabilities {
    pub encoder_tag: String,
    pub decoder_tag: Option<String>,
    pub platform_label: String,
    pub max_concurrent_streams: u32,
    pub hardware_accelerated: bool,
}

/// Runs the transcoder binary once to discover it exists and list its
/// encoders, then picks the best available encoder for this platform.
///
/// Fatal per §4.1 and §7: if the transcoder binary is absent, the engine
/// fails to start.
pub async fn probe(transcoder_binary: &str) -> Result<HardwareCapabilities> {
    let encoders = list_encoders(transcoder_binary).await?;

    if is_raspberry_pi5() && encoders.iter().any(|e| e == "h264_v4l2m2m") {
        info!(encoder = "h264_v4l2m2m", platform = "raspberry-pi-5", "hardware encoder selected");
        return Ok(HardwareCapabilities {
            encoder_tag: "h264_v4l2m2m".into(),
            decoder_tag: Some("h264_v4l2m2m".into()),
            platform_label: "raspberry-pi-5".into(),
            max_concurrent_streams: 3,
            hardware_accelerated: true,
        });
    }

    if cfg!(target_os = "macos") && encoders.iter().any(|e| e == "h264_videotoolbox") {
        let max = if is_apple_silicon() { 10 } else { 5 };
        info!(encoder = "h264_videotoolbox", platform = "macos", max_concurrent_streams = max, "hardware encoder selected");
        return Ok(HardwareCapabilities {
            encoder_tag: "h264_videotoolbox".into(),
            decoder_tag: None,
            platform_label: "macos".into(),
            max_concurrent_streams: max,
            hardware_accelerated: true,
        });
    }

    warn!("no hardware encoder detected, falling back to software (libx264)");
    Ok(HardwareCapabilities {
        encoder_tag: "libx264".into(),
        decoder_tag: None,
        platform_label: "software".into(),
        max_concurrent_streams: 2,
        hardware_accelerated: false,
    })
}

async fn list_encoders(transcoder_binary: &str) -> Result<Vec<String>> {
    let output = Command::new(transcoder_binary)
        .arg("-encoders")
        .output()
        .await
        .map_err(|_| EngineError::TranscoderBinaryMissing(transcoder_binary.to_string()))?;

    if !output.status.success() {
        return Err(EngineError::TranscoderBinaryMissing(transcoder_binary.to_string()));
    }

    let text = String::from_utf8_lossy(&output.stdout);
    Ok(text
        .lines()
        .filter(|l| l.trim_start().starts_with('V') && l.contains("h264"))
        .filter_map(|l| l.split_whitespace().nth(1).map(|s| s.to_string()))
        .collect())
}

fn is_raspberry_pi5() -> bool {
    Path::new("/dev/video11").exists()
        || std::fs::read_to_string("/proc/device-tree/model")
            .map(|m| m.contains("Raspberry Pi 5"))
            .unwrap_or(false)
}

fn is_apple_silicon() -> bool {
    cfg!(target_arch = "aarch64") && cfg!(target_os = "macos")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn software_fallback_has_lower_ceiling_than_hardware() {
        let sw = HardwareCapabilities {
            encoder_tag: "libx264".into(),
            decoder_tag: None,
            platform_label: "software".into(),
            max_concurrent_streams: 2,
            hardware_accelerated: false,
        };
        assert!(sw.max_concurrent_streams < 3);
        assert!(!sw.hardware_accelerated);
    }
}
