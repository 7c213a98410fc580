use serde::Deserialize;
use std::path::Path;

use crate::error::{EngineError, Result};

/// Top-level engine configuration loaded from a TOML file. The engine owns no
/// domain data (cameras, timelines, destinations are read-model snapshots handed
/// in by the caller) — only its own runtime knobs live here.
#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineSection {
    #[serde(default = "default_preview_rtmp_url")]
    pub preview_rtmp_url: String,
    #[serde(default = "default_preview_health_url")]
    pub preview_health_url: String,
    #[serde(default = "default_preview_paths_url")]
    pub preview_paths_url: String,
    #[serde(default = "default_relay_rtmp_base")]
    pub relay_rtmp_base: String,
    #[serde(default = "default_transcoder_binary")]
    pub transcoder_binary: String,
    #[serde(default)]
    pub timeouts_secs: TimeoutsConfig,
    #[serde(default)]
    pub watchdog: WatchdogEngineConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            preview_rtmp_url: default_preview_rtmp_url(),
            preview_health_url: default_preview_health_url(),
            preview_paths_url: default_preview_paths_url(),
            relay_rtmp_base: default_relay_rtmp_base(),
            transcoder_binary: default_transcoder_binary(),
            timeouts_secs: TimeoutsConfig::default(),
            watchdog: WatchdogEngineConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Authoritative timeout table, §5.
#[derive(Debug, Deserialize, Clone)]
pub struct TimeoutsConfig {
    #[serde(default = "default_handoff_start")]
    pub handoff_start: u64,
    #[serde(default = "default_fallback_start")]
    pub fallback_start: u64,
    #[serde(default = "default_handoff_old_stop")]
    pub handoff_old_stop: u64,
    #[serde(default = "default_graceful_stop")]
    pub graceful_stop: u64,
    #[serde(default = "default_transcoder_io_chunk")]
    pub transcoder_io_chunk: u64,
    #[serde(default = "default_overlay_fetch")]
    pub overlay_fetch: u64,
    #[serde(default = "default_preview_health_timeout")]
    pub preview_health: u64,
    #[serde(default = "default_watchdog_probe")]
    pub watchdog_probe: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            handoff_start: default_handoff_start(),
            fallback_start: default_fallback_start(),
            handoff_old_stop: default_handoff_old_stop(),
            graceful_stop: default_graceful_stop(),
            transcoder_io_chunk: default_transcoder_io_chunk(),
            overlay_fetch: default_overlay_fetch(),
            preview_health: default_preview_health_timeout(),
            watchdog_probe: default_watchdog_probe(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchdogEngineConfig {
    #[serde(default = "default_watchdog_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    #[serde(default = "default_recovery_cooldown")]
    pub recovery_cooldown_secs: u64,
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold_secs: u64,
}

impl Default for WatchdogEngineConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_watchdog_check_interval(),
            unhealthy_threshold: default_unhealthy_threshold(),
            recovery_cooldown_secs: default_recovery_cooldown(),
            stall_threshold_secs: default_stall_threshold(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_tick")]
    pub tick_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_scheduler_tick(),
        }
    }
}

/// Read-only engine status surface configuration (§6).
#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            port: default_api_port(),
        }
    }
}

fn default_preview_rtmp_url() -> String {
    "rtmp://localhost:1936/preview".into()
}
fn default_preview_health_url() -> String {
    "http://localhost:9997/v1/config/get".into()
}
fn default_preview_paths_url() -> String {
    "http://localhost:9997/v1/paths/list".into()
}
fn default_relay_rtmp_base() -> String {
    "rtmp://127.0.0.1:1935/live".into()
}
fn default_transcoder_binary() -> String {
    "ffmpeg".into()
}
fn default_handoff_start() -> u64 {
    30
}
fn default_fallback_start() -> u64 {
    60
}
fn default_handoff_old_stop() -> u64 {
    10
}
fn default_graceful_stop() -> u64 {
    5
}
fn default_transcoder_io_chunk() -> u64 {
    60
}
fn default_overlay_fetch() -> u64 {
    10
}
fn default_preview_health_timeout() -> u64 {
    5
}
fn default_watchdog_probe() -> u64 {
    15
}
fn default_watchdog_check_interval() -> u64 {
    30
}
fn default_unhealthy_threshold() -> u32 {
    3
}
fn default_recovery_cooldown() -> u64 {
    120
}
fn default_stall_threshold() -> u64 {
    300
}
fn default_scheduler_tick() -> u64 {
    30
}
fn default_api_enabled() -> bool {
    true
}
fn default_api_port() -> u16 {
    8686
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("cannot read config file: {e}")))?;
        let config: EngineConfig = toml::from_str(&content)
            .map_err(|e| EngineError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.engine.transcoder_binary.trim().is_empty() {
            return Err(EngineError::Config("transcoder_binary must not be empty".into()));
        }
        if self.engine.watchdog.check_interval_secs == 0 {
            return Err(EngineError::Config(
                "watchdog.check_interval_secs must be > 0".into(),
            ));
        }
        if self.engine.scheduler.tick_interval_secs == 0 {
            return Err(EngineError::Config(
                "scheduler.tick_interval_secs must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_timeouts() {
        let cfg = EngineConfig {
            engine: EngineSection::default(),
            api: ApiConfig::default(),
        };
        assert_eq!(cfg.engine.timeouts_secs.handoff_start, 30);
        assert_eq!(cfg.engine.timeouts_secs.fallback_start, 60);
        assert_eq!(cfg.engine.timeouts_secs.handoff_old_stop, 10);
        assert_eq!(cfg.engine.timeouts_secs.graceful_stop, 5);
        assert_eq!(cfg.engine.timeouts_secs.transcoder_io_chunk, 60);
        assert_eq!(cfg.engine.timeouts_secs.overlay_fetch, 10);
        assert_eq!(cfg.engine.timeouts_secs.preview_health, 5);
        assert_eq!(cfg.engine.timeouts_secs.watchdog_probe, 15);
        assert_eq!(cfg.engine.watchdog.unhealthy_threshold, 3);
        assert_eq!(cfg.engine.watchdog.recovery_cooldown_secs, 120);
        assert_eq!(cfg.engine.watchdog.stall_threshold_secs, 300);
    }

    #[test]
    fn rejects_empty_transcoder_binary() {
        let mut engine = EngineSection::default();
        engine.transcoder_binary = "  ".into();
        let cfg = EngineConfig {
            engine,
            api: ApiConfig::default(),
        };
        assert!(cfg.validate().is_err());
    }
}
