use serde::{Deserialize, Serialize};

/// An external RTMP endpoint with optional watchdog control-plane configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Destination {
    pub id: i64,
    pub name: String,
    pub platform: String,
    pub base_rtmp_url: String,
    pub stream_key: String,
    pub watchdog: WatchdogConfig,
}

impl Destination {
    /// `full output URL = base ⧺ "/" ⧺ key`, per the data model invariant.
    pub fn full_rtmp_url(&self) -> String {
        format!(
            "{}/{}",
            self.base_rtmp_url.trim_end_matches('/'),
            self.stream_key
        )
    }
}

/// Per-destination watchdog behavior. `control_plane`, when present, is used
/// only by the watchdog's tier-3 recovery (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default)]
    pub enabled: bool,
    pub check_interval_secs: Option<u64>,
    pub live_indicator_url: Option<String>,
    pub control_plane: Option<ControlPlaneConfig>,
}

/// Token-auth REST API for stream health and broadcast lifecycle transitions,
/// used only by tier-3 recovery. Vendor-neutral generalization of the source's
/// YouTube-specific broadcast reset (see `SPEC_FULL.md` §4 supplemental notes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    pub base_url: String,
    pub token: String,
    pub broadcast_id: String,
}
