//! Health Watchdog (C8): one background task per (destination, stream) pair
//! checking that the transcoder feeding that destination is actually
//! producing output, and escalating through recovery tiers when it isn't.
//! Grounded in `original_source/backend/services/watchdog_manager.py` and
//! `original_source/backend/services/local_stream_watchdog.py`.

mod health;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use health::{HealthState, RecoveryTier};

use crate::config::WatchdogEngineConfig;
use crate::error::EngineError;
use crate::model::Destination;
use crate::transcoder::Supervisor;

#[derive(Debug, Clone, Serialize)]
pub struct WatchdogStatus {
    pub destination_id: i64,
    pub stream_id: i64,
    pub consecutive_unhealthy: u32,
    pub recovery_count: u32,
}

struct WatchdogHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    stream_id: i64,
    status: Arc<Mutex<WatchdogStatus>>,
}

pub struct WatchdogManager {
    supervisor: Arc<Supervisor>,
    config: WatchdogEngineConfig,
    http: Client,
    probe_timeout: Duration,
    watchdogs: Mutex<HashMap<i64, WatchdogHandle>>,
}

impl WatchdogManager {
    pub fn new(supervisor: Arc<Supervisor>, config: WatchdogEngineConfig) -> Self {
        Self::with_probe_timeout(supervisor, config, Duration::from_secs(15))
    }

    pub fn with_probe_timeout(supervisor: Arc<Supervisor>, config: WatchdogEngineConfig, probe_timeout: Duration) -> Self {
        Self {
            supervisor,
            config,
            http: Client::builder().timeout(probe_timeout).build().unwrap_or_default(),
            probe_timeout,
            watchdogs: Mutex::new(HashMap::new()),
        }
    }

    /// Starts a watchdog for `destination` monitoring `stream_id`. A no-op if
    /// one is already running for this destination, and skipped entirely if
    /// `destination.watchdog.enabled` is false.
    pub fn start_watchdog(&self, destination: Destination, stream_id: i64) {
        if !destination.watchdog.enabled {
            return;
        }
        {
            let watchdogs = self.watchdogs.lock();
            if watchdogs.contains_key(&destination.id) {
                return;
            }
        }

        let check_interval = Duration::from_secs(destination.watchdog.check_interval_secs.unwrap_or(self.config.check_interval_secs));
        let status = Arc::new(Mutex::new(WatchdogStatus {
            destination_id: destination.id,
            stream_id,
            consecutive_unhealthy: 0,
            recovery_count: 0,
        }));

        let (stop_tx, stop_rx) = oneshot::channel();
        let supervisor = self.supervisor.clone();
        let http = self.http.clone();
        let config = self.config.clone();
        let probe_timeout = self.probe_timeout;
        let task_status = status.clone();
        let destination_id = destination.id;

        let task = tokio::spawn(async move {
            run_watchdog(supervisor, http, config, destination, stream_id, check_interval, probe_timeout, task_status, stop_rx).await;
        });

        info!(destination_id, stream_id, "watchdog started");
        self.watchdogs.lock().insert(destination_id, WatchdogHandle { stop_tx: Some(stop_tx), task, stream_id, status });
    }

    /// Stops the watchdog for one destination. Idempotent.
    pub async fn stop_watchdog(&self, destination_id: i64) {
        let entry = self.watchdogs.lock().remove(&destination_id);
        let Some(mut entry) = entry else { return };
        if let Some(tx) = entry.stop_tx.take() {
            let _ = tx.send(());
        }
        let _ = entry.task.await;
        info!(destination_id, "watchdog stopped");
    }

    pub async fn restart_watchdog(&self, destination: Destination, stream_id: i64) {
        let destination_id = destination.id;
        self.stop_watchdog(destination_id).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        self.start_watchdog(destination, stream_id);
    }

    /// Called once a stream starts: arms watchdogs for every destination it
    /// feeds that has one enabled.
    pub fn notify_stream_started(&self, destinations: &[Destination], stream_id: i64) {
        for destination in destinations {
            self.start_watchdog(destination.clone(), stream_id);
        }
    }

    /// Called once a stream stops: disarms every watchdog that was watching
    /// it, regardless of which destination it belonged to.
    pub async fn notify_stream_stopped(&self, stream_id: i64) {
        let destination_ids: Vec<i64> = self
            .watchdogs
            .lock()
            .iter()
            .filter(|(_, h)| h.stream_id == stream_id)
            .map(|(id, _)| *id)
            .collect();
        for id in destination_ids {
            self.stop_watchdog(id).await;
        }
    }

    pub fn status(&self, destination_id: i64) -> Option<WatchdogStatus> {
        self.watchdogs.lock().get(&destination_id).map(|h| h.status.lock().clone())
    }

    pub fn all_statuses(&self) -> Vec<WatchdogStatus> {
        self.watchdogs.lock().values().map(|h| h.status.lock().clone()).collect()
    }

    pub async fn stop_all(&self) {
        let ids: Vec<i64> = self.watchdogs.lock().keys().copied().collect();
        for id in ids {
            self.stop_watchdog(id).await;
        }
    }
}

async fn run_watchdog(
    supervisor: Arc<Supervisor>,
    http: Client,
    config: WatchdogEngineConfig,
    destination: Destination,
    stream_id: i64,
    check_interval: Duration,
    probe_timeout: Duration,
    status: Arc<Mutex<WatchdogStatus>>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut health = HealthState::new(config.unhealthy_threshold, Duration::from_secs(config.recovery_cooldown_secs));
    let stall_threshold = Duration::from_secs(config.stall_threshold_secs);

    loop {
        tokio::select! {
            biased;
            _ = &mut stop_rx => break,
            _ = tokio::time::sleep(check_interval) => {}
        }

        let healthy = check_health(&supervisor, &http, &destination, stream_id, stall_threshold, probe_timeout).await;

        if healthy {
            health.mark_healthy();
        } else {
            let breached = health.mark_unhealthy();
            if breached && health.should_allow_recovery() {
                warn!(destination_id = destination.id, stream_id, "stream unhealthy, attempting recovery");
                let tier = health.next_tier();
                health.mark_recovery();
                recover(&supervisor, &http, &destination, stream_id, tier).await;
            }
        }

        let mut s = status.lock();
        s.consecutive_unhealthy = health.consecutive_unhealthy;
        s.recovery_count = health.recovery_count;
    }
}

async fn check_health(
    supervisor: &Supervisor,
    http: &Client,
    destination: &Destination,
    stream_id: i64,
    stall_threshold: Duration,
    probe_timeout: Duration,
) -> bool {
    let Some(state) = supervisor.stream_state(stream_id) else { return false };
    if state.status != crate::model::StreamStatus::Running {
        return false;
    }
    let stalled = Utc::now().signed_duration_since(state.last_segment_completed_at).num_seconds() > stall_threshold.as_secs() as i64;
    if stalled {
        return false;
    }
    if let Some(live_url) = &destination.watchdog.live_indicator_url {
        return check_live_indicator(http, live_url, probe_timeout).await;
    }
    true
}

/// Fetches `live_url` and scans for platform-agnostic "is live" / "is
/// offline" markers. Network errors or timeouts are treated as healthy —
/// per §4.8 a transient network failure must never count against the
/// stream, only an actual production failure should.
async fn check_live_indicator(http: &Client, live_url: &str, probe_timeout: Duration) -> bool {
    let resp = match tokio::time::timeout(probe_timeout, http.get(live_url).send()).await {
        Ok(Ok(r)) => r,
        _ => return true,
    };
    let Ok(text) = resp.text().await else { return true };
    classify_live_page(&text)
}

/// Scans page text for platform-agnostic "is live" / "is offline" markers.
/// Defaults to healthy when neither marker is present, since an unrecognized
/// page layout must not be mistaken for a production failure.
fn classify_live_page(text: &str) -> bool {
    const OFFLINE_MARKERS: &[&str] = &["\"isLive\":false", "stream is offline", "video unavailable"];
    const LIVE_MARKERS: &[&str] = &["\"isLive\":true", "watching now"];
    if OFFLINE_MARKERS.iter().any(|m| text.contains(m)) {
        return false;
    }
    if LIVE_MARKERS.iter().any(|m| text.contains(m)) {
        return true;
    }
    true
}

async fn recover(supervisor: &Supervisor, http: &Client, destination: &Destination, stream_id: i64, tier: RecoveryTier) {
    match tier {
        RecoveryTier::LocalRestart => {
            force_stop_transcoder(supervisor, stream_id).await;
        }
        RecoveryTier::ControlPlaneReset => {
            let Some(control_plane) = &destination.watchdog.control_plane else {
                // No external control plane configured: fall back to the
                // same local force-stop rather than give up entirely.
                force_stop_transcoder(supervisor, stream_id).await;
                return;
            };
            if let Err(e) = reset_broadcast(http, control_plane).await {
                warn!(stream_id, error = %e, "control-plane broadcast reset failed");
            }
        }
    }
}

/// Force-stops the transcoder backing `stream_id` rather than calling
/// `Supervisor::restart`, per §4.8: `restart` counts against the supervisor's
/// own bounded retry budget, which is meant for organic transcoder crashes,
/// not watchdog-triggered intervention. The Timeline Executor's own
/// `needs_restart` check on the next segment spins a fresh transcoder.
async fn force_stop_transcoder(supervisor: &Supervisor, stream_id: i64) {
    warn!(stream_id, "watchdog forcing transcoder stop, timeline executor will restart it");
    supervisor.stop(stream_id, false).await;
}

/// Cycles the destination's broadcast through complete → testing → live with
/// 2s gaps, per §4.8. Vendor-neutral generalization of the source's
/// YouTube-specific `reset_broadcast`.
async fn reset_broadcast(http: &Client, control_plane: &crate::model::ControlPlaneConfig) -> Result<(), EngineError> {
    for state in ["complete", "testing", "live"] {
        transition_broadcast(http, control_plane, state).await?;
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
    Ok(())
}

async fn transition_broadcast(http: &Client, control_plane: &crate::model::ControlPlaneConfig, state: &str) -> Result<(), EngineError> {
    let url = format!("{}/broadcasts/{}/transition", control_plane.base_url.trim_end_matches('/'), control_plane.broadcast_id);
    http.post(&url)
        .bearer_auth(&control_plane.token)
        .query(&[("status", state)])
        .send()
        .await
        .map_err(EngineError::from)?
        .error_for_status()
        .map_err(EngineError::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_marker_is_unhealthy() {
        assert!(!classify_live_page(r#"{"isLive":false,"viewers":0}"#));
    }

    #[test]
    fn live_marker_is_healthy() {
        assert!(classify_live_page(r#"{"isLive":true} 1,204 watching now"#));
    }

    #[test]
    fn unrecognized_page_defaults_healthy() {
        assert!(classify_live_page("<html><body>some other page</body></html>"));
    }
}
