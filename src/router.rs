//! Stream Router (C7): the idle → preview → live state machine that sits in
//! front of the Timeline Executor so an operator can preview a timeline
//! privately before sending it to real destinations. Grounded in
//! `original_source/backend/services/stream_router.py`.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::model::{Asset, Camera, Destination, Preset, Timeline};
use crate::timeline::{StartTimelineRequest, TimelineExecutor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviewMode {
    Idle,
    Preview,
    Live,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterStatus {
    pub mode: PreviewMode,
    pub timeline_id: Option<i64>,
    pub destination_ids: Vec<i64>,
}

/// What `start_preview` needs; output URLs are decided by the router itself
/// based on whether it is in preview or live mode.
pub struct PreviewRequest {
    pub timeline: Timeline,
    pub cameras: Vec<Camera>,
    pub presets: Vec<Preset>,
    pub assets: Vec<Asset>,
}

/// The preview context kept around so `go_live` can restart the same
/// timeline against live output URLs without the caller re-supplying it.
struct ActivePreview {
    timeline: Timeline,
    cameras: Vec<Camera>,
    presets: Vec<Preset>,
    assets: Vec<Asset>,
}

struct RouterState {
    mode: PreviewMode,
    active: Option<ActivePreview>,
    destination_ids: Vec<i64>,
}

/// Serializes all state transitions behind a single async mutex, per §4.7's
/// "at most one transition in flight" invariant.
pub struct StreamRouter {
    executor: Arc<TimelineExecutor>,
    preview_rtmp_url: String,
    preview_health_url: String,
    preview_health_timeout: Duration,
    http: Client,
    state: Mutex<RouterState>,
}

impl StreamRouter {
    pub fn new(executor: Arc<TimelineExecutor>, preview_rtmp_url: String) -> Self {
        Self::with_health_check(executor, preview_rtmp_url, "http://localhost:9997/v1/config/get".into(), Duration::from_secs(5))
    }

    pub fn with_health_check(
        executor: Arc<TimelineExecutor>,
        preview_rtmp_url: String,
        preview_health_url: String,
        preview_health_timeout: Duration,
    ) -> Self {
        Self {
            executor,
            preview_rtmp_url,
            preview_health_url,
            preview_health_timeout,
            http: Client::builder().timeout(preview_health_timeout).build().unwrap_or_default(),
            state: Mutex::new(RouterState { mode: PreviewMode::Idle, active: None, destination_ids: Vec::new() }),
        }
    }

    /// Starts `request.timeline` against the private preview URL only.
    /// Requires the router to be idle and the preview server's health
    /// endpoint to answer within `preview_health_timeout`, per §4.7 — any
    /// 2xx or 401 response counts as healthy.
    pub async fn start_preview(&self, request: PreviewRequest) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.mode != PreviewMode::Idle {
            return Err(EngineError::InvalidTimeline { id: request.timeline.id, reason: "router is not idle".into() });
        }
        if !self.preview_server_healthy().await {
            return Err(EngineError::Config("preview server health check failed".into()));
        }

        let timeline_id = request.timeline.id;
        self.executor
            .start_timeline(StartTimelineRequest {
                timeline: request.timeline.clone(),
                cameras: request.cameras.clone(),
                presets: request.presets.clone(),
                assets: request.assets.clone(),
                destinations: Vec::new(),
                output_urls: vec![self.preview_rtmp_url.clone()],
                start_position: None,
            })
            .await?;

        state.mode = PreviewMode::Preview;
        state.destination_ids = Vec::new();
        state.active = Some(ActivePreview {
            timeline: request.timeline,
            cameras: request.cameras,
            presets: request.presets,
            assets: request.assets,
        });
        info!(timeline_id, "preview started");
        Ok(())
    }

    /// Stops whatever is active and returns to idle. A no-op if already idle.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if state.mode == PreviewMode::Idle {
            return;
        }
        if let Some(active) = &state.active {
            let timeline_id = active.timeline.id;
            self.executor.stop_timeline(timeline_id).await;
            info!(timeline_id, "router stream stopped");
        }
        state.mode = PreviewMode::Idle;
        state.active = None;
        state.destination_ids = Vec::new();
    }

    /// Promotes a running preview to live destinations. The timeline restarts
    /// from the beginning against the live output URLs rather than handing
    /// off seamlessly — a deliberate simplification per §4.7's non-goal of
    /// gapless preview→live transition.
    pub async fn go_live(&self, destinations: Vec<Destination>) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.mode != PreviewMode::Preview {
            return Err(EngineError::InvalidTimeline { id: 0, reason: "router is not in preview".into() });
        }
        let active = state.active.take().ok_or_else(|| EngineError::InvalidTimeline { id: 0, reason: "no active preview timeline".into() })?;
        let timeline_id = active.timeline.id;

        self.executor.stop_timeline(timeline_id).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let output_urls = destinations.iter().map(|d| d.full_rtmp_url()).collect();
        let destination_ids = destinations.iter().map(|d| d.id).collect::<Vec<_>>();

        let result = self
            .executor
            .start_timeline(StartTimelineRequest {
                timeline: active.timeline.clone(),
                cameras: active.cameras.clone(),
                presets: active.presets.clone(),
                assets: active.assets.clone(),
                destinations,
                output_urls,
                start_position: None,
            })
            .await;

        match result {
            Ok(()) => {
                state.mode = PreviewMode::Live;
                state.destination_ids = destination_ids;
                state.active = Some(active);
                info!(timeline_id, "router went live");
                Ok(())
            }
            Err(e) => {
                // Leave the router idle rather than stuck mid-transition with
                // neither a preview nor a live stream running.
                state.mode = PreviewMode::Idle;
                state.active = None;
                Err(e)
            }
        }
    }

    /// Any 2xx or 401 response counts as healthy (401 means the preview
    /// server is up but the engine's request lacked credentials, which
    /// still proves liveness); a network error or timeout is unhealthy.
    async fn preview_server_healthy(&self) -> bool {
        match tokio::time::timeout(self.preview_health_timeout, self.http.get(&self.preview_health_url).send()).await {
            Ok(Ok(resp)) => resp.status().is_success() || resp.status() == reqwest::StatusCode::UNAUTHORIZED,
            Ok(Err(e)) => {
                warn!(error = %e, "preview server health check request failed");
                false
            }
            Err(_) => {
                warn!("preview server health check timed out");
                false
            }
        }
    }

    pub async fn status(&self) -> RouterStatus {
        let state = self.state.lock().await;
        RouterStatus {
            mode: state.mode,
            timeline_id: state.active.as_ref().map(|a| a.timeline.id),
            destination_ids: state.destination_ids.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_mode_serializes_snake_case() {
        let json = serde_json::to_string(&PreviewMode::Preview).unwrap();
        assert_eq!(json, "\"preview\"");
    }
}
