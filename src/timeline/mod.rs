//! Timeline Executor (C6): the engine's main driver. Walks a timeline's
//! segments in order, keeping exactly one transcoder running per active
//! timeline and switching cameras/overlays/PTZ position as segments change,
//! handing off between cameras without dropping the output stream where
//! possible. Grounded in
//! `original_source/backend/services/timeline_executor.py`'s
//! `TimelineExecutor`/`_execute_timeline`/`_execute_segment`.

mod segments;
mod position;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub use segments::{active_video_cue, compute_segments, Segment};

use crate::config::TimeoutsConfig;
use crate::error::{EngineError, Result};
use crate::hardware::HardwareCapabilities;
use crate::model::{Asset, Camera, Destination, PlaybackPosition, Preset, StreamStatus, Timeline};
use crate::overlay::OverlayPrefetcher;
use crate::ptz::PtzController;
use crate::relay::RelayPool;
use crate::transcoder::command::{EncodingProfile, StartParams, TimedOverlay};
use crate::transcoder::Supervisor;
use crate::watchdog::WatchdogManager;

/// Offset added to a timeline id to derive the temporary stream id used
/// while handing off between cameras, per §4.6. Timeline ids and real stream
/// ids are the same namespace, so this must stay clear of any real id.
const HANDOFF_STREAM_ID_OFFSET: i64 = 1_000_000;

/// Everything the executor needs to run one timeline; assembled by the
/// caller from the persistence layer's read models.
pub struct StartTimelineRequest {
    pub timeline: Timeline,
    pub cameras: Vec<Camera>,
    pub presets: Vec<Preset>,
    pub assets: Vec<Asset>,
    pub destinations: Vec<Destination>,
    pub output_urls: Vec<String>,
    /// Resume point in seconds, per §4.6's public contract. Segments ending
    /// at or before this point are skipped entirely on the first pass; a
    /// segment straddling it has its start clamped forward. Ignored on
    /// subsequent loop passes.
    pub start_position: Option<f64>,
}

struct ActiveHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    position: Arc<Mutex<PlaybackPosition>>,
    destination_ids: Vec<i64>,
}

pub struct TimelineExecutor {
    supervisor: Arc<Supervisor>,
    relay_pool: Arc<RelayPool>,
    ptz: Arc<PtzController>,
    overlay: Arc<OverlayPrefetcher>,
    watchdog: Arc<WatchdogManager>,
    hardware: HardwareCapabilities,
    timeouts: TimeoutsConfig,
    active: Mutex<HashMap<i64, ActiveHandle>>,
}

impl TimelineExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        supervisor: Arc<Supervisor>,
        relay_pool: Arc<RelayPool>,
        ptz: Arc<PtzController>,
        overlay: Arc<OverlayPrefetcher>,
        watchdog: Arc<WatchdogManager>,
        hardware: HardwareCapabilities,
        timeouts: TimeoutsConfig,
    ) -> Self {
        Self { supervisor, relay_pool, ptz, overlay, watchdog, hardware, timeouts, active: Mutex::new(HashMap::new()) }
    }

    /// Starts driving `request.timeline`. Fails only if the timeline is
    /// already active or has no segments to play (§4.6 `InvalidTimeline`).
    pub async fn start_timeline(self: &Arc<Self>, request: StartTimelineRequest) -> Result<()> {
        let timeline_id = request.timeline.id;
        {
            let active = self.active.lock();
            if active.contains_key(&timeline_id) {
                return Err(EngineError::StreamAlreadyRunning { stream_id: timeline_id });
            }
        }
        if compute_segments(&request.timeline).is_empty() {
            return Err(EngineError::InvalidTimeline { id: timeline_id, reason: "timeline has no playable segments".into() });
        }

        let position = Arc::new(Mutex::new(PlaybackPosition {
            timeline_id,
            current_time: 0.0,
            current_cue_id: None,
            current_cue_index: None,
            loop_count: 0,
            total_cues: request.timeline.enabled_tracks().map(|t| t.cues.len()).sum(),
            updated_at: Utc::now(),
        }));

        let destination_ids = request.destinations.iter().map(|d| d.id).collect();
        let (stop_tx, stop_rx) = oneshot::channel();

        let supervisor = self.supervisor.clone();
        let relay_pool = self.relay_pool.clone();
        let ptz = self.ptz.clone();
        let overlay = self.overlay.clone();
        let watchdog = self.watchdog.clone();
        let timeouts = self.timeouts.clone();
        let task_position = position.clone();
        let executor = self.clone();

        let task = tokio::spawn(async move {
            run_timeline(Driver { supervisor, relay_pool, ptz, overlay, watchdog, timeouts }, request, task_position, stop_rx).await;
            // Natural end-of-timeline (ran out of segments, non-looping): reap
            // the entry ourselves, since nothing else will. A `stop_timeline`
            // call races us harmlessly — it already removed the entry before
            // this point, so `reap` below finds nothing and is a no-op.
            executor.reap(timeline_id).await;
        });

        self.active.lock().insert(
            timeline_id,
            ActiveHandle { stop_tx: Some(stop_tx), task, position, destination_ids },
        );
        Ok(())
    }

    /// Stops a running timeline. Idempotent: stopping an unknown or
    /// already-stopped timeline id is a no-op.
    pub async fn stop_timeline(&self, timeline_id: i64) {
        let entry = self.active.lock().remove(&timeline_id);
        let Some(mut entry) = entry else { return };
        if let Some(tx) = entry.stop_tx.take() {
            let _ = tx.send(());
        }
        let _ = entry.task.await;
        self.supervisor.stop(timeline_id, true).await;
        self.watchdog.notify_stream_stopped(timeline_id).await;
    }

    /// Removes `timeline_id` from the active map if still present and
    /// notifies the watchdog. Called both by the driver task itself on
    /// natural completion and, harmlessly redundantly, skipped entirely when
    /// `stop_timeline` already reaped the entry first.
    async fn reap(&self, timeline_id: i64) {
        let entry = self.active.lock().remove(&timeline_id);
        if entry.is_some() {
            self.watchdog.notify_stream_stopped(timeline_id).await;
        }
    }

    pub fn playback_position(&self, timeline_id: i64) -> Option<PlaybackPosition> {
        self.active.lock().get(&timeline_id).map(|e| e.position.lock().clone())
    }

    pub fn is_active(&self, timeline_id: i64) -> bool {
        self.active.lock().contains_key(&timeline_id)
    }

    pub fn active_timeline_ids(&self) -> Vec<i64> {
        self.active.lock().keys().copied().collect()
    }

    pub fn destination_ids(&self, timeline_id: i64) -> Vec<i64> {
        self.active.lock().get(&timeline_id).map(|e| e.destination_ids.clone()).unwrap_or_default()
    }

    pub fn hardware(&self) -> &HardwareCapabilities {
        &self.hardware
    }
}

struct Driver {
    supervisor: Arc<Supervisor>,
    relay_pool: Arc<RelayPool>,
    ptz: Arc<PtzController>,
    overlay: Arc<OverlayPrefetcher>,
    watchdog: Arc<WatchdogManager>,
    timeouts: TimeoutsConfig,
}

/// Conservative flat bitrate matching the transcoder's own default, §4.2.
fn encoding_profile_for(timeline: &Timeline) -> EncodingProfile {
    EncodingProfile { bitrate_kbps: 4500, width: timeline.width, height: timeline.height, fps: timeline.fps }
}

async fn run_timeline(
    driver: Driver,
    request: StartTimelineRequest,
    position: Arc<Mutex<PlaybackPosition>>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let timeline_id = request.timeline.id;
    let timeline = request.timeline;
    let profile = encoding_profile_for(&timeline);

    let prefetch = match driver.overlay.prefetch(&timeline, &request.assets).await {
        Ok(p) => p,
        Err(e) => {
            error!(timeline_id, error = %e, "overlay prefetch failed, continuing without overlays");
            crate::overlay::PrefetchResult { overlays: Vec::new(), temp_files: Vec::new() }
        }
    };

    let mut last_camera_id: Option<i64> = None;
    let mut last_preset_id: Option<i64> = None;
    let mut loop_count: u32 = 0;
    let total_cues = timeline.enabled_tracks().map(|t| t.cues.len()).sum();
    let mut died_rx: Option<oneshot::Receiver<(i64, String)>> = None;
    // Resume point, only honored on the timeline's very first pass per §4.6.
    let mut start_position = request.start_position;

    'loops: loop {
        let segments = compute_segments(&timeline);

        for (index, segment) in segments.iter().enumerate() {
            // A died callback firing here means the transcoder crashed
            // between segments; treat it the same as "not running" so the
            // next segment restarts it rather than assuming it's healthy.
            if let Some(rx) = died_rx.as_mut() {
                if let Ok((_, reason)) = rx.try_recv() {
                    warn!(timeline_id, %reason, "transcoder died between segments");
                    died_rx = None;
                }
            }

            let segment = if let Some(resume_at) = start_position {
                if segment.end <= resume_at {
                    continue;
                }
                if segment.start < resume_at {
                    start_position = None;
                    Segment { start: resume_at, end: segment.end }
                } else {
                    start_position = None;
                    *segment
                }
            } else {
                *segment
            };
            let segment = &segment;

            match active_video_cue(&timeline, segment.start) {
                None => {
                    let running = driver.supervisor.stream_state(timeline_id).map(|s| s.status == StreamStatus::Running).unwrap_or(false);
                    if !running {
                        // Nothing to show and nothing playing: skip the gap instantly.
                        continue;
                    }
                }
                Some((camera_id, preset_id)) => {
                    match execute_segment(
                        &driver,
                        timeline_id,
                        camera_id,
                        preset_id,
                        &request.cameras,
                        &request.presets,
                        &request.destinations,
                        &request.output_urls,
                        &profile,
                        &prefetch.overlays,
                        segment,
                        timeline.duration,
                        timeline.loop_playback,
                        last_camera_id,
                        last_preset_id,
                        &mut died_rx,
                    )
                    .await
                    {
                        Ok(()) => {
                            last_camera_id = Some(camera_id);
                            last_preset_id = preset_id;
                        }
                        Err(e) => {
                            // Never let one bad segment kill the timeline; log
                            // and keep walking, still tracking camera/preset so
                            // the next segment doesn't think the camera changed.
                            error!(timeline_id, camera_id, error = %e, "segment execution failed, continuing");
                            last_camera_id = Some(camera_id);
                            last_preset_id = preset_id;
                        }
                    }
                }
            }

            driver.supervisor.set_destination_ids(timeline_id, request.destinations.iter().map(|d| d.id).collect());

            let outcome = position::run_segment(
                &position,
                timeline_id,
                *segment,
                None,
                Some(index),
                loop_count,
                total_cues,
                &mut stop_rx,
            )
            .await;
            if matches!(outcome, position::SegmentOutcome::Cancelled) {
                break 'loops;
            }
        }

        loop_count += 1;
        if !timeline.loop_playback {
            break;
        }
    }

    if let Some(rx) = died_rx.take() {
        drop(rx);
    }
    driver.supervisor.stop(timeline_id, true).await;
    for path in &prefetch.temp_files {
        let _ = std::fs::remove_file(path);
    }
    info!(timeline_id, "timeline stopped");
}

/// Executes one segment: moves PTZ if the preset changed, restarts or
/// hands off the transcoder if the active camera changed or it isn't
/// running, then returns once the segment's steady state is reached (the
/// caller is responsible for sleeping out the segment's duration).
#[allow(clippy::too_many_arguments)]
async fn execute_segment(
    driver: &Driver,
    timeline_id: i64,
    camera_id: i64,
    preset_id: Option<i64>,
    cameras: &[Camera],
    presets: &[Preset],
    destinations: &[Destination],
    output_urls: &[String],
    profile: &EncodingProfile,
    overlays: &[TimedOverlay],
    segment: &Segment,
    timeline_duration: f64,
    loop_flag: bool,
    last_camera_id: Option<i64>,
    last_preset_id: Option<i64>,
    died_rx: &mut Option<oneshot::Receiver<(i64, String)>>,
) -> Result<()> {
    let Some(camera) = cameras.iter().find(|c| c.id == camera_id) else {
        return Err(EngineError::InvalidTimeline { id: timeline_id, reason: format!("unknown camera {camera_id}") });
    };

    let same_camera = last_camera_id == Some(camera_id);
    let preset_changed = last_preset_id != preset_id;
    let stream_running = driver
        .supervisor
        .stream_state(timeline_id)
        .map(|s| s.status == StreamStatus::Running)
        .unwrap_or(false);
    let needs_restart = !same_camera || !stream_running;

    if let Some(preset_id) = preset_id {
        if preset_changed {
            if let Some(preset) = presets.iter().find(|p| p.id == preset_id) {
                if same_camera && stream_running {
                    info!(timeline_id, camera_id, preset_id, "moving PTZ while live, viewers will see the motion");
                } else {
                    info!(timeline_id, camera_id, preset_id, "moving PTZ before switching to camera");
                }
                driver.ptz.move_to_preset(camera, preset).await;
            }
        }
    }

    if !needs_restart {
        return Ok(());
    }

    driver.relay_pool.start(camera_id, camera.rtsp_url()).await;
    let input_url = driver.relay_pool.local_url(camera_id).unwrap_or_else(|| camera.rtsp_url());

    let segment_overlays: Vec<TimedOverlay> = overlays
        .iter()
        .filter(|o| o.start_s < segment.end && o.end_s > segment.start)
        .cloned()
        .collect();

    let start_params = StartParams {
        stream_id: timeline_id,
        input_url,
        output_urls: output_urls.to_vec(),
        profile: profile.clone(),
        timed_overlays: segment_overlays,
        timeline_duration,
        loop_flag,
    };

    let result = if stream_running {
        handoff(driver, timeline_id, start_params, died_rx).await
    } else {
        cold_start(driver, timeline_id, start_params, died_rx).await
    };
    if result.is_ok() {
        // §4.6: every (re)start of the transcoder backing this timeline is
        // announced to the watchdog so it arms/keeps a monitor per destination.
        driver.watchdog.notify_stream_started(destinations, timeline_id);
    }
    result
}

async fn cold_start(
    driver: &Driver,
    timeline_id: i64,
    start_params: StartParams,
    died_rx: &mut Option<oneshot::Receiver<(i64, String)>>,
) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(driver.timeouts.fallback_start), driver.supervisor.start(start_params))
        .await
        .map_err(|_| EngineError::HandoffFailed { stream_id: timeline_id, reason: "start timed out".into() })??;
    *died_rx = driver.supervisor.register_died_callback(timeline_id).ok();
    Ok(())
}

/// Starts a replacement transcoder under a temporary id, stops the old one,
/// then re-keys the replacement onto the real id — so the output never sees
/// a gap wider than the camera's own connection time. Falls back to a plain
/// stop-then-start if any step of the handoff fails or times out, per §4.6.
async fn handoff(
    driver: &Driver,
    timeline_id: i64,
    start_params: StartParams,
    died_rx: &mut Option<oneshot::Receiver<(i64, String)>>,
) -> Result<()> {
    let temp_stream_id = timeline_id + HANDOFF_STREAM_ID_OFFSET;
    let mut temp_params = start_params.clone();
    temp_params.stream_id = temp_stream_id;

    let handoff_result = tokio::time::timeout(
        Duration::from_secs(driver.timeouts.handoff_start),
        driver.supervisor.start(temp_params),
    )
    .await;

    match handoff_result {
        Ok(Ok(_)) => {
            let _ = tokio::time::timeout(Duration::from_secs(driver.timeouts.handoff_old_stop), driver.supervisor.stop(timeline_id, true)).await;
            match driver.supervisor.rekey(temp_stream_id, timeline_id) {
                Ok(()) => {
                    *died_rx = driver.supervisor.register_died_callback(timeline_id).ok();
                    Ok(())
                }
                Err(e) => {
                    warn!(timeline_id, error = %e, "handoff rekey failed, tearing down temp stream");
                    driver.supervisor.stop(temp_stream_id, true).await;
                    Err(e)
                }
            }
        }
        _ => {
            warn!(timeline_id, "seamless handoff failed, falling back to stop-then-start");
            driver.supervisor.stop(temp_stream_id, true).await;
            driver.supervisor.stop(timeline_id, true).await;
            cold_start(driver, timeline_id, start_params, died_rx).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handoff_stream_id_never_collides_with_small_timeline_ids() {
        assert!(1 + HANDOFF_STREAM_ID_OFFSET != 1);
        assert!(999_999 + HANDOFF_STREAM_ID_OFFSET > 999_999);
    }
}
