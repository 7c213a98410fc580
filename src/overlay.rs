//! Overlay Prefetcher (C5). Before a timeline starts, resolves every overlay
//! cue's asset to a local image file and a pixel position so the Transcoder
//! Command Builder can bake it into a `filter_complex` graph without doing
//! any I/O mid-stream. Grounded in
//! `original_source/backend/services/timeline_executor.py`'s
//! `_prefetch_all_overlays`/`_download_asset_image`.

use std::path::PathBuf;
use std::time::Duration;

use reqwest::Client;
use tempfile::Builder as TempFileBuilder;
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::model::{Asset, AssetKind, Cue, CueAction, Timeline};
use crate::transcoder::command::TimedOverlay;

const DEFAULT_OVERLAY_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves every overlay cue on every enabled overlay track of `timeline`
/// into a [`TimedOverlay`], fetching remote assets through `http`.
///
/// Assets this call downloads are written to files under the OS temp
/// directory; the returned `Vec<PathBuf>` lists them so the caller can clean
/// them up once the timeline stops (the prefetcher itself holds no state
/// between calls).
pub struct OverlayPrefetcher {
    http: Client,
}

pub struct PrefetchResult {
    pub overlays: Vec<TimedOverlay>,
    pub temp_files: Vec<PathBuf>,
}

impl OverlayPrefetcher {
    pub fn new() -> Self {
        Self::with_fetch_timeout(DEFAULT_OVERLAY_FETCH_TIMEOUT)
    }

    pub fn with_fetch_timeout(timeout: Duration) -> Self {
        Self {
            http: Client::builder().timeout(timeout).build().unwrap_or_default(),
        }
    }

    pub async fn prefetch(&self, timeline: &Timeline, assets: &[Asset]) -> Result<PrefetchResult> {
        let mut overlays = Vec::new();
        let mut temp_files = Vec::new();

        for track in timeline.enabled_tracks() {
            for cue in &track.cues {
                let CueAction::ShowOverlay { asset_id } = &cue.action else { continue };
                let Some(asset) = assets.iter().find(|a| a.id == *asset_id) else {
                    warn!(asset_id, "overlay cue references unknown asset, skipping");
                    continue;
                };
                match self.resolve_asset(asset).await {
                    Ok((path, temp_file)) => {
                        overlays.push(to_timed_overlay(cue, asset, path, timeline));
                        if let Some(tmp) = temp_file {
                            temp_files.push(tmp);
                        }
                    }
                    Err(e) => {
                        warn!(asset_id, error = %e, "failed to prefetch overlay asset, skipping cue");
                    }
                }
            }
        }

        Ok(PrefetchResult { overlays, temp_files })
    }

    /// Resolves one asset to a local path. Returns the temp file path too
    /// (if one was created) so the caller can delete it later.
    async fn resolve_asset(&self, asset: &Asset) -> Result<(PathBuf, Option<PathBuf>)> {
        match asset.kind {
            AssetKind::LocalFile => Ok((PathBuf::from(&asset.source), None)),
            AssetKind::RemoteImage | AssetKind::RemoteDrawing => {
                let path = self.download_to_temp_file(&asset.source, asset.id).await?;
                Ok((path.clone(), Some(path)))
            }
        }
    }

    async fn download_to_temp_file(&self, url: &str, asset_id: i64) -> Result<PathBuf> {
        let resp = self.http.get(url).send().await.map_err(EngineError::from)?.error_for_status().map_err(EngineError::from)?;
        let bytes = resp.bytes().await.map_err(EngineError::from)?;

        let tmp = TempFileBuilder::new()
            .prefix(&format!("vistterstream-overlay-{asset_id}-"))
            .suffix(".png")
            .tempfile()
            .map_err(EngineError::from)?;
        let (file, path) = tmp.keep().map_err(|e| EngineError::Io(e.error))?;
        use std::io::Write;
        let mut file = file;
        file.write_all(&bytes).map_err(EngineError::from)?;
        info!(asset_id, %url, bytes = bytes.len(), "prefetched overlay asset");
        Ok(path)
    }
}

impl Default for OverlayPrefetcher {
    fn default() -> Self {
        Self::new()
    }
}

fn to_timed_overlay(cue: &Cue, asset: &Asset, path: PathBuf, timeline: &Timeline) -> TimedOverlay {
    TimedOverlay {
        path,
        x_px: (asset.position_x * timeline.width as f64).round() as i64,
        y_px: (asset.position_y * timeline.height as f64).round() as i64,
        opacity: asset.opacity,
        start_s: cue.start_time,
        end_s: cue.end_time(),
        width: asset.width,
        height: asset.height,
        asset_id: asset.id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CueAction, Track, TrackKind};

    fn asset() -> Asset {
        Asset {
            id: 1,
            kind: AssetKind::LocalFile,
            source: "/tmp/logo.png".into(),
            position_x: 0.5,
            position_y: 0.25,
            width: Some(200),
            height: Some(100),
            opacity: 0.8,
        }
    }

    fn timeline_with(track: Track) -> Timeline {
        Timeline { id: 1, duration: 60.0, fps: 30, width: 1920, height: 1080, loop_playback: false, tracks: vec![track] }
    }

    #[test]
    fn pixel_position_scales_by_target_resolution() {
        let cue = Cue { order: 0, start_time: 5.0, duration: 10.0, action: CueAction::ShowOverlay { asset_id: 1 } };
        let timeline = timeline_with(Track { kind: TrackKind::Overlay, layer: 0, enabled: true, cues: vec![cue.clone()] });
        let overlay = to_timed_overlay(&cue, &asset(), PathBuf::from("/tmp/logo.png"), &timeline);
        assert_eq!(overlay.x_px, 960);
        assert_eq!(overlay.y_px, 270);
        assert_eq!(overlay.start_s, 5.0);
        assert_eq!(overlay.end_s, 15.0);
    }

    #[tokio::test]
    async fn local_file_asset_resolves_without_network() {
        let prefetcher = OverlayPrefetcher::new();
        let (path, temp_file) = prefetcher.resolve_asset(&asset()).await.unwrap();
        assert_eq!(path, PathBuf::from("/tmp/logo.png"));
        assert!(temp_file.is_none());
    }

    #[tokio::test]
    async fn unknown_asset_reference_is_skipped_not_fatal() {
        let cue = Cue { order: 0, start_time: 0.0, duration: 5.0, action: CueAction::ShowOverlay { asset_id: 404 } };
        let timeline = timeline_with(Track { kind: TrackKind::Overlay, layer: 0, enabled: true, cues: vec![cue] });
        let prefetcher = OverlayPrefetcher::new();
        let result = prefetcher.prefetch(&timeline, &[]).await.unwrap();
        assert!(result.overlays.is_empty());
        assert!(result.temp_files.is_empty());
    }
}
