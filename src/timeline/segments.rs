//! Segmentation: turns a timeline's cues into the ordered, non-overlapping
//! intervals the driver loop steps through. Grounded in
//! `original_source/backend/services/timeline_executor.py`'s
//! `_compute_segments`.

use crate::model::{CueAction, Timeline};

/// A `[start, end)` interval with no cue boundary inside it, so the camera
/// (and overlay set) showing is constant across the whole segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
}

impl Segment {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Unions every enabled track's cue boundaries (video and overlay alike, since
/// an overlay appearing or disappearing changes what the current segment must
/// render) with the timeline's own `[0, duration]` bounds, then splits on the
/// sorted, deduplicated result.
pub fn compute_segments(timeline: &Timeline) -> Vec<Segment> {
    let mut boundaries = vec![0.0_f64, timeline.duration];
    for track in timeline.enabled_tracks() {
        for cue in &track.cues {
            boundaries.push(cue.start_time);
            boundaries.push(cue.end_time());
        }
    }

    boundaries.retain(|b| *b >= 0.0 && *b <= timeline.duration);
    boundaries.sort_by(|a, b| a.partial_cmp(b).unwrap());
    boundaries.dedup_by(|a, b| (*a - *b).abs() < 1e-9);

    boundaries
        .windows(2)
        .map(|w| Segment { start: w[0], end: w[1] })
        .filter(|s| s.duration() > 1e-9)
        .collect()
}

/// The camera/preset a video cue active at `at` names, if any. Scans enabled
/// video tracks in ascending layer order; the first cue whose interval covers
/// `at` wins.
pub fn active_video_cue(timeline: &Timeline, at: f64) -> Option<(i64, Option<i64>)> {
    let mut video_tracks: Vec<_> = timeline
        .enabled_tracks()
        .filter(|t| t.kind == crate::model::TrackKind::Video)
        .collect();
    video_tracks.sort_by_key(|t| t.layer);

    for track in video_tracks {
        for cue in &track.cues {
            if at >= cue.start_time && at < cue.end_time() {
                if let CueAction::ShowCamera { camera_id, preset_id } = &cue.action {
                    return Some((*camera_id, *preset_id));
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Cue, CueAction, Track, TrackKind};

    fn cue(order: u32, start: f64, dur: f64, camera_id: i64) -> Cue {
        Cue { order, start_time: start, duration: dur, action: CueAction::ShowCamera { camera_id, preset_id: None } }
    }

    fn overlay_cue(order: u32, start: f64, dur: f64, asset_id: i64) -> Cue {
        Cue { order, start_time: start, duration: dur, action: CueAction::ShowOverlay { asset_id } }
    }

    #[test]
    fn boundary_union_splits_on_overlay_edges_too() {
        let timeline = Timeline {
            id: 1,
            duration: 30.0,
            fps: 30,
            width: 1920,
            height: 1080,
            loop_playback: false,
            tracks: vec![
                Track { kind: TrackKind::Video, layer: 0, enabled: true, cues: vec![cue(0, 0.0, 30.0, 1)] },
                Track { kind: TrackKind::Overlay, layer: 1, enabled: true, cues: vec![overlay_cue(0, 10.0, 5.0, 9)] },
            ],
        };
        let segments = compute_segments(&timeline);
        assert_eq!(segments, vec![
            Segment { start: 0.0, end: 10.0 },
            Segment { start: 10.0, end: 15.0 },
            Segment { start: 15.0, end: 30.0 },
        ]);
    }

    #[test]
    fn disabled_tracks_do_not_contribute_boundaries() {
        let timeline = Timeline {
            id: 1,
            duration: 20.0,
            fps: 30,
            width: 1920,
            height: 1080,
            loop_playback: false,
            tracks: vec![
                Track { kind: TrackKind::Video, layer: 0, enabled: true, cues: vec![cue(0, 0.0, 20.0, 1)] },
                Track { kind: TrackKind::Overlay, layer: 1, enabled: false, cues: vec![overlay_cue(0, 5.0, 2.0, 9)] },
            ],
        };
        let segments = compute_segments(&timeline);
        assert_eq!(segments, vec![Segment { start: 0.0, end: 20.0 }]);
    }

    #[test]
    fn gap_with_no_video_cue_is_its_own_segment() {
        let timeline = Timeline {
            id: 1,
            duration: 20.0,
            fps: 30,
            width: 1920,
            height: 1080,
            loop_playback: false,
            tracks: vec![Track {
                kind: TrackKind::Video,
                layer: 0,
                enabled: true,
                cues: vec![cue(0, 0.0, 5.0, 1), cue(1, 10.0, 5.0, 2)],
            }],
        };
        let segments = compute_segments(&timeline);
        assert_eq!(segments.len(), 3);
        assert!(active_video_cue(&timeline, 7.0).is_none());
        assert_eq!(active_video_cue(&timeline, 2.0), Some((1, None)));
        assert_eq!(active_video_cue(&timeline, 12.0), Some((2, None)));
    }
}
