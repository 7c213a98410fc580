//! Playback position updates at 2 Hz while a segment plays out, and doubles
//! as the segment's sleep — cancellable the instant a stop is requested
//! instead of only checking between segments. Grounded in
//! `original_source/backend/services/timeline_executor.py`'s
//! `_update_playback_position` task plus the `asyncio.sleep(duration)` each
//! segment ends on.

use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::model::PlaybackPosition;

use super::segments::Segment;

const TICK: Duration = Duration::from_millis(500);

pub enum SegmentOutcome {
    Completed,
    Cancelled,
}

/// Updates `position` every 500ms until `segment`'s duration has elapsed or
/// `stop_rx` fires.
#[allow(clippy::too_many_arguments)]
pub async fn run_segment(
    position: &Mutex<PlaybackPosition>,
    timeline_id: i64,
    segment: Segment,
    current_cue_id: Option<u32>,
    current_cue_index: Option<usize>,
    loop_count: u32,
    total_cues: usize,
    stop_rx: &mut oneshot::Receiver<()>,
) -> SegmentOutcome {
    let started = Instant::now();
    let mut interval = tokio::time::interval(TICK);

    loop {
        let elapsed = started.elapsed().as_secs_f64();
        {
            let mut p = position.lock();
            p.timeline_id = timeline_id;
            p.current_time = segment.start + elapsed.min(segment.duration());
            p.current_cue_id = current_cue_id;
            p.current_cue_index = current_cue_index;
            p.loop_count = loop_count;
            p.total_cues = total_cues;
            p.updated_at = Utc::now();
        }

        if elapsed >= segment.duration() {
            return SegmentOutcome::Completed;
        }

        tokio::select! {
            biased;
            _ = &mut *stop_rx => return SegmentOutcome::Cancelled,
            _ = interval.tick() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(timeline_id: i64) -> PlaybackPosition {
        PlaybackPosition {
            timeline_id,
            current_time: 0.0,
            current_cue_id: None,
            current_cue_index: None,
            loop_count: 0,
            total_cues: 0,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn completes_after_segment_duration_elapses() {
        let pos = Mutex::new(position(1));
        let (_tx, mut rx) = oneshot::channel();
        let segment = Segment { start: 0.0, end: 0.05 };
        let outcome = run_segment(&pos, 1, segment, Some(3), Some(0), 2, 5, &mut rx).await;
        assert!(matches!(outcome, SegmentOutcome::Completed));
        assert_eq!(pos.lock().current_cue_id, Some(3));
        assert_eq!(pos.lock().loop_count, 2);
    }

    #[tokio::test]
    async fn cancels_immediately_on_stop_signal() {
        let pos = Mutex::new(position(1));
        let (tx, mut rx) = oneshot::channel();
        tx.send(()).unwrap();
        let segment = Segment { start: 0.0, end: 600.0 };
        let outcome = run_segment(&pos, 1, segment, None, None, 0, 1, &mut rx).await;
        assert!(matches!(outcome, SegmentOutcome::Cancelled));
    }
}
