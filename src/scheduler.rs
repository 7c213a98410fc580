//! Scheduler (C9): ticks periodically, checking which (if any) enabled
//! schedule's day-of-week and time window currently match, and switches the
//! active timeline accordingly. Grounded in
//! `original_source/backend/services/scheduler_service.py`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::model::{Asset, Camera, Destination, Preset, Timeline};
use crate::timeline::{StartTimelineRequest, TimelineExecutor};

/// One row of the schedule table. Days are ISO weekday numbers, 1 (Monday)
/// through 7 (Sunday), matching `chrono::Weekday::number_from_monday`, and
/// are evaluated against `timezone` (an IANA zone name, e.g.
/// `"America/New_York"`), not UTC, per §4.9/§6.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub id: i64,
    pub enabled: bool,
    pub timezone: Tz,
    pub days_of_week: Vec<u8>,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub timeline: Timeline,
    pub cameras: Vec<Camera>,
    pub presets: Vec<Preset>,
    pub assets: Vec<Asset>,
    pub destinations: Vec<Destination>,
}

/// Returns whether `now` falls inside `[start, end)`, handling windows that
/// cross midnight (`start > end`) as wrapping around the day boundary.
fn is_in_window(now: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    if start <= end {
        now >= start && now < end
    } else {
        now >= start || now < end
    }
}

fn matches_today(schedule: &Schedule, weekday: Weekday) -> bool {
    schedule.enabled && schedule.days_of_week.contains(&(weekday.number_from_monday() as u8))
}

struct SchedulerState {
    active_schedule_id: Option<i64>,
}

pub struct Scheduler {
    executor: Arc<TimelineExecutor>,
    tick_interval: Duration,
    schedules: Mutex<Vec<Schedule>>,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    pub fn new(executor: Arc<TimelineExecutor>, tick_interval: Duration) -> Self {
        Self {
            executor,
            tick_interval,
            schedules: Mutex::new(Vec::new()),
            state: Mutex::new(SchedulerState { active_schedule_id: None }),
        }
    }

    pub fn list_schedules(&self) -> Vec<Schedule> {
        self.schedules.lock().clone()
    }

    pub fn create_schedule(&self, schedule: Schedule) {
        self.schedules.lock().push(schedule);
    }

    pub fn delete_schedule(&self, schedule_id: i64) {
        self.schedules.lock().retain(|s| s.id != schedule_id);
    }

    pub fn active_schedule_id(&self) -> Option<i64> {
        self.state.lock().active_schedule_id
    }

    /// Spawns the 30s (by default) tick loop. The returned handle must be
    /// kept and later passed to [`Scheduler::stop`] to shut the loop down.
    pub fn spawn(self: &Arc<Self>) -> SchedulerHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let scheduler = self.clone();
        let task = tokio::spawn(async move {
            loop {
                scheduler.tick().await;
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = tokio::time::sleep(scheduler.tick_interval) => {}
                }
            }
        });
        SchedulerHandle { stop_tx: Some(stop_tx), task }
    }

    async fn tick(&self) {
        let now = Utc::now();

        let matching = {
            let schedules = self.schedules.lock();
            schedules
                .iter()
                .find(|s| {
                    let local = now.with_timezone(&s.timezone);
                    matches_today(s, local.weekday()) && is_in_window(local.time(), s.start_time, s.end_time)
                })
                .cloned()
        };

        match matching {
            Some(schedule) => {
                if self.state.lock().active_schedule_id == Some(schedule.id) {
                    return;
                }
                self.switch_to(schedule).await;
            }
            None => {
                self.stop_active().await;
            }
        }
    }

    async fn switch_to(&self, schedule: Schedule) {
        self.stop_active().await;

        let output_urls = schedule.destinations.iter().map(|d| d.full_rtmp_url()).collect();
        let timeline_id = schedule.timeline.id;
        let schedule_id = schedule.id;
        let result = self
            .executor
            .start_timeline(StartTimelineRequest {
                timeline: schedule.timeline,
                cameras: schedule.cameras,
                presets: schedule.presets,
                assets: schedule.assets,
                destinations: schedule.destinations,
                output_urls,
                start_position: None,
            })
            .await;

        match result {
            Ok(()) => {
                info!(schedule_id, timeline_id, "scheduler switched active timeline");
                self.state.lock().active_schedule_id = Some(schedule_id);
            }
            Err(e) => {
                warn!(schedule_id, timeline_id, error = %e, "scheduler failed to start timeline");
            }
        }
    }

    async fn stop_active(&self) {
        if self.state.lock().active_schedule_id.take().is_none() {
            return;
        }
        for timeline_id in self.executor.active_timeline_ids() {
            self.executor.stop_timeline(timeline_id).await;
        }
    }
}

pub struct SchedulerHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn same_day_window_matches_only_inside_range() {
        assert!(is_in_window(t(9, 30), t(9, 0), t(17, 0)));
        assert!(!is_in_window(t(8, 0), t(9, 0), t(17, 0)));
        assert!(!is_in_window(t(17, 0), t(9, 0), t(17, 0)));
    }

    #[test]
    fn overnight_window_wraps_past_midnight() {
        assert!(is_in_window(t(23, 30), t(22, 0), t(6, 0)));
        assert!(is_in_window(t(2, 0), t(22, 0), t(6, 0)));
        assert!(!is_in_window(t(12, 0), t(22, 0), t(6, 0)));
    }

    #[test]
    fn schedule_timezone_shifts_weekday_and_time_off_utc() {
        use chrono::TimeZone;
        // Thursday 02:30 UTC is still Wednesday evening in New York.
        let instant = Utc.with_ymd_and_hms(2026, 7, 30, 2, 30, 0).unwrap();
        let ny: Tz = "America/New_York".parse().unwrap();
        let local = instant.with_timezone(&ny);
        assert_eq!(local.weekday(), Weekday::Wed);
        assert_eq!(local.time(), t(22, 30));
    }
}
