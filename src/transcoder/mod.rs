//! Transcoder Process Supervisor (C2). Manages at most one subprocess per
//! `stream_id`: spawning, progress monitoring, graceful/forced shutdown, and
//! bounded exponential restart. Grounded in
//! `original_source/backend/services/ffmpeg_manager.py`.

pub mod command;
mod monitor;

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub use command::{EncodingProfile, StartParams, TimedOverlay};

use crate::config::TimeoutsConfig;
use crate::error::{EngineError, Result};
use crate::hardware::HardwareCapabilities;
use crate::model::{StreamState, StreamStatus};

use monitor::{find_error_marker, parse_progress, TailBuffer, CHUNK_SIZE, TAIL_LINES};

enum ControlMsg {
    Stop { graceful: bool, ack: oneshot::Sender<()> },
    ForceRestart { ack: oneshot::Sender<()> },
    RegisterDied(oneshot::Sender<(i64, String)>),
}

struct EntryHandle {
    control: mpsc::UnboundedSender<ControlMsg>,
    state: Arc<Mutex<StreamState>>,
    task: JoinHandle<()>,
}

/// Supervises one external transcoder process per `stream_id`.
pub struct Supervisor {
    transcoder_binary: String,
    hardware: HardwareCapabilities,
    timeouts: TimeoutsConfig,
    entries: Arc<Mutex<HashMap<i64, EntryHandle>>>,
}

impl Supervisor {
    pub fn new(transcoder_binary: String, hardware: HardwareCapabilities, timeouts: TimeoutsConfig) -> Self {
        Self { transcoder_binary, hardware, timeouts, entries: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Fails when `stream_id` is already running or the concurrent ceiling is
    /// reached. Spawns the child eagerly so configuration errors surface
    /// synchronously to the caller; the monitor task then takes ownership.
    pub async fn start(&self, params: StartParams) -> Result<StreamState> {
        {
            let entries = self.entries.lock();
            if entries.contains_key(&params.stream_id) {
                return Err(EngineError::StreamAlreadyRunning { stream_id: params.stream_id });
            }
            if entries.len() as u32 >= self.hardware.max_concurrent_streams {
                return Err(EngineError::ConcurrencyLimitReached { max: self.hardware.max_concurrent_streams });
            }
        }

        let child = spawn_child(&self.transcoder_binary, &self.hardware.encoder_tag, &params)?;

        let state = Arc::new(Mutex::new(StreamState {
            id: params.stream_id,
            status: StreamStatus::Running,
            started_at: Utc::now(),
            retry_count: 0,
            last_error: None,
            output_urls: params.output_urls.clone(),
            destination_ids: Vec::new(),
            last_segment_completed_at: Utc::now(),
        }));

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let stream_id = params.stream_id;
        let task_state = state.clone();
        let transcoder_binary = self.transcoder_binary.clone();
        let encoder_tag = self.hardware.encoder_tag.clone();
        let timeouts = self.timeouts.clone();

        let task = tokio::spawn(async move {
            run_stream(stream_id, child, params, transcoder_binary, encoder_tag, timeouts, control_rx, task_state).await;
        });

        self.entries.lock().insert(stream_id, EntryHandle { control: control_tx, state: state.clone(), task });
        Ok(state.lock().clone())
    }

    /// Disables auto-restart, sends polite-terminate, waits up to
    /// `graceful_stop` seconds, then force-kills. Idempotent: stopping an
    /// unknown stream id is a no-op.
    pub async fn stop(&self, stream_id: i64, graceful: bool) {
        let entry = self.entries.lock().remove(&stream_id);
        let Some(entry) = entry else { return };

        let (ack_tx, ack_rx) = oneshot::channel();
        if entry.control.send(ControlMsg::Stop { graceful, ack: ack_tx }).is_ok() {
            let _ = tokio::time::timeout(Duration::from_secs(self.timeouts.graceful_stop + 2), ack_rx).await;
        }
        let _ = entry.task.await;
    }

    /// Forces an immediate restart of a running stream (used by tier-1/2
    /// watchdog recovery). Counts toward the same 10-attempt ceiling as
    /// organic restarts.
    pub async fn restart(&self, stream_id: i64) -> Result<()> {
        let control = {
            let entries = self.entries.lock();
            entries
                .get(&stream_id)
                .map(|e| e.control.clone())
                .ok_or(EngineError::StreamNotFound { stream_id })?
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        control
            .send(ControlMsg::ForceRestart { ack: ack_tx })
            .map_err(|_| EngineError::StreamNotFound { stream_id })?;
        let _ = ack_rx.await;
        Ok(())
    }

    /// One callback per stream id may be registered; it fires exactly once,
    /// the next time the monitor observes process exit.
    pub fn register_died_callback(&self, stream_id: i64) -> Result<oneshot::Receiver<(i64, String)>> {
        let control = {
            let entries = self.entries.lock();
            entries
                .get(&stream_id)
                .map(|e| e.control.clone())
                .ok_or(EngineError::StreamNotFound { stream_id })?
        };
        let (tx, rx) = oneshot::channel();
        control
            .send(ControlMsg::RegisterDied(tx))
            .map_err(|_| EngineError::StreamNotFound { stream_id })?;
        Ok(rx)
    }

    pub fn stream_state(&self, stream_id: i64) -> Option<StreamState> {
        self.entries.lock().get(&stream_id).map(|e| e.state.lock().clone())
    }

    /// Records which destinations a stream's output URLs correspond to, for
    /// the status surface and the Health Watchdog's destination lookup. A
    /// no-op for an unknown stream id.
    pub fn set_destination_ids(&self, stream_id: i64, destination_ids: Vec<i64>) {
        if let Some(entry) = self.entries.lock().get(&stream_id) {
            entry.state.lock().destination_ids = destination_ids;
        }
    }

    pub fn running_count(&self) -> u32 {
        self.entries.lock().len() as u32
    }

    /// Re-keys a running entry from `from` to `to`, updating its `StreamState.id`
    /// to match. Used by the Timeline Executor's seamless handoff: a
    /// replacement transcoder is started under a temporary stream id, then
    /// re-keyed onto the real id once the old process has been torn down, so
    /// the caller never has two entries racing for the same id. Errors if
    /// `to` is already in use or `from` does not exist.
    pub fn rekey(&self, from: i64, to: i64) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&to) {
            return Err(EngineError::StreamAlreadyRunning { stream_id: to });
        }
        let entry = entries.remove(&from).ok_or(EngineError::StreamNotFound { stream_id: from })?;
        entry.state.lock().id = to;
        entries.insert(to, entry);
        Ok(())
    }

    /// Linear scan of running streams, per §4.2's public contract.
    pub fn find_stream_by_output_url(&self, url: &str) -> Option<i64> {
        self.entries
            .lock()
            .values()
            .find(|e| e.state.lock().output_urls.iter().any(|u| u == url))
            .map(|e| e.state.lock().id)
    }
}

fn spawn_child(transcoder_binary: &str, encoder_tag: &str, params: &StartParams) -> Result<Child> {
    let args = command::build_args(encoder_tag, params);
    Command::new(transcoder_binary)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|_| EngineError::TranscoderBinaryMissing(transcoder_binary.to_string()))
}

async fn terminate_child(child: &mut Child, graceful: bool, timeouts: &TimeoutsConfig) {
    if graceful {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            unsafe {
                libc_kill(pid as i32, 15); // SIGTERM; ProcessLookupError-equivalent is swallowed
            }
        }
        let waited = tokio::time::timeout(Duration::from_secs(timeouts.graceful_stop), child.wait()).await;
        if waited.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

#[cfg(unix)]
unsafe fn libc_kill(pid: i32, sig: i32) {
    extern "C" {
        fn kill(pid: i32, sig: i32) -> i32;
    }
    kill(pid, sig);
}

/// Owns the child process for its whole supervised lifetime: reads its
/// diagnostic stream, restarts it on unexpected exit (bounded exponential
/// backoff, §4.2/§7), and honors stop/force-restart/register-died control
/// messages.
#[allow(clippy::too_many_arguments)]
async fn run_stream(
    stream_id: i64,
    mut child: Child,
    params: StartParams,
    transcoder_binary: String,
    encoder_tag: String,
    timeouts: TimeoutsConfig,
    mut control_rx: mpsc::UnboundedReceiver<ControlMsg>,
    state: Arc<Mutex<StreamState>>,
) {
    let mut died_tx: Option<oneshot::Sender<(i64, String)>> = None;
    let mut retry_count: u32 = 0;

    'lifecycle: loop {
        let mut stderr = child.stderr.take().expect("stderr piped at spawn");
        let mut tail = TailBuffer::new(TAIL_LINES);

        enum Exit {
            Stopped,
            ForcedRestart,
            Died,
        }

        let exit = 'read: loop {
            let mut buf = [0u8; CHUNK_SIZE];
            tokio::select! {
                biased;
                msg = control_rx.recv() => {
                    match msg {
                        Some(ControlMsg::Stop { graceful, ack }) => {
                            terminate_child(&mut child, graceful, &timeouts).await;
                            let _ = ack.send(());
                            break 'read Exit::Stopped;
                        }
                        Some(ControlMsg::ForceRestart { ack }) => {
                            terminate_child(&mut child, true, &timeouts).await;
                            let _ = ack.send(());
                            break 'read Exit::ForcedRestart;
                        }
                        Some(ControlMsg::RegisterDied(tx)) => { died_tx = Some(tx); }
                        None => {}
                    }
                }
                read_result = tokio::time::timeout(Duration::from_secs(timeouts.transcoder_io_chunk), stderr.read(&mut buf)) => {
                    match read_result {
                        Ok(Ok(0)) => break 'read Exit::Died,
                        Ok(Ok(n)) => {
                            for line in tail.push_chunk(&buf[..n]) {
                                if let Some(metrics) = parse_progress(&line) {
                                    tracing::debug!(
                                        stream_id,
                                        fps = ?metrics.fps,
                                        bitrate_kbps = ?metrics.bitrate_kbps,
                                        dropped_frames = ?metrics.dropped_frames,
                                        speed = ?metrics.speed,
                                        "transcoder progress"
                                    );
                                }
                            }
                        }
                        Ok(Err(e)) => {
                            tracing::warn!(stream_id, error = %e, "error reading transcoder diagnostics");
                            break 'read Exit::Died;
                        }
                        Err(_) => {
                            match child.try_wait() {
                                Ok(Some(_)) => break 'read Exit::Died,
                                Ok(None) => continue,
                                Err(e) => tracing::warn!(stream_id, error = %e, "liveness check failed"),
                            }
                        }
                    }
                }
            }
        };

        // Drain any remaining diagnostic output before deciding.
        let mut drain = Vec::new();
        let _ = tokio::time::timeout(Duration::from_millis(200), stderr.read_to_end(&mut drain)).await;
        for line in tail.push_chunk(&drain) {
            let _ = parse_progress(&line);
        }

        match exit {
            Exit::Stopped => {
                state.lock().status = StreamStatus::Stopped;
                break 'lifecycle;
            }
            Exit::Died | Exit::ForcedRestart => {
                let _ = child.wait().await;
                let error_message = find_error_marker(&tail.tail_text())
                    .unwrap_or_else(|| "transcoder exited".to_string());

                {
                    let mut s = state.lock();
                    s.last_error = Some(error_message.clone());
                }
                if let Some(tx) = died_tx.take() {
                    let _ = tx.send((stream_id, error_message));
                }

                retry_count += 1;
                if retry_count > 10 {
                    let mut s = state.lock();
                    s.status = StreamStatus::Error;
                    s.retry_count = retry_count;
                    tracing::error!(stream_id, retry_count, "exceeded maximum restart attempts");
                    break 'lifecycle;
                }
                {
                    let mut s = state.lock();
                    s.status = StreamStatus::Restarting;
                    s.retry_count = retry_count;
                }

                let backoff = Duration::from_secs(2u64.saturating_pow(retry_count.min(6)).min(60));
                tokio::time::sleep(backoff).await;

                loop {
                    match spawn_child(&transcoder_binary, &encoder_tag, &params) {
                        Ok(c) => {
                            child = c;
                            state.lock().status = StreamStatus::Running;
                            break;
                        }
                        Err(e) => {
                            tracing::error!(stream_id, error = %e, "restart spawn failed");
                            retry_count += 1;
                            if retry_count > 10 {
                                state.lock().status = StreamStatus::Error;
                                break 'lifecycle;
                            }
                            let backoff = Duration::from_secs(2u64.saturating_pow(retry_count.min(6)).min(60));
                            tokio::time::sleep(backoff).await;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hardware(max: u32) -> HardwareCapabilities {
        HardwareCapabilities {
            encoder_tag: "libx264".into(),
            decoder_tag: None,
            platform_label: "software".into(),
            max_concurrent_streams: max,
            hardware_accelerated: false,
        }
    }

    #[tokio::test]
    async fn starting_unknown_transcoder_binary_is_config_error() {
        let sup = Supervisor::new("definitely-not-a-real-binary".into(), hardware(2), TimeoutsConfig::default());
        let params = StartParams {
            stream_id: 1,
            input_url: "rtmp://127.0.0.1:1935/live/camera_1".into(),
            output_urls: vec!["rtmp://preview/live".into()],
            profile: EncodingProfile { bitrate_kbps: 4000, width: 1280, height: 720, fps: 30 },
            timed_overlays: vec![],
            timeline_duration: 60.0,
            loop_flag: false,
        };
        let err = sup.start(params).await.unwrap_err();
        assert!(matches!(err, EngineError::TranscoderBinaryMissing(_)));
    }

    #[test]
    fn backoff_formula_matches_spec() {
        // min(2^n, 60) seconds, for restart attempts n = 1..=10
        let expected = [2, 4, 8, 16, 32, 60, 60, 60, 60, 60];
        for (n, &want) in (1u32..=10).zip(expected.iter()) {
            let got = 2u64.pow(n.min(6)).min(60);
            assert_eq!(got, want, "attempt {n}");
        }
    }
}
