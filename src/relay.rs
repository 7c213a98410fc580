//! Camera Relay Pool (C3). For every active camera, keeps a long-lived child
//! process copying the camera's RTSP stream into a local RTMP URL so the
//! Timeline Executor can switch between cameras by re-pointing the
//! transcoder at an already-warm local source instead of opening a fresh
//! network connection. Grounded in
//! `original_source/backend/services/rtmp_relay_service.py`.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::model::RelayState;

const RESTART_DELAY: Duration = Duration::from_secs(5);

/// Local RTMP URL a relay for `camera_id` publishes to, per §3's Relay State
/// invariant.
pub fn relay_url(base: &str, camera_id: i64) -> String {
    format!("{}/camera_{camera_id}", base.trim_end_matches('/'))
}

struct Entry {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    state: Arc<Mutex<RelayState>>,
}

/// Serializes start/stop per camera id, per §5's ordering guarantee.
pub struct RelayPool {
    transcoder_binary: String,
    relay_rtmp_base: String,
    entries: Mutex<HashMap<i64, Entry>>,
}

impl RelayPool {
    pub fn new(transcoder_binary: String, relay_rtmp_base: String) -> Self {
        Self { transcoder_binary, relay_rtmp_base, entries: Mutex::new(HashMap::new()) }
    }

    /// Starts (or no-ops if already running) the relay for one camera.
    pub async fn start(&self, camera_id: i64, rtsp_url: String) {
        {
            let entries = self.entries.lock();
            if entries.contains_key(&camera_id) {
                info!(camera_id, "relay already running");
                return;
            }
        }

        let local_rtmp_url = relay_url(&self.relay_rtmp_base, camera_id);
        let state = Arc::new(Mutex::new(RelayState {
            camera_id,
            local_rtmp_url: local_rtmp_url.clone(),
            last_restart_at: None,
        }));

        let (stop_tx, stop_rx) = oneshot::channel();
        let transcoder_binary = self.transcoder_binary.clone();
        let task_state = state.clone();
        let task = tokio::spawn(async move {
            run_relay(camera_id, rtsp_url, local_rtmp_url, transcoder_binary, stop_rx, task_state).await;
        });

        self.entries.lock().insert(camera_id, Entry { stop_tx: Some(stop_tx), task, state });
    }

    /// Stops one camera's relay. Idempotent.
    pub async fn stop(&self, camera_id: i64) {
        let entry = self.entries.lock().remove(&camera_id);
        let Some(mut entry) = entry else { return };
        if let Some(tx) = entry.stop_tx.take() {
            let _ = tx.send(());
        }
        let _ = entry.task.await;
    }

    /// Terminates every relay. Used on engine shutdown.
    pub async fn stop_all(&self) {
        let ids: Vec<i64> = self.entries.lock().keys().copied().collect();
        for id in ids {
            self.stop(id).await;
        }
    }

    pub fn relay_state(&self, camera_id: i64) -> Option<RelayState> {
        self.entries.lock().get(&camera_id).map(|e| e.state.lock().clone())
    }

    pub fn local_url(&self, camera_id: i64) -> Option<String> {
        self.entries.lock().get(&camera_id).map(|_| relay_url(&self.relay_rtmp_base, camera_id))
    }

    pub fn is_running(&self, camera_id: i64) -> bool {
        self.entries.lock().contains_key(&camera_id)
    }
}

fn spawn_relay_child(transcoder_binary: &str, rtsp_url: &str, rtmp_url: &str) -> std::io::Result<Child> {
    // `-c:v copy` avoids re-encoding (low latency); audio is re-encoded to AAC
    // to guarantee RTMP-compatible output regardless of the camera's codec.
    Command::new(transcoder_binary)
        .args([
            "-loglevel", "warning",
            "-rtsp_transport", "tcp",
            "-i", rtsp_url,
            "-c:v", "copy",
            "-c:a", "aac",
            "-b:a", "128k",
            "-ar", "44100",
            "-f", "flv",
            rtmp_url,
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

async fn run_relay(
    camera_id: i64,
    rtsp_url: String,
    rtmp_url: String,
    transcoder_binary: String,
    mut stop_rx: oneshot::Receiver<()>,
    state: Arc<Mutex<RelayState>>,
) {
    'lifecycle: loop {
        let mut child = match spawn_relay_child(&transcoder_binary, &rtsp_url, &rtmp_url) {
            Ok(c) => c,
            Err(e) => {
                error!(camera_id, error = %e, "failed to spawn camera relay");
                tokio::select! {
                    _ = tokio::time::sleep(RESTART_DELAY) => continue 'lifecycle,
                    _ = &mut stop_rx => break 'lifecycle,
                }
            }
        };
        info!(camera_id, pid = ?child.id(), %rtmp_url, "relay started");

        let mut stderr = child.stderr.take().expect("stderr piped at spawn");

        let died = tokio::select! {
            biased;
            _ = &mut stop_rx => {
                terminate(&mut child).await;
                break 'lifecycle;
            }
            _ = drain_stderr(&mut stderr) => true,
        };

        if died {
            let status = child.wait().await;
            warn!(camera_id, ?status, "relay died, restarting in 5s");
            {
                let mut s = state.lock();
                s.last_restart_at = Some(Utc::now());
            }
            tokio::select! {
                _ = tokio::time::sleep(RESTART_DELAY) => continue 'lifecycle,
                _ = &mut stop_rx => break 'lifecycle,
            }
        }
    }
}

async fn drain_stderr(stderr: &mut tokio::process::ChildStderr) {
    let mut buf = [0u8; 8192];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) => return,
            Ok(_) => continue,
            Err(_) => return,
        }
    }
}

async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            extern "C" {
                fn kill(pid: i32, sig: i32) -> i32;
            }
            kill(pid as i32, 15);
        }
    }
    let waited = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
    if waited.is_err() {
        let _ = child.kill().await;
        let _ = child.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_url_matches_spec_pattern() {
        assert_eq!(
            relay_url("rtmp://127.0.0.1:1935/live", 7),
            "rtmp://127.0.0.1:1935/live/camera_7"
        );
    }

    #[tokio::test]
    async fn stopping_unknown_camera_is_noop() {
        let pool = RelayPool::new("definitely-not-a-real-binary".into(), "rtmp://127.0.0.1:1935/live".into());
        pool.stop(999).await;
        assert!(!pool.is_running(999));
    }
}
