//! The single local interactive preview process.
//!
//! At most one preview runs at a time. `start` is serialized: starting a
//! different generation first stops the current one. The proxy reads only
//! the published `PreviewState`, so routed traffic never waits on a start.

use std::path::Path;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::steps::kill_process_group;
use crate::config::LocalPreviewSection;
use crate::errors::{OrchestratorError, OrchestratorResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalPreviewStatus {
    Starting,
    Ready,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewState {
    pub generation_id: String,
    pub status: LocalPreviewStatus,
    pub pid: Option<u32>,
    pub host: String,
    pub port: u16,
    pub started_at: DateTime<Utc>,
    /// False when readiness came from the start timeout, not a probe.
    pub healthy: bool,
}

pub struct LocalPreviewManager {
    config: LocalPreviewSection,
    state: Mutex<Option<PreviewState>>,
    /// Held for the whole of `start`/`stop`.
    child: tokio::sync::Mutex<Option<Child>>,
    client: reqwest::Client,
}

impl LocalPreviewManager {
    pub fn new(config: LocalPreviewSection) -> Self {
        Self {
            config,
            state: Mutex::new(None),
            child: tokio::sync::Mutex::new(None),
            client: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn status(&self) -> Option<PreviewState> {
        self.state.lock().ok().and_then(|s| s.clone())
    }

    /// Upstream `host:port` when a preview is ready to receive traffic.
    pub fn ready_target(&self) -> Option<(String, u16)> {
        self.status()
            .filter(|s| s.status == LocalPreviewStatus::Ready)
            .map(|s| (s.host, s.port))
    }

    fn publish(&self, state: Option<PreviewState>) {
        if let Ok(mut slot) = self.state.lock() {
            *slot = state;
        }
    }

    /// Start the preview for `generation_id` from `workspace` and block until
    /// it is ready or the start timeout elapses.
    pub async fn start(&self, generation_id: &str, workspace: &Path) -> OrchestratorResult<PreviewState> {
        let mut slot = self.child.lock().await;

        if let (Some(current), Some(child)) = (self.status(), slot.as_mut())
            && current.generation_id == generation_id
            && current.status == LocalPreviewStatus::Ready
            && matches!(child.try_wait(), Ok(None))
        {
            debug!(generation_id, "Local preview already running");
            return Ok(current);
        }

        if let Some(old) = slot.take() {
            self.terminate(old).await;
            self.publish(None);
        }

        let start_failed = |message: String| OrchestratorError::PreviewStartFailed {
            generation_id: generation_id.to_string(),
            message,
        };
        let (program, args) = self
            .config
            .start_command
            .split_first()
            .ok_or_else(|| start_failed("start command is empty".into()))?;

        let mut child = Command::new(program)
            .args(args)
            .current_dir(workspace)
            .env("PORT", self.config.port.to_string())
            .env("HOSTNAME", &self.config.host)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| start_failed(format!("failed to spawn '{}': {}", program, e)))?;

        let mut state = PreviewState {
            generation_id: generation_id.to_string(),
            status: LocalPreviewStatus::Starting,
            pid: child.id(),
            host: self.config.host.clone(),
            port: self.config.port,
            started_at: Utc::now(),
            healthy: false,
        };
        self.publish(Some(state.clone()));
        info!(generation_id, pid = ?state.pid, port = state.port, "[{}] Local preview starting", generation_id);

        let deadline = Instant::now() + Duration::from_secs(self.config.start_timeout_secs);
        let interval = Duration::from_millis(self.config.probe_interval_ms);
        loop {
            if let Ok(Some(exit)) = child.try_wait() {
                self.publish(None);
                return Err(start_failed(format!("process exited early with {}", exit)));
            }
            if self.probe().await {
                state.healthy = true;
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    generation_id,
                    timeout_secs = self.config.start_timeout_secs,
                    "[{}] Health probe never succeeded, marking ready after timeout",
                    generation_id
                );
                break;
            }
            tokio::time::sleep(interval).await;
        }

        state.status = LocalPreviewStatus::Ready;
        self.publish(Some(state.clone()));
        *slot = Some(child);
        info!(generation_id, healthy = state.healthy, "[{}] Local preview ready", generation_id);
        Ok(state)
    }

    async fn probe(&self) -> bool {
        let url = format!(
            "http://{}:{}{}",
            self.config.host, self.config.port, self.config.health_path
        );
        match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(2))
            .send()
            .await
        {
            Ok(resp) => resp.status().as_u16() < 500,
            Err(_) => false,
        }
    }

    /// Stop the active preview. Returns whether one was running.
    pub async fn stop(&self) -> bool {
        let mut slot = self.child.lock().await;
        let stopped = match slot.take() {
            Some(child) => {
                self.terminate(child).await;
                true
            }
            None => false,
        };
        self.publish(None);
        stopped
    }

    /// Kill the whole process group, falling back to the direct child, and
    /// reap it.
    async fn terminate(&self, mut child: Child) {
        let pid = child.id();
        match pid {
            Some(pid) => kill_process_group(pid),
            None => return,
        }
        if let Err(e) = child.start_kill() {
            debug!(error = %e, "Direct kill after group kill failed");
        }
        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(Ok(status)) => info!(pid = ?pid, %status, "Local preview stopped"),
            Ok(Err(e)) => warn!(pid = ?pid, error = %e, "Failed to reap local preview"),
            Err(_) => warn!(pid = ?pid, "Local preview did not exit after kill"),
        }
    }
}
