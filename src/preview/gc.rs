//! Background reclamation of expired previews and stale workspaces.
//!
//! Two sweeps share one timer:
//! - expired previews: destroy the remote instance, then clear the preview
//!   triple on the record. Source workspaces are kept.
//! - stale workspaces: delete directories idle past the retention window
//!   whose generation is terminal or unknown. Workspaces of in-flight
//!   generations are never touched, whatever their age.
//!
//! A failure on one item is logged and counted; the sweep moves on.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::compute::ComputePlatform;
use super::db::DbHandle;
use super::models::ProductionStatus;
use super::pipeline::{InFlight, deploy_key};
use super::workspace::WorkspaceStore;
use crate::config::GcSection;
use crate::errors::{OrchestratorError, OrchestratorResult};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PreviewSweep {
    pub expired: usize,
    pub destroyed: usize,
    pub failed: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkspaceSweep {
    pub scanned: usize,
    pub deleted: usize,
    pub skipped_in_flight: usize,
    pub failed: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub previews: PreviewSweep,
    pub workspaces: WorkspaceSweep,
}

pub struct GarbageCollector {
    db: DbHandle,
    workspaces: WorkspaceStore,
    compute: Arc<dyn ComputePlatform>,
    config: GcSection,
    in_flight: InFlight,
    shutdown: Arc<Notify>,
}

impl GarbageCollector {
    pub fn new(
        db: DbHandle,
        workspaces: WorkspaceStore,
        compute: Arc<dyn ComputePlatform>,
        config: GcSection,
    ) -> Self {
        Self {
            db,
            workspaces,
            compute,
            config,
            in_flight: InFlight::default(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Share the executor's in-flight set so a deploy starting mid-sweep
    /// never loses its workspace.
    pub fn with_in_flight(mut self, in_flight: InFlight) -> Self {
        self.in_flight = in_flight;
        self
    }

    /// Handle used to stop `run`.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Sweep on every tick until shutdown is signalled.
    pub async fn run(&self) {
        let interval = Duration::from_secs(self.config.interval_secs);
        info!(
            interval_secs = self.config.interval_secs,
            retention_secs = self.config.workspace_retention_secs,
            "Garbage collector started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Garbage collector received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(interval) => {
                    self.run_once(Utc::now(), SystemTime::now()).await;
                }
            }
        }

        info!("Garbage collector stopped");
    }

    /// Run both sweeps once.
    pub async fn run_once(&self, now: DateTime<Utc>, wall: SystemTime) -> GcReport {
        let previews = match self.sweep_expired_previews(now).await {
            Ok(sweep) => sweep,
            Err(e) => {
                error!(error = %e, "Preview expiration sweep failed");
                PreviewSweep::default()
            }
        };
        let workspaces = match self.sweep_stale_workspaces(wall).await {
            Ok(sweep) => sweep,
            Err(e) => {
                error!(error = %e, "Stale workspace sweep failed");
                WorkspaceSweep::default()
            }
        };
        let report = GcReport {
            previews,
            workspaces,
        };
        if previews.expired > 0 || workspaces.deleted > 0 || previews.failed + workspaces.failed > 0 {
            info!(
                previews_destroyed = previews.destroyed,
                previews_failed = previews.failed,
                workspaces_deleted = workspaces.deleted,
                workspaces_failed = workspaces.failed,
                "Garbage collection cycle completed"
            );
        } else {
            debug!("Garbage collection cycle completed, nothing to reclaim");
        }
        report
    }

    pub async fn sweep_expired_previews(&self, now: DateTime<Utc>) -> OrchestratorResult<PreviewSweep> {
        let expired = self
            .db
            .call(move |db| db.list_expired_previews(now))
            .await
            .map_err(OrchestratorError::Database)?;

        let mut sweep = PreviewSweep {
            expired: expired.len(),
            ..PreviewSweep::default()
        };

        for record in expired {
            let Some(instance) = record.preview_instance_id.clone() else {
                continue;
            };
            if let Err(e) = self.compute.destroy(&instance).await {
                warn!(
                    generation_id = %record.id,
                    instance = %instance,
                    error = %e,
                    "[{}] Failed to destroy expired preview, will retry next sweep",
                    record.id
                );
                sweep.failed += 1;
                continue;
            }

            let id = record.id.clone();
            let cleared = self
                .db
                .call(move |db| {
                    db.clear_preview(&id)?;
                    if let Some(dep) = db.production_deployment_for(&id)?
                        && dep.status == ProductionStatus::Preview
                    {
                        db.stop_production_deployment(dep.id)?;
                    }
                    Ok(())
                })
                .await;

            match cleared {
                Ok(()) => {
                    info!(
                        generation_id = %record.id,
                        instance = %instance,
                        "[{}] Expired preview destroyed",
                        record.id
                    );
                    sweep.destroyed += 1;
                }
                Err(e) => {
                    error!(
                        generation_id = %record.id,
                        error = %format!("{:#}", e),
                        "[{}] Preview destroyed but record not cleared",
                        record.id
                    );
                    sweep.failed += 1;
                }
            }
        }
        Ok(sweep)
    }

    pub async fn sweep_stale_workspaces(&self, now: SystemTime) -> OrchestratorResult<WorkspaceSweep> {
        let retention = Duration::from_secs(self.config.workspace_retention_secs);
        let entries = self.workspaces.list_entries()?;
        let mut sweep = WorkspaceSweep {
            scanned: entries.len(),
            ..WorkspaceSweep::default()
        };

        for entry in entries {
            let idle = now.duration_since(entry.modified).unwrap_or(Duration::ZERO);
            if idle < retention {
                continue;
            }

            // Held until the directory is gone; a deploy arriving meanwhile
            // answers in_progress instead of reusing it.
            let Some(_claim) = self.in_flight.try_claim(deploy_key(&entry.generation_id)) else {
                debug!(generation_id = %entry.generation_id, "Skipping workspace of running pipeline");
                sweep.skipped_in_flight += 1;
                continue;
            };

            let id = entry.generation_id.clone();
            let record = match self.db.call(move |db| db.get_generation(&id)).await {
                Ok(record) => record,
                Err(e) => {
                    warn!(generation_id = %entry.generation_id, error = %format!("{:#}", e), "Failed to look up generation");
                    sweep.failed += 1;
                    continue;
                }
            };
            if let Some(record) = &record
                && !record.status.is_terminal()
            {
                debug!(
                    generation_id = %record.id,
                    status = %record.status,
                    "Skipping workspace of in-flight generation"
                );
                sweep.skipped_in_flight += 1;
                continue;
            }

            match self.workspaces.delete(&entry.generation_id).await {
                Ok(_) => {
                    sweep.deleted += 1;
                    if record.is_some() {
                        let id = entry.generation_id.clone();
                        if let Err(e) = self.db.call(move |db| db.clear_workspace_path(&id)).await {
                            warn!(generation_id = %entry.generation_id, error = %format!("{:#}", e), "Failed to clear workspace path");
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        path = %entry.path.display(),
                        error = %e,
                        "Failed to delete stale workspace"
                    );
                    sweep.failed += 1;
                }
            }
        }
        Ok(sweep)
    }
}
