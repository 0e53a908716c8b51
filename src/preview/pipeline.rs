//! Preview deployment pipeline.
//!
//! `PipelineExecutor::start_deploy` accepts a request, claims the generation
//! and spawns the pipeline on its own task. Stages run strictly in order:
//!
//! ```text
//! resolve_source → patch_manifest → install_dependencies → schema_setup
//!   → seed_data → provision_compute → deploy → capture_verification
//!   → persist_result
//! ```
//!
//! Schema, seed, manifest and screenshot failures are logged and the pipeline
//! continues. Any other failure aborts it and marks the generation `failed`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::compute::{ComputePlatform, SecretChanges};
use super::db::DbHandle;
use super::manifest::{self, ManifestPatch};
use super::models::*;
use super::screenshot;
use super::steps::CommandRunner;
use super::workspace::{WorkspaceStore, validate_generation_id};
use crate::config::{CommandSpec, PipelineSection};
use crate::errors::{OrchestratorError, OrchestratorResult, truncate_tail};

/// Infra manifest rewritten by a template redeploy.
pub const DEPLOY_MANIFEST: &str = "deploy.toml";

/// Synchronous answer to a deploy or redeploy request.
#[derive(Debug)]
pub enum DeployOutcome {
    /// Pipeline spawned. The handle is only kept for logging and tests.
    Accepted(JoinHandle<()>),
    /// A pipeline for the same target is already running.
    InProgress,
    /// The generation already has a live preview.
    AlreadyDeployed { preview_url: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageStatus {
    Succeeded(String),
    Skipped(String),
    /// Non-fatal failure; the pipeline continued.
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub stage: PipelineStage,
    pub status: StageStatus,
}

/// Per-stage record of one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub stages: Vec<StageOutcome>,
    pub preview: Option<PreviewResult>,
}

impl PipelineReport {
    pub fn status_of(&self, stage: PipelineStage) -> Option<&StageStatus> {
        self.stages
            .iter()
            .find(|s| s.stage == stage)
            .map(|s| &s.status)
    }

    fn record(&mut self, generation_id: &str, stage: PipelineStage, status: StageStatus) {
        match &status {
            StageStatus::Succeeded(detail) => info!(
                generation_id,
                stage = stage.as_str(),
                "[{}] {}: {}",
                generation_id,
                stage,
                detail
            ),
            StageStatus::Skipped(detail) => info!(
                generation_id,
                stage = stage.as_str(),
                "[{}] {}: skipped ({})",
                generation_id,
                stage,
                detail
            ),
            StageStatus::Failed(detail) => warn!(
                generation_id,
                stage = stage.as_str(),
                "[{}] {}: failed, continuing: {}",
                generation_id,
                stage,
                detail
            ),
        }
        self.stages.push(StageOutcome { stage, status });
    }
}

/// Keys of the pipelines currently running, shared with the garbage
/// collector so it can hold a generation while deleting its workspace.
#[derive(Clone, Default)]
pub struct InFlight {
    set: Arc<Mutex<HashSet<String>>>,
}

impl InFlight {
    /// Claim `key`, or `None` when someone else holds it.
    pub fn try_claim(&self, key: String) -> Option<InFlightGuard> {
        let mut set = self.set.lock().ok()?;
        if !set.insert(key.clone()) {
            return None;
        }
        Some(InFlightGuard {
            set: Arc::clone(&self.set),
            key,
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.set.lock().map(|set| set.contains(key)).unwrap_or(false)
    }
}

/// Membership token in the in-flight set, released on drop.
pub struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.key);
        }
    }
}

#[derive(Clone)]
pub struct PipelineExecutor {
    db: DbHandle,
    workspaces: WorkspaceStore,
    runner: Arc<dyn CommandRunner>,
    compute: Arc<dyn ComputePlatform>,
    config: PipelineSection,
    in_flight: InFlight,
}

impl PipelineExecutor {
    pub fn new(
        db: DbHandle,
        workspaces: WorkspaceStore,
        runner: Arc<dyn CommandRunner>,
        compute: Arc<dyn ComputePlatform>,
        config: PipelineSection,
    ) -> Self {
        Self {
            db,
            workspaces,
            runner,
            compute,
            config,
            in_flight: InFlight::default(),
        }
    }

    pub fn in_flight(&self) -> InFlight {
        self.in_flight.clone()
    }

    pub fn is_running(&self, generation_id: &str) -> bool {
        self.in_flight.contains(&deploy_key(generation_id))
    }

    /// Accept a deploy request. Returns immediately; the pipeline runs on its
    /// own task and reports only through the generation record and logs.
    pub async fn start_deploy(
        &self,
        generation_id: &str,
        kind: DeploymentKind,
    ) -> OrchestratorResult<DeployOutcome> {
        validate_generation_id(generation_id)?;

        let Some(guard) = self.in_flight.try_claim(deploy_key(generation_id)) else {
            info!(generation_id, "[{}] Deploy already in progress", generation_id);
            return Ok(DeployOutcome::InProgress);
        };

        let id = generation_id.to_string();
        let record = self
            .db
            .call(move |db| db.get_generation(&id))
            .await
            .map_err(OrchestratorError::Database)?
            .ok_or_else(|| OrchestratorError::GenerationNotFound {
                id: generation_id.to_string(),
            })?;

        if record.has_preview() {
            info!(
                generation_id,
                "[{}] Preview already deployed at {}",
                generation_id,
                record.preview_url.as_deref().unwrap_or("-")
            );
            return Ok(DeployOutcome::AlreadyDeployed {
                preview_url: record.preview_url,
            });
        }

        let this = self.clone();
        let id = generation_id.to_string();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            match this.run_deploy(&id, kind).await {
                Ok(report) => info!(
                    generation_id = %id,
                    "[{}] Pipeline complete: {}",
                    id,
                    report
                        .preview
                        .as_ref()
                        .map(|p| p.url.as_str())
                        .unwrap_or("-")
                ),
                Err(e) => error!(generation_id = %id, "[{}] Pipeline failed: {}", id, e),
            }
        });
        Ok(DeployOutcome::Accepted(handle))
    }

    /// Run the whole pipeline for one generation. Fatal failures mark the
    /// record `failed` with the truncated error before returning it.
    pub async fn run_deploy(
        &self,
        generation_id: &str,
        kind: DeploymentKind,
    ) -> OrchestratorResult<PipelineReport> {
        let mut report = PipelineReport::default();
        match self.execute(generation_id, kind, &mut report).await {
            Ok(preview) => {
                report.preview = Some(preview);
                Ok(report)
            }
            Err(err) => {
                let message = truncate_tail(&err.to_string(), self.config.max_error_chars);
                let id = generation_id.to_string();
                if let Err(e) = self
                    .db
                    .call(move |db| {
                        db.update_generation_status(&id, GenerationStatus::Failed, Some(message.as_str()))
                    })
                    .await
                {
                    error!(
                        generation_id,
                        "[{}] CRITICAL: pipeline failed but could not update record: {:#}",
                        generation_id,
                        e
                    );
                }
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        generation_id: &str,
        kind: DeploymentKind,
        report: &mut PipelineReport,
    ) -> OrchestratorResult<PreviewResult> {
        // Claim the workspace before touching it so the stale sweep skips it.
        let id = generation_id.to_string();
        let record = self
            .db
            .call(move |db| db.update_generation_status(&id, GenerationStatus::Deploying, None))
            .await
            .map_err(OrchestratorError::Database)?;

        let workspace = self.resolve_source(&record, report).await?;
        self.patch_manifest(generation_id, &workspace, report);
        self.install_dependencies(generation_id, &workspace, report).await?;
        self.schema_setup(generation_id, &workspace, report).await;
        self.seed_data(generation_id, &workspace, report).await;

        let instance = self.compute.provision(generation_id, kind).await?;
        report.record(
            generation_id,
            PipelineStage::ProvisionCompute,
            StageStatus::Succeeded(format!("instance {}", instance)),
        );

        let url = self.compute.deploy(&instance, &workspace).await?;
        report.record(
            generation_id,
            PipelineStage::Deploy,
            StageStatus::Succeeded(format!("live at {}", url)),
        );

        let screenshot_url =
            match screenshot::capture(self.runner.as_ref(), &self.config, &workspace, generation_id, &url)
                .await
            {
                Ok(shot) => {
                    report.record(
                        generation_id,
                        PipelineStage::CaptureVerification,
                        StageStatus::Succeeded(shot.clone()),
                    );
                    Some(shot)
                }
                Err(e) => {
                    report.record(
                        generation_id,
                        PipelineStage::CaptureVerification,
                        StageStatus::Failed(e.to_string()),
                    );
                    None
                }
            };

        let preview = PreviewResult {
            instance_id: instance,
            url,
            expires_at: kind.expires_at(Utc::now(), self.config.draft_ttl_days),
            screenshot_url,
        };
        self.persist_result(&record, kind, &preview, report).await?;
        Ok(preview)
    }

    async fn resolve_source(
        &self,
        record: &GenerationRecord,
        report: &mut PipelineReport,
    ) -> OrchestratorResult<PathBuf> {
        let existing = record.workspace_path.as_deref().map(PathBuf::from);
        let workspace = self
            .workspaces
            .materialize(&record.id, record.archive_url.as_deref(), existing.as_deref())
            .await?;

        let path = workspace.display().to_string();
        if record.workspace_path.as_deref() != Some(path.as_str()) {
            let id = record.id.clone();
            let stored = path.clone();
            self.db
                .call(move |db| db.set_workspace_path(&id, &stored))
                .await
                .map_err(OrchestratorError::Database)?;
        }
        report.record(
            &record.id,
            PipelineStage::ResolveSource,
            StageStatus::Succeeded(path),
        );
        Ok(workspace)
    }

    fn patch_manifest(&self, generation_id: &str, workspace: &Path, report: &mut PipelineReport) {
        let path = workspace.join(&self.config.manifest);
        let status = match manifest::patch_binary_targets(&path, &self.config.binary_targets) {
            Ok(ManifestPatch::Patched) => StageStatus::Succeeded("added binaryTargets".into()),
            Ok(ManifestPatch::AlreadyPresent) => {
                StageStatus::Succeeded("binaryTargets already present".into())
            }
            Ok(ManifestPatch::Absent) => StageStatus::Skipped("no manifest".into()),
            Ok(ManifestPatch::NoGenerator) => StageStatus::Skipped("no client generator".into()),
            Err(e) => StageStatus::Failed(format!("{:#}", e)),
        };
        report.record(generation_id, PipelineStage::PatchManifest, status);
    }

    /// Run one command; `Err` carries the truncated diagnostic on any failure.
    async fn run_command(&self, workspace: &Path, cmd: &CommandSpec) -> Result<(), String> {
        match self.runner.run(workspace, cmd).await {
            Ok(out) if out.success => Ok(()),
            Ok(out) => Err(out.failure_message(self.config.max_error_chars)),
            Err(e) => Err(truncate_tail(&format!("{:#}", e), self.config.max_error_chars)),
        }
    }

    async fn install_dependencies(
        &self,
        generation_id: &str,
        workspace: &Path,
        report: &mut PipelineReport,
    ) -> OrchestratorResult<()> {
        self.run_command(workspace, &self.config.install)
            .await
            .map_err(|message| OrchestratorError::DependencyInstallFailed { message })?;
        report.record(
            generation_id,
            PipelineStage::InstallDependencies,
            StageStatus::Succeeded(self.config.install.program.clone()),
        );
        Ok(())
    }

    /// Format, generate and push. Each sub-step is attempted regardless of
    /// the previous one's result.
    async fn schema_setup(&self, generation_id: &str, workspace: &Path, report: &mut PipelineReport) {
        let steps = [
            ("format", &self.config.schema_format),
            ("generate", &self.config.schema_generate),
            ("push", &self.config.schema_push),
        ];
        let mut failures = Vec::new();
        for (step, cmd) in steps {
            if let Err(message) = self.run_command(workspace, cmd).await {
                let err = OrchestratorError::SchemaStepFailed {
                    step: step.to_string(),
                    message,
                };
                failures.push(err.to_string());
            }
        }
        let status = if failures.is_empty() {
            StageStatus::Succeeded("format, generate, push".into())
        } else {
            StageStatus::Failed(failures.join("; "))
        };
        report.record(generation_id, PipelineStage::SchemaSetup, status);
    }

    async fn seed_data(&self, generation_id: &str, workspace: &Path, report: &mut PipelineReport) {
        let script = workspace.join(&self.config.seed_script);
        let status = if !script.is_file() {
            StageStatus::Skipped(format!("no {}", self.config.seed_script.display()))
        } else {
            match self.run_command(workspace, &self.config.seed).await {
                Ok(()) => StageStatus::Succeeded("seeded".into()),
                Err(message) => StageStatus::Failed(OrchestratorError::SeedFailed { message }.to_string()),
            }
        };
        report.record(generation_id, PipelineStage::SeedData, status);
    }

    async fn persist_result(
        &self,
        record: &GenerationRecord,
        kind: DeploymentKind,
        preview: &PreviewResult,
        report: &mut PipelineReport,
    ) -> OrchestratorResult<()> {
        let id = record.id.clone();
        // Only store previews are cached on a listing; draft ones expire.
        let linked_app_id = match kind {
            DeploymentKind::Store => record.linked_app_id,
            DeploymentKind::Draft => None,
        };
        let stored = preview.clone();
        let listing_updated = self
            .db
            .call(move |db| {
                db.record_preview(&id, &stored)?;
                let Some(app_id) = linked_app_id else {
                    return Ok(false);
                };
                match db.get_listing(app_id)? {
                    Some(listing) if !listing.is_draft => {
                        db.update_listing_preview(
                            app_id,
                            &stored.url,
                            stored.screenshot_url.as_deref(),
                        )?;
                        Ok(true)
                    }
                    _ => Ok(false),
                }
            })
            .await
            .map_err(OrchestratorError::Database)?;

        let expiry = preview
            .expires_at
            .map(|t| format!("expires {}", t.to_rfc3339()))
            .unwrap_or_else(|| "no expiry".to_string());
        let detail = if listing_updated {
            format!("{}, listing updated", expiry)
        } else {
            expiry
        };
        report.record(
            &record.id,
            PipelineStage::PersistResult,
            StageStatus::Succeeded(detail),
        );
        Ok(())
    }

    // ── Template redeploy ─────────────────────────────────────────────

    /// Accept a redeploy of a fixed template onto an existing instance.
    pub fn start_redeploy(&self, template: &str, instance: &str) -> OrchestratorResult<DeployOutcome> {
        validate_generation_id(template)?;
        validate_generation_id(instance)?;

        let Some(guard) = self.in_flight.try_claim(format!("redeploy:{}", instance)) else {
            return Ok(DeployOutcome::InProgress);
        };

        let this = self.clone();
        let template = template.to_string();
        let instance = instance.to_string();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = this.run_redeploy(&template, &instance).await {
                error!(instance = %instance, "[redeploy-{}] Redeploy failed: {}", instance, e);
            }
        });
        Ok(DeployOutcome::Accepted(handle))
    }

    /// Copy the template, point its infra manifest at `instance`, stage
    /// preview mode and deploy. No provisioning: the instance must exist.
    pub async fn run_redeploy(&self, template: &str, instance: &str) -> OrchestratorResult<String> {
        let label = format!("redeploy-{}", instance);
        let workspace = self.workspaces.copy_template(template, &label).await?;
        info!(instance, "[{}] Copied template {}", label, template);

        let manifest = workspace.join(DEPLOY_MANIFEST);
        let content = match tokio::fs::read_to_string(&manifest).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(OrchestratorError::io(&manifest, e)),
        };
        tokio::fs::write(&manifest, set_app_name(&content, instance))
            .await
            .map_err(|e| OrchestratorError::io(&manifest, e))?;

        // Staged before deploy so the new release boots with it.
        let mut changes = SecretChanges::default();
        changes
            .set
            .insert("PREVIEW_MODE".to_string(), "true".to_string());
        self.compute.set_secrets(instance, &changes).await?;

        let url = self.compute.deploy(instance, &workspace).await?;
        info!(instance, "[{}] Redeployed {} at {}", label, template, url);
        Ok(url)
    }
}

/// In-flight key of a generation's deploy pipeline.
pub fn deploy_key(generation_id: &str) -> String {
    format!("deploy:{}", generation_id)
}

/// Point the `app = "..."` line of an infra manifest at `instance`, adding
/// the line when the manifest has none.
pub fn set_app_name(content: &str, instance: &str) -> String {
    let line = format!("app = \"{}\"", instance);
    let mut replaced = false;
    let mut out: Vec<String> = content
        .lines()
        .map(|l| {
            let key = l.split('=').next().map(str::trim);
            if !replaced && l.contains('=') && key == Some("app") {
                replaced = true;
                line.clone()
            } else {
                l.to_string()
            }
        })
        .collect();
    if !replaced {
        out.insert(0, line);
    }
    let mut joined = out.join("\n");
    joined.push('\n');
    joined
}
