//! On-disk workspaces keyed by generation id.
//!
//! A workspace is a directory `<root>/<generation id>` holding an app's full
//! source tree. Archives are unpacked into a hidden staging directory and
//! renamed into place, so a half-extracted tree is never visible under the
//! final name.

use std::fs;
use std::io::Cursor;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use regex::Regex;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::WorkspaceSection;
use crate::errors::{OrchestratorError, OrchestratorResult};

static GENERATION_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("valid regex"));

/// Reject ids that cannot safely become a directory name.
pub fn validate_generation_id(id: &str) -> OrchestratorResult<()> {
    if GENERATION_ID.is_match(id) {
        Ok(())
    } else {
        Err(OrchestratorError::InvalidGenerationId { id: id.to_string() })
    }
}

/// A directory found under the workspace root.
#[derive(Debug, Clone)]
pub struct WorkspaceEntry {
    pub generation_id: String,
    pub path: PathBuf,
    pub modified: SystemTime,
}

#[derive(Clone)]
pub struct WorkspaceStore {
    root: PathBuf,
    templates_root: PathBuf,
    client: reqwest::Client,
    download_timeout: Duration,
}

impl WorkspaceStore {
    pub fn new(config: &WorkspaceSection) -> Self {
        Self {
            root: config.root.clone(),
            templates_root: config.templates_root.clone(),
            client: reqwest::Client::new(),
            download_timeout: Duration::from_secs(config.download_timeout_secs),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, generation_id: &str) -> PathBuf {
        self.root.join(generation_id)
    }

    /// Return a usable source directory for `generation_id`.
    ///
    /// An `existing` path that is a directory on disk is returned unchanged.
    /// Otherwise `archive_url` is downloaded and unpacked into a fresh
    /// workspace; the caller persists the returned path.
    pub async fn materialize(
        &self,
        generation_id: &str,
        archive_url: Option<&str>,
        existing: Option<&Path>,
    ) -> OrchestratorResult<PathBuf> {
        validate_generation_id(generation_id)?;

        if let Some(path) = existing.filter(|p| p.is_dir()) {
            info!(
                generation_id,
                path = %path.display(),
                "[{}] Reusing existing workspace",
                generation_id
            );
            return Ok(path.to_path_buf());
        }

        let url = archive_url.ok_or_else(|| OrchestratorError::SourceUnavailable {
            generation_id: generation_id.to_string(),
        })?;

        let bytes = self.download(generation_id, url).await?;
        let target = self.path_for(generation_id);
        let staging = self
            .root
            .join(format!(".{}.partial-{}", generation_id, uuid::Uuid::new_v4()));

        let id = generation_id.to_string();
        let target_for_task = target.clone();
        tokio::task::spawn_blocking(move || {
            let result = unpack_into(&bytes, &staging)
                .and_then(|()| promote_staging(&staging, &target_for_task));
            // staging is gone after a successful rename; this only cleans up failures
            let _ = fs::remove_dir_all(&staging);
            result
        })
        .await
        .context("Archive extraction task panicked")?
        .map_err(|e| OrchestratorError::ArchiveFailed {
            generation_id: id,
            message: format!("{:#}", e),
        })?;

        info!(
            generation_id,
            path = %target.display(),
            "[{}] Materialized workspace from archive",
            generation_id
        );
        Ok(target)
    }

    async fn download(&self, generation_id: &str, url: &str) -> OrchestratorResult<Vec<u8>> {
        debug!(generation_id, url, "Downloading source archive");
        let archive_failed = |message: String| OrchestratorError::ArchiveFailed {
            generation_id: generation_id.to_string(),
            message,
        };
        let resp = self
            .client
            .get(url)
            .timeout(self.download_timeout)
            .send()
            .await
            .map_err(|e| archive_failed(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(archive_failed(format!(
                "download returned HTTP {}",
                resp.status()
            )));
        }
        let bytes = resp.bytes().await.map_err(|e| archive_failed(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    /// Remove a workspace. Returns whether a directory was deleted.
    pub async fn delete(&self, generation_id: &str) -> OrchestratorResult<bool> {
        validate_generation_id(generation_id)?;
        let path = self.path_for(generation_id);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                info!(generation_id, "[{}] Deleted workspace", generation_id);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(OrchestratorError::io(path, e)),
        }
    }

    /// Workspace directories under the root. Staging directories are skipped.
    pub fn list_entries(&self) -> OrchestratorResult<Vec<WorkspaceEntry>> {
        let read = match fs::read_dir(&self.root) {
            Ok(read) => read,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(OrchestratorError::io(&self.root, e)),
        };

        let mut entries = Vec::new();
        for entry in read {
            let entry = entry.map_err(|e| OrchestratorError::io(&self.root, e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let meta = entry
                .metadata()
                .map_err(|e| OrchestratorError::io(entry.path(), e))?;
            if !meta.is_dir() {
                continue;
            }
            let modified = meta
                .modified()
                .map_err(|e| OrchestratorError::io(entry.path(), e))?;
            entries.push(WorkspaceEntry {
                generation_id: name,
                path: entry.path(),
                modified,
            });
        }
        entries.sort_by(|a, b| a.generation_id.cmp(&b.generation_id));
        Ok(entries)
    }

    pub fn template_exists(&self, template: &str) -> bool {
        validate_generation_id(template).is_ok() && self.templates_root.join(template).is_dir()
    }

    /// Copy `templates_root/<template>` into a fresh workspace named `dest_name`.
    pub async fn copy_template(&self, template: &str, dest_name: &str) -> OrchestratorResult<PathBuf> {
        validate_generation_id(template)?;
        validate_generation_id(dest_name)?;
        let source = self.templates_root.join(template);
        if !source.is_dir() {
            return Err(OrchestratorError::SourceUnavailable {
                generation_id: template.to_string(),
            });
        }
        let dest = self.path_for(dest_name);
        let dest_for_task = dest.clone();
        tokio::task::spawn_blocking(move || copy_tree(&source, &dest_for_task))
            .await
            .context("Template copy task panicked")??;
        Ok(dest)
    }
}

fn unpack_into(bytes: &[u8], staging: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(staging)
        .with_context(|| format!("Failed to create {}", staging.display()))?;
    let mut archive = tar::Archive::new(GzDecoder::new(Cursor::new(bytes)));
    for entry in archive.entries().context("Failed to read archive")? {
        let mut entry = entry.context("Corrupt archive entry")?;
        let name = entry.path().map(|p| p.display().to_string()).unwrap_or_default();
        let unpacked = entry
            .unpack_in(staging)
            .with_context(|| format!("Failed to unpack {}", name))?;
        if !unpacked {
            anyhow::bail!("Archive entry '{}' escapes the workspace", name);
        }
    }
    Ok(())
}

/// Move the unpacked tree to `target`, flattening a single top-level directory.
fn promote_staging(staging: &Path, target: &Path) -> anyhow::Result<()> {
    let children: Vec<PathBuf> = fs::read_dir(staging)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    let source = match children.as_slice() {
        [only] if only.is_dir() => only.clone(),
        _ => staging.to_path_buf(),
    };

    if target.exists() {
        fs::remove_dir_all(target)
            .with_context(|| format!("Failed to replace {}", target.display()))?;
    }
    fs::rename(&source, target)
        .with_context(|| format!("Failed to move workspace into {}", target.display()))?;
    Ok(())
}

fn copy_tree(source: &Path, dest: &Path) -> OrchestratorResult<()> {
    if dest.exists() {
        fs::remove_dir_all(dest).map_err(|e| OrchestratorError::io(dest, e))?;
    }
    for entry in WalkDir::new(source) {
        let entry = entry.context("Failed to walk template")?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .context("Template entry outside template root")?;
        let out = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&out).map_err(|e| OrchestratorError::io(&out, e))?;
        } else {
            fs::copy(entry.path(), &out).map_err(|e| OrchestratorError::io(&out, e))?;
        }
    }
    Ok(())
}

/// Pack `dir` into an in-memory `.tar.gz`, skipping any entry whose path has a
/// component listed in `excludes`.
pub fn pack_tarball(dir: &Path, excludes: &[String]) -> anyhow::Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let walker = WalkDir::new(dir).min_depth(1).into_iter().filter_entry(|e| {
        let name = e.file_name().to_string_lossy();
        !excludes.iter().any(|x| x.as_str() == name)
    });
    for entry in walker {
        let entry = entry.context("Failed to walk workspace")?;
        let rel = entry.path().strip_prefix(dir)?;
        if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
            continue;
        }
        if entry.file_type().is_dir() {
            builder.append_dir(rel, entry.path())?;
        } else {
            builder
                .append_path_with_name(entry.path(), rel)
                .with_context(|| format!("Failed to add {}", rel.display()))?;
        }
    }

    let encoder = builder.into_inner().context("Failed to finish tarball")?;
    encoder.finish().context("Failed to finish gzip stream")
}
