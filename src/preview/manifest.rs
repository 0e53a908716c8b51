//! Build-target injection for the schema manifest.
//!
//! The ORM client generated during dependency install ships a native query
//! engine. Unless the manifest's `generator client` block lists the deployment
//! target, the engine only matches the build host.

use std::path::Path;

use anyhow::{Context, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestPatch {
    /// No manifest in the workspace; nothing to do.
    Absent,
    /// The generator block already declares its targets.
    AlreadyPresent,
    Patched,
    /// Manifest exists but has no `generator client` block.
    NoGenerator,
}

/// Insert `binaryTargets` into the `generator client` block if missing.
pub fn patch_binary_targets(manifest: &Path, targets: &[String]) -> Result<ManifestPatch> {
    let content = match std::fs::read_to_string(manifest) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ManifestPatch::Absent),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", manifest.display()));
        }
    };

    let (patched, outcome) = insert_targets(&content, targets);
    if outcome == ManifestPatch::Patched {
        std::fs::write(manifest, patched)
            .with_context(|| format!("Failed to write {}", manifest.display()))?;
    }
    Ok(outcome)
}

fn insert_targets(content: &str, targets: &[String]) -> (String, ManifestPatch) {
    let lines: Vec<&str> = content.lines().collect();
    let Some(start) = lines.iter().position(|l| is_client_generator(l)) else {
        return (content.to_string(), ManifestPatch::NoGenerator);
    };
    let Some(end) = lines[start..].iter().position(|l| l.trim() == "}").map(|i| i + start) else {
        return (content.to_string(), ManifestPatch::NoGenerator);
    };

    if lines[start..end]
        .iter()
        .any(|l| l.trim_start().starts_with("binaryTargets"))
    {
        return (content.to_string(), ManifestPatch::AlreadyPresent);
    }

    let quoted: Vec<String> = targets.iter().map(|t| format!("\"{}\"", t)).collect();
    let mut out: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
    out.insert(end, format!("  binaryTargets = [{}]", quoted.join(", ")));

    let mut patched = out.join("\n");
    if content.ends_with('\n') {
        patched.push('\n');
    }
    (patched, ManifestPatch::Patched)
}

fn is_client_generator(line: &str) -> bool {
    let mut words = line.split_whitespace();
    words.next() == Some("generator") && words.next() == Some("client")
}
