//! One-shot garbage collection: `launchpad sweep`.

use std::time::SystemTime;

use anyhow::Result;
use chrono::Utc;

use launchpad::config::AppConfig;
use launchpad::preview::gc::{GarbageCollector, GcReport};
use launchpad::preview::server::{compute_client, open_db};
use launchpad::preview::workspace::WorkspaceStore;

pub async fn cmd_sweep(config: &AppConfig, previews_only: bool, workspaces_only: bool) -> Result<()> {
    let collector = GarbageCollector::new(
        open_db(config)?,
        WorkspaceStore::new(&config.workspace),
        compute_client(config)?,
        config.gc.clone(),
    );

    let report = if previews_only {
        GcReport {
            previews: collector.sweep_expired_previews(Utc::now()).await?,
            ..GcReport::default()
        }
    } else if workspaces_only {
        GcReport {
            workspaces: collector.sweep_stale_workspaces(SystemTime::now()).await?,
            ..GcReport::default()
        }
    } else {
        collector.run_once(Utc::now(), SystemTime::now()).await
    };

    if !workspaces_only {
        println!(
            "Previews:   {} expired, {} destroyed, {} failed",
            report.previews.expired, report.previews.destroyed, report.previews.failed
        );
    }
    if !previews_only {
        println!(
            "Workspaces: {} scanned, {} deleted, {} in flight, {} failed",
            report.workspaces.scanned,
            report.workspaces.deleted,
            report.workspaces.skipped_in_flight,
            report.workspaces.failed
        );
    }
    Ok(())
}
