//! In-place promotion of a running preview to production.
//!
//! Promotion changes only the instance's environment: a fresh auth secret,
//! the team roster, and preview mode switched off. The platform restarts the
//! instance to pick them up; no rebuild or redeploy happens.

use std::sync::Arc;

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::Serialize;
use tracing::info;

use super::compute::{ComputePlatform, SecretChanges};
use super::db::DbHandle;
use super::models::{ProductionStatus, TeamMember};
use crate::errors::{OrchestratorError, OrchestratorResult};

pub const AUTH_SECRET_LEN: usize = 48;
pub const AUTH_SECRET_KEY: &str = "AUTH_SECRET";
pub const TEAM_MEMBERS_KEY: &str = "TEAM_MEMBERS";
pub const PREVIEW_MODE_KEY: &str = "PREVIEW_MODE";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Promotion {
    pub generation_id: String,
    pub instance_name: String,
    pub url: Option<String>,
    pub production_deployment_id: i64,
}

pub fn generate_auth_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(AUTH_SECRET_LEN)
        .map(char::from)
        .collect()
}

/// Secret bundle applied on promotion. Never persisted.
pub fn promotion_secrets(team: &[TeamMember]) -> OrchestratorResult<SecretChanges> {
    let roster = serde_json::to_string(team)
        .map_err(|e| OrchestratorError::Other(anyhow::anyhow!("Failed to serialize team: {}", e)))?;
    let mut changes = SecretChanges::default();
    changes
        .set
        .insert(AUTH_SECRET_KEY.to_string(), generate_auth_secret());
    changes.set.insert(TEAM_MEMBERS_KEY.to_string(), roster);
    changes.unset.push(PREVIEW_MODE_KEY.to_string());
    Ok(changes)
}

pub struct PromotionController {
    db: DbHandle,
    compute: Arc<dyn ComputePlatform>,
}

impl PromotionController {
    pub fn new(db: DbHandle, compute: Arc<dyn ComputePlatform>) -> Self {
        Self { db, compute }
    }

    /// Promote the generation's running preview.
    pub async fn promote(
        &self,
        generation_id: &str,
        team: &[TeamMember],
    ) -> OrchestratorResult<Promotion> {
        let id = generation_id.to_string();
        let record = self
            .db
            .call(move |db| db.get_generation(&id))
            .await
            .map_err(OrchestratorError::Database)?
            .ok_or_else(|| OrchestratorError::GenerationNotFound {
                id: generation_id.to_string(),
            })?;

        let instance = record
            .preview_instance_id
            .clone()
            .ok_or_else(|| OrchestratorError::NoPreview {
                generation_id: generation_id.to_string(),
            })?;

        let changes = promotion_secrets(team)?;
        self.compute.set_secrets(&instance, &changes).await?;

        let id = generation_id.to_string();
        let stored_instance = instance.clone();
        let url = record.preview_url.clone();
        let deployment = self
            .db
            .call(move |db| {
                // Production instances are exempt from the expiration sweep.
                db.clear_preview_expiration(&id)?;
                let existing = db.production_deployment_for(&id)?;
                let deployment = match existing {
                    Some(dep) => {
                        db.activate_production_deployment(dep.id, &stored_instance, url.as_deref())?
                    }
                    None => db.create_production_deployment(
                        &id,
                        Some(stored_instance.as_str()),
                        url.as_deref(),
                        ProductionStatus::Active,
                    )?,
                };
                Ok(deployment)
            })
            .await
            .map_err(OrchestratorError::Database)?;

        info!(
            generation_id,
            instance = %instance,
            team_size = team.len(),
            "[{}] Promoted {} to production",
            generation_id,
            instance
        );
        Ok(Promotion {
            generation_id: generation_id.to_string(),
            instance_name: instance,
            url: deployment.url,
            production_deployment_id: deployment.id,
        })
    }

    /// Apply arbitrary secret changes to an instance.
    pub async fn set_secrets(&self, instance: &str, changes: &SecretChanges) -> OrchestratorResult<()> {
        if changes.is_empty() {
            return Ok(());
        }
        self.compute.set_secrets(instance, changes).await
    }
}
