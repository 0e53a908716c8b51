use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of one app-generation attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Pending,
    Generating,
    /// A preview pipeline currently owns the workspace.
    Deploying,
    Complete,
    Failed,
}

impl GenerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Generating => "generating",
            Self::Deploying => "deploying",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    /// Terminal generations are the only ones whose workspace may be deleted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl std::fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GenerationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "generating" => Ok(Self::Generating),
            "deploying" => Ok(Self::Deploying),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid generation status: {}", s)),
        }
    }
}

/// Which TTL policy a preview deployment gets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentKind {
    /// Time-limited preview created before publishing.
    Draft,
    /// Non-expiring preview attached to a published listing.
    Store,
}

impl DeploymentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Store => "store",
        }
    }

    /// Expiration for a preview deployed at `now`. Store previews never expire.
    pub fn expires_at(&self, now: DateTime<Utc>, draft_ttl_days: i64) -> Option<DateTime<Utc>> {
        match self {
            Self::Draft => Some(now + chrono::Duration::days(draft_ttl_days)),
            Self::Store => None,
        }
    }
}

impl FromStr for DeploymentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "store" => Ok(Self::Store),
            _ => Err(format!("Invalid deployment kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRecord {
    pub id: String,
    pub status: GenerationStatus,
    pub workspace_path: Option<String>,
    pub archive_url: Option<String>,
    pub preview_instance_id: Option<String>,
    pub preview_url: Option<String>,
    pub preview_expires_at: Option<DateTime<Utc>>,
    pub screenshot_url: Option<String>,
    pub linked_app_id: Option<i64>,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl GenerationRecord {
    pub fn has_preview(&self) -> bool {
        self.preview_instance_id.is_some()
    }

    pub fn preview_expired(&self, now: DateTime<Utc>) -> bool {
        self.has_preview() && self.preview_expires_at.is_some_and(|at| at <= now)
    }
}

/// The preview triple plus screenshot written back on a successful deploy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewResult {
    pub instance_id: String,
    pub url: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub screenshot_url: Option<String>,
}

/// Cached preview fields of a marketplace listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    pub id: i64,
    pub name: String,
    pub is_draft: bool,
    pub preview_url: Option<String>,
    pub screenshot_url: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProductionStatus {
    Preview,
    Active,
    Stopped,
}

impl ProductionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preview => "preview",
            Self::Active => "active",
            Self::Stopped => "stopped",
        }
    }
}

impl FromStr for ProductionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "preview" => Ok(Self::Preview),
            "active" => Ok(Self::Active),
            "stopped" => Ok(Self::Stopped),
            _ => Err(format!("Invalid production status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductionDeployment {
    pub id: i64,
    pub generation_id: String,
    pub instance_name: Option<String>,
    pub url: Option<String>,
    pub status: ProductionStatus,
    pub created_at: String,
    pub updated_at: String,
}

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStage {
    ResolveSource,
    PatchManifest,
    InstallDependencies,
    SchemaSetup,
    SeedData,
    ProvisionCompute,
    Deploy,
    CaptureVerification,
    PersistResult,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResolveSource => "resolve_source",
            Self::PatchManifest => "patch_manifest",
            Self::InstallDependencies => "install_dependencies",
            Self::SchemaSetup => "schema_setup",
            Self::SeedData => "seed_data",
            Self::ProvisionCompute => "provision_compute",
            Self::Deploy => "deploy",
            Self::CaptureVerification => "capture_verification",
            Self::PersistResult => "persist_result",
        }
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Member of the team roster injected on promotion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamMember {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_member_role")]
    pub role: String,
}

fn default_member_role() -> String {
    "member".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            GenerationStatus::Pending,
            GenerationStatus::Generating,
            GenerationStatus::Deploying,
            GenerationStatus::Complete,
            GenerationStatus::Failed,
        ] {
            assert_eq!(GenerationStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(GenerationStatus::from_str("bogus").is_err());
    }

    #[test]
    fn test_only_complete_and_failed_are_terminal() {
        assert!(GenerationStatus::Complete.is_terminal());
        assert!(GenerationStatus::Failed.is_terminal());
        assert!(!GenerationStatus::Pending.is_terminal());
        assert!(!GenerationStatus::Generating.is_terminal());
        assert!(!GenerationStatus::Deploying.is_terminal());
    }

    #[test]
    fn test_draft_expires_after_ttl_store_never() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let draft = DeploymentKind::Draft.expires_at(now, 7).unwrap();
        assert_eq!(draft, Utc.with_ymd_and_hms(2026, 1, 8, 12, 0, 0).unwrap());
        assert!(DeploymentKind::Store.expires_at(now, 7).is_none());
    }

    #[test]
    fn test_kind_deserializes_lowercase() {
        let kind: DeploymentKind = serde_json::from_str("\"draft\"").unwrap();
        assert_eq!(kind, DeploymentKind::Draft);
        assert!(serde_json::from_str::<DeploymentKind>("\"Draft\"").is_err());
    }

    #[test]
    fn test_preview_expired() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut record = GenerationRecord {
            id: "g1".into(),
            status: GenerationStatus::Complete,
            workspace_path: None,
            archive_url: None,
            preview_instance_id: Some("preview-g1".into()),
            preview_url: Some("https://preview-g1.example".into()),
            preview_expires_at: Some(now - chrono::Duration::hours(1)),
            screenshot_url: None,
            linked_app_id: None,
            error: None,
            created_at: String::new(),
            updated_at: String::new(),
        };
        assert!(record.preview_expired(now));
        record.preview_expires_at = None;
        assert!(!record.preview_expired(now));
        record.preview_expires_at = Some(now - chrono::Duration::hours(1));
        record.preview_instance_id = None;
        assert!(!record.preview_expired(now));
    }

    #[test]
    fn test_team_member_role_defaults() {
        let member: TeamMember = serde_json::from_str(r#"{"email":"a@b.c"}"#).unwrap();
        assert_eq!(member.role, "member");
        assert!(member.name.is_none());
    }
}
