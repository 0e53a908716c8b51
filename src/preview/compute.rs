//! Client for the compute platform's HTTP control API.
//!
//! Every operation has its own request/response struct so the wire shape is
//! checked at compile time. `ComputePlatform` is the seam the pipeline, the
//! garbage collector and the promotion controller depend on.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::models::DeploymentKind;
use super::workspace::pack_tarball;
use crate::config::ComputeSection;
use crate::errors::{OrchestratorError, OrchestratorResult, truncate_tail};

/// Instance names double as DNS labels.
const MAX_INSTANCE_NAME: usize = 63;

/// Stable instance name for a generation: `<prefix>-<id>`, lowercased, with
/// anything outside `[a-z0-9-]` mapped to `-`.
pub fn instance_name(prefix: &str, generation_id: &str) -> String {
    let raw = format!("{}-{}", prefix, generation_id).to_lowercase();
    let mut name: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .take(MAX_INSTANCE_NAME)
        .collect();
    while name.ends_with('-') {
        name.pop();
    }
    name
}

/// Environment changes applied to one instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecretChanges {
    #[serde(default)]
    pub set: BTreeMap<String, String>,
    #[serde(default)]
    pub unset: Vec<String>,
}

impl SecretChanges {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSummary {
    pub name: String,
    pub status: String,
    pub hostname: Option<String>,
    pub current_release: Option<String>,
}

/// Abstraction over the remote compute platform for testability.
/// Real implementation: `HttpComputeClient`.
#[async_trait]
pub trait ComputePlatform: Send + Sync {
    /// Create (or reuse) the app shell and volume for a generation.
    async fn provision(&self, generation_id: &str, kind: DeploymentKind)
    -> OrchestratorResult<String>;

    /// Ship `workspace` to `instance` and wait until the release is live.
    async fn deploy(&self, instance: &str, workspace: &Path) -> OrchestratorResult<String>;

    /// May restart the instance.
    async fn set_secrets(&self, instance: &str, changes: &SecretChanges) -> OrchestratorResult<()>;

    async fn list_instances(&self) -> OrchestratorResult<Vec<InstanceSummary>>;

    /// Idempotent: destroying an unknown instance succeeds.
    async fn destroy(&self, instance: &str) -> OrchestratorResult<()>;
}

// ── Wire types ────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct CreateAppRequest<'a> {
    app_name: &'a str,
    org_slug: &'a str,
    region: &'a str,
    volume: VolumeSpec,
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct VolumeSpec {
    name: String,
    size_gb: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ReleaseStatus {
    Live,
    Failed,
    Timeout,
}

#[derive(Debug, Deserialize)]
struct DeployResponse {
    #[serde(default)]
    release_id: Option<String>,
    status: ReleaseStatus,
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListInstancesResponse {
    instances: Vec<InstanceWire>,
}

#[derive(Debug, Deserialize)]
struct InstanceWire {
    name: String,
    status: String,
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    current_release: Option<String>,
}

impl From<InstanceWire> for InstanceSummary {
    fn from(w: InstanceWire) -> Self {
        Self {
            name: w.name,
            status: w.status,
            hostname: w.hostname,
            current_release: w.current_release,
        }
    }
}

// ── HTTP client ───────────────────────────────────────────────────────

pub struct HttpComputeClient {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
    org: String,
    region: String,
    instance_prefix: String,
    deploy_wait_secs: u64,
    volume_size_gb: u32,
    request_timeout: Duration,
    upload_excludes: Vec<String>,
    max_error_chars: usize,
}

impl HttpComputeClient {
    pub fn new(config: &ComputeSection, max_error_chars: usize) -> anyhow::Result<Self> {
        let request_timeout = Duration::from_secs(config.request_timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to build compute HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            org: config.org.clone(),
            region: config.region.clone(),
            instance_prefix: config.instance_prefix.clone(),
            deploy_wait_secs: config.deploy_wait_secs,
            volume_size_gb: config.volume_size_gb,
            request_timeout,
            upload_excludes: config.upload_excludes.clone(),
            max_error_chars,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, format!("{}{}", self.base_url, path));
        match &self.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Upstream error body, truncated for storage and logs.
    async fn error_text(&self, resp: reqwest::Response) -> String {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        format!("HTTP {}: {}", status, truncate_tail(&body, self.max_error_chars))
    }
}

#[async_trait]
impl ComputePlatform for HttpComputeClient {
    async fn provision(
        &self,
        generation_id: &str,
        kind: DeploymentKind,
    ) -> OrchestratorResult<String> {
        let name = instance_name(&self.instance_prefix, generation_id);
        let body = CreateAppRequest {
            app_name: &name,
            org_slug: &self.org,
            region: &self.region,
            volume: VolumeSpec {
                name: format!("{}_data", name.replace('-', "_")),
                size_gb: self.volume_size_gb,
            },
            kind: kind.as_str(),
        };

        let provision_failed = |message: String| OrchestratorError::ProvisionFailed {
            instance: name.clone(),
            message,
        };
        let resp = self
            .request(reqwest::Method::POST, "/v1/apps")
            .json(&body)
            .send()
            .await
            .map_err(|e| provision_failed(e.to_string()))?;

        match resp.status() {
            s if s.is_success() => {
                info!(instance = %name, "Provisioned compute instance");
            }
            StatusCode::CONFLICT => {
                debug!(instance = %name, "Compute instance already exists, reusing");
            }
            _ => return Err(provision_failed(self.error_text(resp).await)),
        }
        Ok(name)
    }

    async fn deploy(&self, instance: &str, workspace: &Path) -> OrchestratorResult<String> {
        let deploy_failed = |message: String| OrchestratorError::DeployFailed {
            instance: instance.to_string(),
            message,
        };

        let dir = workspace.to_path_buf();
        let excludes = self.upload_excludes.clone();
        let tarball = tokio::task::spawn_blocking(move || pack_tarball(&dir, &excludes))
            .await
            .context("Packaging task panicked")?
            .map_err(|e| deploy_failed(format!("packaging failed: {:#}", e)))?;
        debug!(instance, bytes = tarball.len(), "Uploading workspace");

        let wait = self.deploy_wait_secs;
        let resp = self
            .request(reqwest::Method::POST, &format!("/v1/apps/{}/deploy", instance))
            .query(&[("wait_timeout", wait)])
            .header(reqwest::header::CONTENT_TYPE, "application/gzip")
            .timeout(Duration::from_secs(wait) + self.request_timeout)
            .body(tarball)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    OrchestratorError::DeployTimeout {
                        instance: instance.to_string(),
                        wait_secs: wait,
                    }
                } else {
                    deploy_failed(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            return Err(deploy_failed(self.error_text(resp).await));
        }
        let release: DeployResponse = resp
            .json()
            .await
            .map_err(|e| deploy_failed(format!("invalid deploy response: {}", e)))?;

        match release.status {
            ReleaseStatus::Live => {
                let hostname = release
                    .hostname
                    .ok_or_else(|| deploy_failed("release is live but has no hostname".into()))?;
                info!(
                    instance,
                    release = release.release_id.as_deref().unwrap_or("-"),
                    "Release is live"
                );
                Ok(format!("https://{}", hostname))
            }
            ReleaseStatus::Timeout => Err(OrchestratorError::DeployTimeout {
                instance: instance.to_string(),
                wait_secs: wait,
            }),
            ReleaseStatus::Failed => Err(deploy_failed(truncate_tail(
                release.error.as_deref().unwrap_or("release failed"),
                self.max_error_chars,
            ))),
        }
    }

    async fn set_secrets(&self, instance: &str, changes: &SecretChanges) -> OrchestratorResult<()> {
        let resp = self
            .request(reqwest::Method::POST, &format!("/v1/apps/{}/secrets", instance))
            .json(changes)
            .send()
            .await
            .map_err(|e| OrchestratorError::ComputeApi(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(OrchestratorError::ComputeApi(self.error_text(resp).await));
        }
        // Keys only; values never reach the log.
        info!(
            instance,
            set = ?changes.set.keys().collect::<Vec<_>>(),
            unset = ?changes.unset,
            "Applied secrets"
        );
        Ok(())
    }

    async fn list_instances(&self) -> OrchestratorResult<Vec<InstanceSummary>> {
        let resp = self
            .request(reqwest::Method::GET, "/v1/instances")
            .query(&[("org_slug", self.org.as_str())])
            .send()
            .await
            .map_err(|e| OrchestratorError::ComputeApi(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(OrchestratorError::ComputeApi(self.error_text(resp).await));
        }
        let list: ListInstancesResponse = resp
            .json()
            .await
            .map_err(|e| OrchestratorError::ComputeApi(format!("invalid instance list: {}", e)))?;
        Ok(list.instances.into_iter().map(Into::into).collect())
    }

    async fn destroy(&self, instance: &str) -> OrchestratorResult<()> {
        let resp = self
            .request(reqwest::Method::DELETE, &format!("/v1/apps/{}", instance))
            .send()
            .await
            .map_err(|e| OrchestratorError::ComputeApi(e.to_string()))?;
        match resp.status() {
            s if s.is_success() => {
                info!(instance, "Destroyed compute instance");
                Ok(())
            }
            StatusCode::NOT_FOUND => {
                debug!(instance, "Compute instance already gone");
                Ok(())
            }
            _ => Err(OrchestratorError::ComputeApi(self.error_text(resp).await)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{bearer_token, body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> HttpComputeClient {
        let config = ComputeSection {
            base_url: server.uri(),
            api_token: Some("test-token".into()),
            org: "acme".into(),
            deploy_wait_secs: 30,
            ..ComputeSection::default()
        };
        HttpComputeClient::new(&config, 50).unwrap()
    }

    fn workspace() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        dir
    }

    #[test]
    fn test_instance_name() {
        assert_eq!(instance_name("preview", "AbC_12"), "preview-abc-12");
        let long = instance_name("preview", &"x".repeat(80));
        assert_eq!(long.len(), 63);
        assert_eq!(instance_name("preview", "abc_"), "preview-abc");
    }

    #[tokio::test]
    async fn test_provision_creates_app() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/apps"))
            .and(bearer_token("test-token"))
            .and(body_json(json!({
                "app_name": "preview-gen-1",
                "org_slug": "acme",
                "region": "iad",
                "volume": {"name": "preview_gen_1_data", "size_gb": 1},
                "kind": "draft"
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let name = client(&server)
            .provision("gen-1", DeploymentKind::Draft)
            .await
            .unwrap();
        assert_eq!(name, "preview-gen-1");
    }

    #[tokio::test]
    async fn test_provision_reuses_existing_app() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/apps"))
            .respond_with(ResponseTemplate::new(409).set_body_string("app exists"))
            .mount(&server)
            .await;
        let name = client(&server)
            .provision("gen-1", DeploymentKind::Store)
            .await
            .unwrap();
        assert_eq!(name, "preview-gen-1");
    }

    #[tokio::test]
    async fn test_provision_failure_carries_truncated_body() {
        let server = MockServer::start().await;
        let body = format!("{}quota exceeded", "x".repeat(500));
        Mock::given(method("POST"))
            .and(path("/v1/apps"))
            .respond_with(ResponseTemplate::new(500).set_body_string(body))
            .mount(&server)
            .await;
        let err = client(&server)
            .provision("gen-1", DeploymentKind::Draft)
            .await
            .unwrap_err();
        match err {
            OrchestratorError::ProvisionFailed { instance, message } => {
                assert_eq!(instance, "preview-gen-1");
                assert!(message.ends_with("quota exceeded"));
                assert!(message.len() < 100);
            }
            other => panic!("Expected ProvisionFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_deploy_returns_https_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/apps/preview-gen-1/deploy"))
            .and(query_param("wait_timeout", "30"))
            .and(header("content-type", "application/gzip"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "release_id": "rel_1",
                "status": "live",
                "hostname": "preview-gen-1.example.dev"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let ws = workspace();
        let url = client(&server)
            .deploy("preview-gen-1", ws.path())
            .await
            .unwrap();
        assert_eq!(url, "https://preview-gen-1.example.dev");
    }

    #[tokio::test]
    async fn test_deploy_failed_release() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/apps/preview-gen-1/deploy"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "failed",
                "error": "health check failed on port 3000"
            })))
            .mount(&server)
            .await;
        let ws = workspace();
        let err = client(&server)
            .deploy("preview-gen-1", ws.path())
            .await
            .unwrap_err();
        match err {
            OrchestratorError::DeployFailed { message, .. } => {
                assert!(message.contains("health check failed"));
            }
            other => panic!("Expected DeployFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_deploy_platform_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/apps/preview-gen-1/deploy"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "timeout"})))
            .mount(&server)
            .await;
        let ws = workspace();
        let err = client(&server)
            .deploy("preview-gen-1", ws.path())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::DeployTimeout { wait_secs: 30, .. }
        ));
    }

    #[tokio::test]
    async fn test_set_secrets_sends_set_and_unset() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/apps/preview-gen-1/secrets"))
            .and(body_json(json!({
                "set": {"AUTH_SECRET": "s3cret"},
                "unset": ["PREVIEW_MODE"]
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut changes = SecretChanges::default();
        changes.set.insert("AUTH_SECRET".into(), "s3cret".into());
        changes.unset.push("PREVIEW_MODE".into());
        client(&server)
            .set_secrets("preview-gen-1", &changes)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_list_instances() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/instances"))
            .and(query_param("org_slug", "acme"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "instances": [
                    {"name": "preview-a", "status": "running", "hostname": "preview-a.example.dev", "current_release": "rel_9"},
                    {"name": "preview-b", "status": "stopped"}
                ]
            })))
            .mount(&server)
            .await;
        let instances = client(&server).list_instances().await.unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].current_release.as_deref(), Some("rel_9"));
        assert!(instances[1].hostname.is_none());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/apps/preview-gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v1/apps/preview-broken"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;
        let client = client(&server);
        client.destroy("preview-gone").await.unwrap();
        assert!(matches!(
            client.destroy("preview-broken").await,
            Err(OrchestratorError::ComputeApi(_))
        ));
    }
}
