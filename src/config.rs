//! Unified configuration for launchpad.
//!
//! Configuration is layered: `launchpad.toml` (or `--config <path>`) →
//! environment variables (a `.env` file is loaded first) → CLI flags. Every
//! field has a default, so an absent file yields a working local setup.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! port = 8787
//! local_preview = true
//!
//! [workspace]
//! root = "/var/lib/launchpad/workspaces"
//!
//! [pipeline.install]
//! program = "pnpm"
//! args = ["install"]
//! timeout_secs = 300
//!
//! [compute]
//! base_url = "https://api.machines.dev"
//! org = "acme"
//! deploy_wait_secs = 600
//!
//! [gc]
//! interval_secs = 3600
//! workspace_retention_secs = 86400
//!
//! [local_preview]
//! port = 3000
//! start_command = ["npm", "run", "dev"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default file name looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "launchpad.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub workspace: WorkspaceSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub compute: ComputeSection,
    #[serde(default)]
    pub gc: GcSection,
    #[serde(default)]
    pub local_preview: LocalPreviewSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Enables the catch-all preview proxy and the local preview routes.
    #[serde(default)]
    pub local_preview: bool,
    #[serde(default)]
    pub cors: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8787
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".launchpad/launchpad.db")
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
            local_preview: false,
            cors: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceSection {
    #[serde(default = "default_workspace_root")]
    pub root: PathBuf,
    #[serde(default = "default_templates_root")]
    pub templates_root: PathBuf,
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from(".launchpad/workspaces")
}

fn default_templates_root() -> PathBuf {
    PathBuf::from(".launchpad/templates")
}

fn default_download_timeout() -> u64 {
    120
}

impl Default for WorkspaceSection {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
            templates_root: default_templates_root(),
            download_timeout_secs: default_download_timeout(),
        }
    }
}

/// One external command the pipeline runs inside a workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl CommandSpec {
    pub fn new(program: &str, args: &[&str], timeout_secs: u64) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            timeout_secs,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_install")]
    pub install: CommandSpec,
    #[serde(default = "default_schema_format")]
    pub schema_format: CommandSpec,
    #[serde(default = "default_schema_generate")]
    pub schema_generate: CommandSpec,
    #[serde(default = "default_schema_push")]
    pub schema_push: CommandSpec,
    /// Seed script path, relative to the workspace. Seeding is skipped when absent.
    #[serde(default = "default_seed_script")]
    pub seed_script: PathBuf,
    #[serde(default = "default_seed")]
    pub seed: CommandSpec,
    /// Schema manifest patched with build targets before install.
    #[serde(default = "default_manifest")]
    pub manifest: PathBuf,
    #[serde(default = "default_binary_targets")]
    pub binary_targets: Vec<String>,
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,
    /// `{url}` and `{output}` are substituted in the arguments.
    #[serde(default = "default_screenshot")]
    pub screenshot: CommandSpec,
    #[serde(default = "default_screenshots_dir")]
    pub screenshots_dir: PathBuf,
    #[serde(default = "default_max_error_chars")]
    pub max_error_chars: usize,
    #[serde(default = "default_draft_ttl_days")]
    pub draft_ttl_days: i64,
}

fn default_install() -> CommandSpec {
    CommandSpec::new("npm", &["install"], 300)
}

fn default_schema_format() -> CommandSpec {
    CommandSpec::new("npx", &["prisma", "format"], 60)
}

fn default_schema_generate() -> CommandSpec {
    CommandSpec::new("npx", &["prisma", "generate"], 60)
}

fn default_schema_push() -> CommandSpec {
    CommandSpec::new(
        "npx",
        &["prisma", "db", "push", "--force-reset", "--skip-generate"],
        60,
    )
}

fn default_seed_script() -> PathBuf {
    PathBuf::from("prisma/seed.ts")
}

fn default_seed() -> CommandSpec {
    CommandSpec::new("npx", &["tsx", "prisma/seed.ts"], 30)
}

fn default_manifest() -> PathBuf {
    PathBuf::from("prisma/schema.prisma")
}

fn default_binary_targets() -> Vec<String> {
    vec!["native".to_string(), "debian-openssl-3.0.x".to_string()]
}

fn default_settle_secs() -> u64 {
    10
}

fn default_screenshot() -> CommandSpec {
    CommandSpec::new(
        "npx",
        &["playwright", "screenshot", "--full-page", "{url}", "{output}"],
        60,
    )
}

fn default_screenshots_dir() -> PathBuf {
    PathBuf::from(".launchpad/screenshots")
}

fn default_max_error_chars() -> usize {
    crate::errors::DEFAULT_MAX_ERROR_CHARS
}

fn default_draft_ttl_days() -> i64 {
    7
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            install: default_install(),
            schema_format: default_schema_format(),
            schema_generate: default_schema_generate(),
            schema_push: default_schema_push(),
            seed_script: default_seed_script(),
            seed: default_seed(),
            manifest: default_manifest(),
            binary_targets: default_binary_targets(),
            settle_secs: default_settle_secs(),
            screenshot: default_screenshot(),
            screenshots_dir: default_screenshots_dir(),
            max_error_chars: default_max_error_chars(),
            draft_ttl_days: default_draft_ttl_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeSection {
    #[serde(default = "default_compute_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_org")]
    pub org: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_instance_prefix")]
    pub instance_prefix: String,
    #[serde(default = "default_deploy_wait")]
    pub deploy_wait_secs: u64,
    #[serde(default = "default_volume_size")]
    pub volume_size_gb: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_upload_excludes")]
    pub upload_excludes: Vec<String>,
}

fn default_compute_url() -> String {
    "https://api.machines.dev".to_string()
}

fn default_org() -> String {
    "personal".to_string()
}

fn default_region() -> String {
    "iad".to_string()
}

fn default_instance_prefix() -> String {
    "preview".to_string()
}

fn default_deploy_wait() -> u64 {
    600
}

fn default_volume_size() -> u32 {
    1
}

fn default_request_timeout() -> u64 {
    30
}

fn default_upload_excludes() -> Vec<String> {
    vec![".git".to_string(), "node_modules".to_string()]
}

impl Default for ComputeSection {
    fn default() -> Self {
        Self {
            base_url: default_compute_url(),
            api_token: None,
            org: default_org(),
            region: default_region(),
            instance_prefix: default_instance_prefix(),
            deploy_wait_secs: default_deploy_wait(),
            volume_size_gb: default_volume_size(),
            request_timeout_secs: default_request_timeout(),
            upload_excludes: default_upload_excludes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcSection {
    #[serde(default = "default_gc_enabled")]
    pub enabled: bool,
    #[serde(default = "default_gc_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_workspace_retention")]
    pub workspace_retention_secs: u64,
}

fn default_gc_enabled() -> bool {
    true
}

fn default_gc_interval() -> u64 {
    3600
}

fn default_workspace_retention() -> u64 {
    24 * 3600
}

impl Default for GcSection {
    fn default() -> Self {
        Self {
            enabled: default_gc_enabled(),
            interval_secs: default_gc_interval(),
            workspace_retention_secs: default_workspace_retention(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalPreviewSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_preview_port")]
    pub port: u16,
    #[serde(default = "default_start_command")]
    pub start_command: Vec<String>,
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,
}

fn default_preview_port() -> u16 {
    3000
}

fn default_start_command() -> Vec<String> {
    vec!["npm".to_string(), "run".to_string(), "dev".to_string()]
}

fn default_start_timeout() -> u64 {
    120
}

fn default_health_path() -> String {
    "/".to_string()
}

fn default_probe_interval() -> u64 {
    500
}

impl Default for LocalPreviewSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_preview_port(),
            start_command: default_start_command(),
            start_timeout_secs: default_start_timeout(),
            health_path: default_health_path(),
            probe_interval_ms: default_probe_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Directory for a daily rolling log file, in addition to stderr.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            directory: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from an explicit path, or from `launchpad.toml` in
    /// `base_dir`, falling back to the user config directory. Returns defaults
    /// when no file exists. Environment overrides are applied afterwards.
    pub fn load(explicit: Option<&Path>, base_dir: &Path) -> Result<Self> {
        let path = match explicit {
            Some(p) => Some(p.to_path_buf()),
            None => Self::discover(base_dir),
        };

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn discover(base_dir: &Path) -> Option<PathBuf> {
        let local = base_dir.join(CONFIG_FILE_NAME);
        if local.exists() {
            return Some(local);
        }
        dirs::config_dir()
            .map(|d| d.join("launchpad").join(CONFIG_FILE_NAME))
            .filter(|p| p.exists())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply `LAUNCHPAD_*` overrides. The lookup is injected so tests do not
    /// have to mutate the process environment.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("LAUNCHPAD_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(path) = lookup("LAUNCHPAD_DB_PATH") {
            self.server.db_path = PathBuf::from(path);
        }
        if let Some(root) = lookup("LAUNCHPAD_WORKSPACE_ROOT") {
            self.workspace.root = PathBuf::from(root);
        }
        if let Some(url) = lookup("LAUNCHPAD_COMPUTE_URL") {
            self.compute.base_url = url;
        }
        if let Some(token) = lookup("LAUNCHPAD_COMPUTE_TOKEN") {
            self.compute.api_token = Some(token);
        }
        if let Some(org) = lookup("LAUNCHPAD_COMPUTE_ORG") {
            self.compute.org = org;
        }
        if let Some(flag) = lookup("LAUNCHPAD_LOCAL_PREVIEW") {
            self.server.local_preview = matches!(flag.as_str(), "1" | "true" | "yes");
        }
    }

    /// Render the resolved configuration as TOML with secrets redacted.
    pub fn to_redacted_toml(&self) -> Result<String> {
        let mut copy = self.clone();
        if copy.compute.api_token.is_some() {
            copy.compute.api_token = Some("<redacted>".to_string());
        }
        toml::to_string_pretty(&copy).context("Failed to serialize configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8787);
        assert!(!config.server.local_preview);
        assert_eq!(config.pipeline.install.timeout_secs, 300);
        assert_eq!(config.pipeline.schema_push.timeout_secs, 60);
        assert_eq!(config.pipeline.seed.timeout_secs, 30);
        assert_eq!(config.pipeline.draft_ttl_days, 7);
        assert_eq!(config.gc.interval_secs, 3600);
        assert_eq!(config.gc.workspace_retention_secs, 86400);
        assert_eq!(config.local_preview.start_timeout_secs, 120);
        assert_eq!(config.compute.instance_prefix, "preview");
    }

    #[test]
    fn test_parse_partial_file() {
        let config = AppConfig::parse(
            r#"
[server]
port = 9000
local_preview = true

[pipeline.install]
program = "pnpm"
args = ["install", "--frozen-lockfile"]
timeout_secs = 420

[gc]
workspace_retention_secs = 60
"#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert!(config.server.local_preview);
        assert_eq!(config.pipeline.install.program, "pnpm");
        assert_eq!(config.pipeline.install.args, vec!["install", "--frozen-lockfile"]);
        assert_eq!(config.pipeline.install.timeout(), Duration::from_secs(420));
        // untouched sections keep defaults
        assert_eq!(config.pipeline.schema_format, default_schema_format());
        assert_eq!(config.gc.interval_secs, 3600);
        assert_eq!(config.gc.workspace_retention_secs, 60);
    }

    #[test]
    fn test_parse_invalid_toml() {
        assert!(AppConfig::parse("not valid toml {{{{").is_err());
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::from_file(&dir.path().join("nope.toml"));
        assert!(config.is_err());

        let explicit = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&explicit, "[server]\nport = 1234\n").unwrap();
        let config = AppConfig::load(Some(&explicit), dir.path()).unwrap();
        assert_eq!(config.server.port, 1234);
    }

    #[test]
    fn test_discovers_local_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "[compute]\norg = \"acme\"\n",
        )
        .unwrap();
        let config = AppConfig::load(None, dir.path()).unwrap();
        assert_eq!(config.compute.org, "acme");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("LAUNCHPAD_PORT", "9999"),
            ("LAUNCHPAD_WORKSPACE_ROOT", "/srv/ws"),
            ("LAUNCHPAD_COMPUTE_TOKEN", "tok"),
            ("LAUNCHPAD_LOCAL_PREVIEW", "true"),
        ]
        .into_iter()
        .collect();
        let mut config = AppConfig::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.workspace.root, PathBuf::from("/srv/ws"));
        assert_eq!(config.compute.api_token.as_deref(), Some("tok"));
        assert!(config.server.local_preview);
    }

    #[test]
    fn test_env_override_ignores_bad_port() {
        let mut config = AppConfig::default();
        config.apply_env(|k| (k == "LAUNCHPAD_PORT").then(|| "not-a-port".to_string()));
        assert_eq!(config.server.port, 8787);
    }

    #[test]
    fn test_redacted_toml_hides_token() {
        let mut config = AppConfig::default();
        config.compute.api_token = Some("super-secret".to_string());
        let rendered = config.to_redacted_toml().unwrap();
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("<redacted>"));
        let reparsed = AppConfig::parse(&rendered).unwrap();
        assert_eq!(reparsed.server.port, 8787);
    }
}
