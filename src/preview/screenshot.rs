use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{CommandSpec, PipelineSection};
use crate::errors::{OrchestratorError, OrchestratorResult};

use super::steps::CommandRunner;

/// Public path under which captured screenshots are served.
pub const SCREENSHOT_ROUTE: &str = "/screenshots";

/// Substitute `{url}` and `{output}` in the configured screenshot command.
pub fn screenshot_command(template: &CommandSpec, url: &str, output: &Path) -> CommandSpec {
    let output = output.display().to_string();
    CommandSpec {
        program: template.program.clone(),
        args: template
            .args
            .iter()
            .map(|a| a.replace("{url}", url).replace("{output}", &output))
            .collect(),
        timeout_secs: template.timeout_secs,
    }
}

/// Wait for the deployment to settle, then capture `url` into
/// `<screenshots_dir>/<generation id>.png`. Returns the public screenshot URL.
pub async fn capture(
    runner: &dyn CommandRunner,
    config: &PipelineSection,
    workspace: &Path,
    generation_id: &str,
    url: &str,
) -> OrchestratorResult<String> {
    let failed = |message: String| OrchestratorError::ScreenshotFailed {
        url: url.to_string(),
        message,
    };

    tokio::time::sleep(Duration::from_secs(config.settle_secs)).await;

    tokio::fs::create_dir_all(&config.screenshots_dir)
        .await
        .map_err(|e| failed(format!("cannot create {}: {}", config.screenshots_dir.display(), e)))?;
    let file_name = format!("{}.png", generation_id);
    let output: PathBuf = std::path::absolute(config.screenshots_dir.join(&file_name))
        .map_err(|e| failed(e.to_string()))?;

    let cmd = screenshot_command(&config.screenshot, url, &output);
    let result = runner
        .run(workspace, &cmd)
        .await
        .map_err(|e| failed(format!("{:#}", e)))?;
    if !result.success {
        return Err(failed(result.failure_message(config.max_error_chars)));
    }
    Ok(format!("{}/{}", SCREENSHOT_ROUTE, file_name))
}
