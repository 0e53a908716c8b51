//! Configuration commands: `launchpad config`.

use std::path::Path;

use anyhow::{Context, Result};

use super::super::ConfigCommands;
use launchpad::config::{AppConfig, CONFIG_FILE_NAME};

pub fn cmd_config(cwd: &Path, config: &AppConfig, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            print!("{}", config.to_redacted_toml()?);
        }
        Some(ConfigCommands::Init { force }) => {
            let path = cwd.join(CONFIG_FILE_NAME);
            if path.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            let content = toml::to_string_pretty(&AppConfig::default())
                .context("Failed to serialize default configuration")?;
            std::fs::write(&path, content)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote default configuration to {}", path.display());
        }
    }
    Ok(())
}
