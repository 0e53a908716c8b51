//! Database initialization command: `launchpad init-db`.

use std::path::PathBuf;

use anyhow::Result;

use launchpad::config::AppConfig;

pub fn cmd_init_db(config: &AppConfig, db_path: Option<PathBuf>) -> Result<()> {
    let mut config = config.clone();
    if let Some(path) = db_path {
        config.server.db_path = path;
    }
    launchpad::preview::server::open_db(&config)?;
    println!("Database initialized at {}", config.server.db_path.display());
    Ok(())
}
