//! Control service command: `launchpad serve`.

use anyhow::Result;

use launchpad::config::AppConfig;

pub async fn cmd_serve(mut config: AppConfig, port: Option<u16>, local_preview: bool) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    if local_preview {
        config.server.local_preview = true;
    }
    launchpad::preview::server::start_server(config).await
}
