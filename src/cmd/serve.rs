//! Webhook server command: `watchman serve`.

use std::path::PathBuf;

use anyhow::Result;
use watchman::config::WatchmanConfig;

pub async fn cmd_serve(
    mut config: WatchmanConfig,
    port: Option<u16>,
    host: Option<String>,
    db_path: Option<PathBuf>,
    dev: bool,
) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(db_path) = db_path {
        config.server.db_path = db_path;
    }
    if dev {
        config.server.dev_mode = true;
    }

    watchman::scan::server::start_server(config).await
}
