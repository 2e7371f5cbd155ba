//! Database bootstrap command: `watchman init`.

use std::path::PathBuf;

use anyhow::Result;
use watchman::config::WatchmanConfig;

pub fn cmd_init(config: &WatchmanConfig, db_path: Option<PathBuf>) -> Result<()> {
    let db_path = db_path.unwrap_or_else(|| config.server.db_path.clone());
    watchman::scan::server::open_database(&db_path)?;
    println!("Scan database initialized at {}", db_path.display());
    Ok(())
}
