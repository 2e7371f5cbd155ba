//! Configuration view: `watchman config`.

use anyhow::Result;
use watchman::config::WatchmanConfig;

pub fn cmd_config(config: &WatchmanConfig) -> Result<()> {
    println!("{}", config.render_redacted()?);

    let warnings = config.validate();
    if !warnings.is_empty() {
        println!("Warnings:");
        for warning in warnings {
            println!("  - {}", warning);
        }
    }
    Ok(())
}
