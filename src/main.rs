use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "watchman")]
#[command(version, about = "Push-triggered security scan orchestrator")]
pub struct Cli {
    /// Path to watchman.toml (defaults to ./watchman.toml when present)
    #[arg(long, global = true, env = "WATCHMAN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "pretty")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the webhook server and scan workers
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Interface to bind
        #[arg(long)]
        host: Option<String>,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (permissive CORS, bind on all interfaces)
        #[arg(long)]
        dev: bool,
    },
    /// Create or migrate the scan database
    Init {
        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Print the resolved configuration with secrets redacted
    Config,
}

fn init_tracing(format: LogFormat) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("watchman=info,tower_http=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = watchman::config::WatchmanConfig::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve {
            port,
            host,
            db_path,
            dev,
        } => {
            cmd::cmd_serve(config, port, host, db_path, dev).await?;
        }
        Commands::Init { db_path } => cmd::cmd_init(&config, db_path)?,
        Commands::Config => cmd::cmd_config(&config)?,
    }

    Ok(())
}
