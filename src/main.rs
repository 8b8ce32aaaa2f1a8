use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use screening_watchbot::config;
use screening_watchbot::lock::RunLock;
use screening_watchbot::notify::{DiscordWebhook, Notifier};
use screening_watchbot::pipeline::Pipeline;
use screening_watchbot::render::chrome::ChromeDriver;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Run the full cycle but never send a notification
    #[arg(long)]
    dry_run: bool,

    /// Print an example configuration and exit
    #[arg(long)]
    print_example_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if args.print_example_config {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    cfg.ensure_dirs()?;

    let _lock = RunLock::acquire(cfg.lock_path(), cfg.cycle_timeout() * 2)?;

    let notifier: Option<Box<dyn Notifier>> = match (args.dry_run, cfg.webhook_url()) {
        (true, _) => {
            info!("dry run; notifications disabled");
            None
        }
        (false, Some(url)) => Some(Box::new(DiscordWebhook::new(&url)?)),
        (false, None) => {
            warn!(
                "no webhook configured (set {} or notify.discord_webhook_url)",
                config::WEBHOOK_ENV
            );
            None
        }
    };

    let pipeline = Pipeline::from_config(&cfg, Arc::new(ChromeDriver))?;
    let outcome = pipeline.run_and_notify(notifier.as_deref()).await?;

    info!(
        changed = outcome.change.changed,
        title = %outcome.record.title,
        attempts = outcome.attempts,
        consent_dismissed = outcome.consent.dismissed,
        "run complete"
    );
    Ok(())
}
