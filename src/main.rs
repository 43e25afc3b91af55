//! Xymon remote monitor
//!
//! Checks remote hosts by ping, HTTP(S) and SMTP and reports their status to
//! a Xymon server. Each invocation performs a single pass over all monitors.

mod config;
mod logging;
mod monitor;
mod probe;
mod report;
mod scheduler;
mod status;

use clap::Parser;
use config::{AgentConfig, Cli};
use scheduler::{Collaborators, Controller};
use status::Status;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    let cfg = AgentConfig::load(&cli);
    logging::init(cfg.log_level, cfg.log_file.as_deref())?;
    for warning in &cfg.warnings {
        tracing::warn!("{}", warning);
    }

    if let Err(e) = cfg.validate() {
        tracing::error!("{}", e);
        std::process::exit(1);
    }

    let monitors = monitor::load_monitors(&cfg.host_dir)?;
    let controller = Controller::new(monitors, Collaborators::from_config(&cfg)?, cfg.dry_run);
    tracing::debug!(
        "{} monitors defined in {}",
        controller.monitor_count(),
        cfg.host_dir.display()
    );

    let outcomes = controller.run().await;

    let checks: u64 = outcomes.iter().map(|o| o.tally.total()).sum();
    let red = outcomes.iter().filter(|o| o.status == Status::Red).count();
    tracing::info!(
        "Ran {} checks on {} monitors against {}:{} ({} red, dry run: {})",
        checks,
        outcomes.len(),
        cfg.server,
        cfg.port,
        red,
        cfg.dry_run
    );

    Ok(())
}
