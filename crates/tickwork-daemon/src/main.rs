use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tracing::{info, warn};

use tickwork_core::TickworkConfig;
use tickwork_scheduler::{Job, Scheduler, TracingSink};

mod command;
mod events;
mod jobs;

/// Run shell commands on interval, daily and cron schedules.
#[derive(Debug, Parser)]
#[command(name = "tickwork", version)]
struct Args {
    /// Config file (default: ~/.tickwork/tickwork.toml).
    #[arg(short, long, env = "TICKWORK_CONFIG")]
    config: Option<String>,

    /// Validate the config, print upcoming fire times and exit.
    #[arg(long)]
    check: bool,

    /// Fire times printed per job by --check.
    #[arg(long, default_value_t = 3)]
    upcoming: usize,

    /// Print every job state change to stdout as a JSON line.
    #[arg(long)]
    events: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr so --events output stays machine-readable.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tickwork=info".into()),
        )
        .init();

    let config = TickworkConfig::load(args.config.as_deref()).context("failed to load config")?;
    let jobs = jobs::build_jobs(&config).context("invalid job definition")?;

    if args.check {
        print_upcoming(&jobs, args.upcoming);
        return Ok(());
    }
    if jobs.is_empty() {
        warn!("no jobs configured, nothing to do");
        return Ok(());
    }

    let builder = Scheduler::builder().config(config.engine.clone());
    let scheduler = if args.events {
        builder.sink(events::EventPrinter::new(&jobs)).build()
    } else {
        builder.sink(TracingSink).build()
    };

    let ids = scheduler.schedule_all(jobs);
    info!(jobs = ids.len(), "tickwork started");

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "failed to listen for ctrl-c, shutting down");
            }
            info!("shutdown requested, cancelling jobs");
            scheduler.cancel_all().await;
        }
        _ = scheduler.wait_until_idle() => {
            info!("every job has finished");
        }
    }

    scheduler.wait_until_idle().await;
    info!("tickwork stopped");
    Ok(())
}

fn print_upcoming(jobs: &[Job], count: usize) {
    let now = Utc::now();
    for job in jobs {
        println!("{} ({})", job.label(), job.schedule().kind());
        match jobs::upcoming(job.schedule(), now, count) {
            Ok(instants) => {
                for at in instants {
                    match jobs::schedule_timezone(job.schedule()) {
                        Some(tz) => println!("  {}  [{}]", at.to_rfc3339(), at.with_timezone(&tz)),
                        None => println!("  {}", at.to_rfc3339()),
                    }
                }
            }
            Err(e) => println!("  {e}"),
        }
    }
}
