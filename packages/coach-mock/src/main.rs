//! Mock upstream producer.
//!
//! Stands in for the positioning engine when no hardware is on the water:
//! publishes the two upstream streams (position text, gate-metric JSON) from
//! either a synthetic fleet or a recorded session pack replayed at its
//! original cadence.

mod fleet;
mod publisher;
mod replay;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::time::interval;
use tracing::info;

use fleet::Fleet;
use publisher::UpstreamPublisher;
use replay::PackReplayer;

#[derive(Parser, Debug)]
#[command(name = "mock", about = "Mock positioning-engine producer for the coach relay")]
struct Args {
    /// Session pack (.jsonl) to replay; synthetic fleet when absent
    #[arg(long)]
    pack: Option<PathBuf>,
    /// Number of synthetic athletes
    #[arg(long, default_value = "25")]
    athletes: usize,
    /// Batch rate in Hz
    #[arg(long, default_value = "10.0")]
    rate_hz: f64,
    /// Force the two leading athletes across the line early
    #[arg(long)]
    ocs: bool,
    /// Position PUB bind address
    #[arg(long, default_value = "tcp://0.0.0.0:5000")]
    position_bind: String,
    /// Gate-metrics PUB bind address
    #[arg(long, default_value = "tcp://0.0.0.0:5001")]
    gate_bind: String,
    /// Topic prefixes, matching the relay's subscriptions
    #[arg(long, default_value = "position")]
    position_topic: String,
    #[arg(long, default_value = "gate")]
    gate_topic: String,
    /// Write a registry document for the synthetic fleet and exit
    #[arg(long)]
    write_registry: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mock=info".into()),
        )
        .init();

    let args = Args::parse();

    if let Some(path) = &args.write_registry {
        let roster = fleet::roster_json(args.athletes);
        std::fs::write(path, serde_json::to_string_pretty(&roster)?)?;
        info!("Wrote registry for {} athletes to {}", args.athletes, path.display());
        return Ok(());
    }

    let mut publisher = UpstreamPublisher::bind(
        &args.position_bind,
        &args.gate_bind,
        &args.position_topic,
        &args.gate_topic,
    )
    .await?;

    if let Some(pack) = &args.pack {
        let replayer = PackReplayer::load(pack).await?;
        // Give subscribers a moment to attach before the burst starts.
        tokio::time::sleep(Duration::from_millis(500)).await;
        replayer.run(&mut publisher).await;
        return Ok(());
    }

    info!(
        "🛥  Synthetic fleet: {} athletes at {} Hz{}",
        args.athletes,
        args.rate_hz,
        if args.ocs { " (OCS preset)" } else { "" }
    );
    let mut fleet = Fleet::new(args.athletes, args.ocs);
    let dt = 1.0 / args.rate_hz;
    let mut ticker = interval(Duration::from_secs_f64(dt));

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Mock producer stopping");
                return Ok(());
            }
        }
        let now_us = now_us();
        fleet.tick(dt, now_us);
        let position_frame = fleet.position_frame(now_us);
        let gate_frame = fleet.gate_frame(now_us);
        publisher.send_positions(&position_frame).await;
        publisher.send_gate(&gate_frame).await;
    }
}

fn now_us() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as i64
}
