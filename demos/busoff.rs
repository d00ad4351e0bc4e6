//! Reference bus-off attack.
//!
//! A victim and an adversary share one bus and the same identifier. Both
//! enqueue a two-byte frame on the same cadence; the payloads differ only in
//! the second byte, where the adversary's dominant bit overwrites the
//! victim's recessive one. Every collision charges the victim's transmit
//! error counter until it leaves the bus, at which point the demo exits.
//!
//! ```bash
//! cargo run --example busoff -- --bitrate 500 --delay-secs 5
//! ```
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::process;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use canlink::protocol::bus::Bus;
use canlink::protocol::node::Node;

#[derive(Parser)]
#[command(about = "Bus-off attack against a simulated CAN node")]
struct Args {
    /// Bus bit rate in bits per second.
    #[arg(long, default_value_t = 500)]
    bitrate: u32,
    /// Seconds between two enqueues on each node.
    #[arg(long, default_value_t = 5)]
    delay_secs: u64,
    /// Log filter when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log: String,
    /// Also append the log to this file.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_logging(args: &Args) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log.clone()));
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(io::stderr);
    match &args.log_file {
        Some(path) => {
            let file = match File::create(path) {
                Ok(file) => file,
                Err(err) => {
                    eprintln!("failed to create log file {}: {err}", path.display());
                    process::exit(1);
                }
            };
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file));
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args);

    let bus = Arc::new(Bus::new(args.bitrate));

    let victim = match Node::new(&bus, 0x000) {
        Ok(node) => node,
        Err(err) => {
            error!(%err, "failed to create victim node");
            process::exit(1);
        }
    };
    let adversary = match Node::new(&bus, 0x000) {
        Ok(node) => node,
        Err(err) => {
            error!(%err, "failed to create adversary node");
            process::exit(1);
        }
    };

    let delay = Duration::from_secs(args.delay_secs);
    let workload = victim.clone();
    victim.set_behavior(async move {
        loop {
            if let Err(err) = workload.enqueue(&[0x12, 0x34]) {
                warn!(%err, "victim enqueue failed");
            }
            tokio::time::sleep(delay).await;
        }
    });
    let workload = adversary.clone();
    adversary.set_behavior(async move {
        loop {
            if let Err(err) = workload.enqueue(&[0x12, 0x14]) {
                warn!(%err, "adversary enqueue failed");
            }
            tokio::time::sleep(delay).await;
        }
    });

    victim.set_bus_off_hook(|| {
        info!("bus-off attack simulation done");
        process::exit(0);
    });

    if let Err(err) = bus.activate().await {
        error!(%err, "bus activation failed");
        process::exit(1);
    }
}
