use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use traffic_polling_server::constants::{
    DEFAULT_CALL_TIMEOUT, DEFAULT_DEGRADED_THRESHOLD, PAYLOAD_CAPACITY,
};
use traffic_polling_server::payload::build_payload;
use traffic_polling_server::{PollConfig, PollError, PollLoop, SnapshotFileStore, SubscriberId};

/// Subscriber traffic polling server.
///
/// Resolves each subscriber's bandwidth ceilings from a router snapshot and
/// prints one JSON utilization payload per interval on stdout.
#[derive(Parser, Debug)]
#[command(name = "traffic-polling-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Poll interval in milliseconds
    #[arg(default_value_t = 2000)]
    interval_ms: u64,

    /// Path to the JSON router snapshot
    #[arg(short, long, default_value = "router-snapshot.json")]
    store: PathBuf,

    /// Subscriber to observe (repeatable)
    #[arg(short = 'u', long = "subscriber", required = true)]
    subscribers: Vec<String>,

    /// Timeout for each record store call, in milliseconds
    #[arg(long, default_value_t = DEFAULT_CALL_TIMEOUT.as_millis() as u64)]
    timeout_ms: u64,

    /// Consecutive sampling failures before a subscriber is marked degraded
    #[arg(long, default_value_t = DEFAULT_DEGRADED_THRESHOLD)]
    degraded_threshold: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn poll_config(&self) -> PollConfig {
        PollConfig::new()
            .with_poll_interval(Duration::from_millis(self.interval_ms))
            .with_call_timeout(Duration::from_millis(self.timeout_ms))
            .with_degraded_threshold(self.degraded_threshold)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // stdout carries the payload feed, logs go to stderr
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let store = Arc::new(SnapshotFileStore::new(&args.store));
    let poll_loop =
        PollLoop::new(store, args.poll_config()).context("invalid poll configuration")?;

    info!(
        store = %args.store.display(),
        interval_ms = args.interval_ms,
        subscribers = args.subscribers.len(),
        "Polling server starting"
    );

    for name in &args.subscribers {
        let id = SubscriberId::new(name.as_str());
        match poll_loop.subscribe(&id).await {
            Ok(()) => {}
            Err(PollError::UnknownSubscriber(_)) => {
                warn!(subscriber = %id, "User not found, skipping");
            }
            Err(e) => warn!(subscriber = %id, error = %e, "Subscription failed"),
        }
    }
    if poll_loop.subscribers().is_empty() {
        bail!("none of the requested subscribers exist in {}", args.store.display());
    }

    let result = emit_payloads(&poll_loop, poll_loop.config().poll_interval).await;
    poll_loop.shutdown();
    info!("Polling server shutting down");
    result
}

/// Write one payload per interval until stdout closes or ctrl-c arrives.
async fn emit_payloads(poll_loop: &PollLoop, interval: Duration) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    let mut payload = Vec::with_capacity(PAYLOAD_CAPACITY);
    let mut ticker = tokio::time::interval_at(Instant::now(), interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut ctrl_c => return Ok(()),
        }

        build_payload(&mut payload, &poll_loop.snapshot()).context("serializing payload")?;
        payload.push(b'\n');

        if let Err(err) = write_payload(&mut stdout, &payload).await {
            if err.kind() == io::ErrorKind::BrokenPipe {
                return Ok(());
            }
            error!(error = %err, "Writing payload failed");
            return Err(err).context("writing payload to stdout");
        }
    }
}

async fn write_payload(stdout: &mut tokio::io::Stdout, payload: &[u8]) -> io::Result<()> {
    stdout.write_all(payload).await?;
    stdout.flush().await
}
