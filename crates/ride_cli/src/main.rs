mod logging;
mod scenario;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use ride_core::clock::SystemClock;
use ride_core::config::ServiceConfig;
use ride_core::events::{LocalNotifier, Topic};
use ride_core::geo::GeoPoint;
use ride_core::service::Collaborators;
use ride_core::RideService;
use tracing::{info, warn};

use scenario::{ScenarioParams, BENGALURU};

// ── CLI definition ─────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "ride-dispatch",
    version,
    about = "Run a seeded ride dispatch scenario",
    long_about = "Brings a driver fleet online around a city centre, fires concurrent\n\
                  ride requests through pricing and dispatch, drives every matched ride\n\
                  to completion and prints the resulting dispatch statistics."
)]
struct Cli {
    /// TOML service configuration; built-in defaults when omitted
    #[arg(long, env = "RIDE_DISPATCH_CONFIG")]
    config: Option<PathBuf>,
    /// Number of drivers to bring online
    #[arg(long, default_value_t = 40)]
    drivers: usize,
    /// Number of concurrent riders
    #[arg(long, default_value_t = 60)]
    riders: usize,
    /// RNG seed; random when omitted
    #[arg(long, env = "RIDE_DISPATCH_SEED")]
    seed: Option<u64>,
    /// Half side in km of the square drivers and pickups are spread over
    #[arg(long, default_value_t = 5.0)]
    spread_km: f64,
    /// Chance that the first matched driver declines a ride
    #[arg(long, default_value_t = 0.1)]
    decline_rate: f64,
    #[arg(long, default_value_t = BENGALURU.lat, allow_negative_numbers = true)]
    center_lat: f64,
    #[arg(long, default_value_t = BENGALURU.lon, allow_negative_numbers = true)]
    center_lon: f64,
    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(path: Option<&PathBuf>) -> Result<ServiceConfig> {
    match path {
        Some(path) => {
            ServiceConfig::load(path).with_context(|| format!("loading configuration from {}", path.display()))
        }
        None => Ok(ServiceConfig::default()),
    }
}

/// Count "new ride" broadcasts, standing in for the driver app channel.
fn watch_new_requests(notifier: &LocalNotifier) -> Arc<AtomicU64> {
    let seen = Arc::new(AtomicU64::new(0));
    let mut subscription = notifier.subscribe(Topic::NewRequests);
    let counter = seen.clone();
    tokio::spawn(async move {
        while subscription.recv().await.is_some() {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    });
    seen
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.json_logs);

    if !(0.0..=1.0).contains(&cli.decline_rate) {
        bail!("--decline-rate must be within [0, 1], got {}", cli.decline_rate);
    }
    if !(cli.spread_km.is_finite() && cli.spread_km > 0.0) {
        bail!("--spread-km must be positive, got {}", cli.spread_km);
    }
    let center = GeoPoint::new(cli.center_lat, cli.center_lon);
    center.validate("--center")?;

    let config = load_config(cli.config.as_ref())?;
    let seed = cli.seed.unwrap_or_else(rand::random);
    let params = ScenarioParams {
        num_drivers: cli.drivers,
        num_riders: cli.riders,
        seed,
        center,
        spread_km: cli.spread_km,
        decline_rate: cli.decline_rate,
        // Room for a decline and a second full search.
        match_wait: config.dispatch.search_budget() * 2 + Duration::from_secs(5),
    };
    info!(seed, drivers = cli.drivers, riders = cli.riders, "starting scenario");

    let zones = Arc::new(scenario::demo_zones(center)?);
    let notifier = Arc::new(LocalNotifier::new(config.events.channel_capacity));
    let broadcasts = watch_new_requests(&notifier);
    let service = RideService::new(
        config,
        Collaborators::in_memory(zones, notifier.clone()),
        Arc::new(SystemClock),
    )?;

    let started = Instant::now();
    let report = tokio::select! {
        report = scenario::run(&service, &params) => Some(report?),
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, shutting down");
            None
        }
    };
    service.shutdown().await;

    let stats = service.stats();
    if let Some(report) = report {
        println!("seed:             {seed}");
        println!("elapsed:          {:.2?}", started.elapsed());
        println!("completed:        {}", report.completed);
        println!("no driver found:  {}", report.no_driver);
        println!("declined once:    {}", report.declined);
        println!("failed:           {}", report.failed);
        println!("fares collected:  {:.2}", report.fares_collected);
    }
    println!("broadcasts seen:  {}", broadcasts.load(Ordering::Relaxed));
    println!("match rate:       {:.1}%", stats.match_rate() * 100.0);
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
