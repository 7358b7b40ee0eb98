use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use podsync_core::PodRecord;
use podsync_informer::{Lifecycle, Options, PodInformer, DEFAULT_QUEUE_CAPACITY};
use podsync_kubehub::KubeFeed;
use tokio::signal;
use tracing::{error, info, warn};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Parser, Debug)]
#[command(name = "podsyncctl", version, about = "Pod informer CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace to watch
    #[arg(long = "ns", env = "NAMESPACE", global = true, default_value = "default")]
    namespace: String,

    /// Watch every namespace (overrides --ns)
    #[arg(short = 'A', long = "all-namespaces", action = ArgAction::SetTrue, global = true)]
    all_namespaces: bool,

    /// Label selector, e.g. "app=miniapi,tier=backend"
    #[arg(short = 'l', long = "selector", env = "LABEL_SELECTOR", global = true, default_value = "app=miniapi")]
    label_selector: String,

    /// Periodic resync, e.g. "30s"; unset or invalid disables it
    #[arg(long = "resync", env = "RESYNC_PERIOD", global = true)]
    resync: Option<String>,

    /// Capacity of the feed → informer queue
    #[arg(long = "queue-cap", env = "PODSYNC_QUEUE_CAP", global = true, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    queue_cap: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print every snapshot until the interval elapses or Ctrl-C
    Watch {
        /// How long to run, e.g. "10m"; invalid values fall back to 10m
        #[arg(long = "interval", env = "INTERVAL")]
        interval: Option<String>,
    },
    /// Create, run and stop informers in a tight loop to surface leaks
    Churn {
        /// Cycles per batch
        #[arg(long = "batch", default_value_t = 50_000)]
        batch: u64,
        /// Stop after this many batches (default: forever)
        #[arg(long = "rounds")]
        rounds: Option<u64>,
    },
}

fn init_tracing() {
    let env = std::env::var("PODSYNC_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("PODSYNC_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid PODSYNC_METRICS_ADDR; expected host:port");
        }
    }
}

/// Parse a duration such as `90s` or `1h30m`. Missing or invalid input yields `None`;
/// invalid input is logged.
fn parse_duration(name: &str, raw: Option<&str>) -> Option<Duration> {
    let raw = raw.map(str::trim).filter(|s| !s.is_empty())?;
    match humantime::parse_duration(raw) {
        Ok(d) => Some(d),
        Err(e) => {
            warn!(%name, value = %raw, error = %e, "ignoring invalid duration");
            None
        }
    }
}

fn options(cli: &Cli) -> Options {
    let namespace = if cli.all_namespaces { String::new() } else { cli.namespace.clone() };
    let resync = parse_duration("RESYNC_PERIOD", cli.resync.as_deref());
    info!(ns = %namespace, selector = %cli.label_selector, resync = ?resync, "informer options");
    Options::default()
        .namespace(namespace)
        .label_selector(cli.label_selector.clone())
        .resync_interval(resync)
        .queue_capacity(cli.queue_cap)
}

fn print_snapshot(output: Output, pods: &[PodRecord]) {
    match output {
        Output::Human => {
            println!("onUpdate: {}", pods.len());
            for (i, p) in pods.iter().enumerate() {
                println!("{}/{}: namespace={} pod={} ip={} ready={}", i, pods.len(), p.namespace, p.name, p.ip, p.ready);
            }
        }
        Output::Json => match serde_json::to_string(pods) {
            Ok(line) => println!("{}", line),
            Err(e) => error!(error = %e, "failed to encode snapshot"),
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Watch { interval } => {
            let interval = parse_duration("INTERVAL", interval.as_deref()).unwrap_or(DEFAULT_INTERVAL);
            watch(&cli, interval).await?;
        }
        Commands::Churn { batch, rounds } => churn(&cli, *batch, *rounds).await?,
    }

    Ok(())
}

async fn watch(cli: &Cli, interval: Duration) -> Result<()> {
    let feed = KubeFeed::try_default().await?;
    let output = cli.output;
    let opts = options(cli).feed(feed).on_update(move |pods| print_snapshot(output, pods));
    let informer = Arc::new(PodInformer::new(opts)?);
    let mut run = tokio::spawn({
        let informer = Arc::clone(&informer);
        async move { informer.run().await }
    });
    info!(interval = ?interval, "watch started");

    tokio::select! {
        res = &mut run => {
            res??;
            warn!("change feed ended before the interval elapsed");
            return Ok(());
        }
        _ = tokio::time::sleep(interval) => info!(interval = ?interval, "time limit reached"),
        _ = signal::ctrl_c() => info!("Ctrl-C received; stopping informer"),
    }

    informer.stop()?;
    match run.await? {
        Ok(()) => info!("informer stopped"),
        Err(e) => error!(error = %e, "informer run error"),
    }
    Ok(())
}

async fn churn(cli: &Cli, batch: u64, rounds: Option<u64>) -> Result<()> {
    let feed = KubeFeed::try_default().await?;
    let output = cli.output;
    let opts = options(cli).feed(feed).on_update(move |pods| print_snapshot(output, pods));
    let mut round = 0u64;
    loop {
        for _ in 0..batch {
            once(opts.clone()).await?;
        }
        round += 1;
        info!(executed = batch, round, "churn batch done");
        if rounds.is_some_and(|r| round >= r) {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; ending churn");
                return Ok(());
            }
        }
    }
}

/// One create → run → stop cycle; waits for `run` to return so no watch task outlives it.
async fn once(opts: Options) -> Result<()> {
    let informer = Arc::new(PodInformer::new(opts)?);
    let run = tokio::spawn({
        let informer = Arc::clone(&informer);
        async move { informer.run().await }
    });
    let mut state = informer.subscribe_state();
    state.wait_for(|s| *s != Lifecycle::Created).await?;
    if let Err(e) = informer.stop() {
        // run already finished on its own (feed error); its result is reported below
        warn!(error = %e, "stop skipped");
    }
    if let Err(e) = run.await? {
        warn!(error = %e, "informer run error");
    }
    Ok(())
}
