use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kinformer_core::{InformerConfig, Notification, TrackedObject, WatchFilter};
use kinformer_informer::{Informer, InformerError};
use kinformer_kubehub::KubeStore;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "kinformerctl", version, about = "Mirror a Kubernetes collection through a list/watch informer")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace to watch (empty: all namespaces)
    #[arg(short = 'n', long = "namespace", global = true, env = "KINFORMER_NAMESPACE", default_value = "")]
    namespace: String,

    /// GVK key, e.g. "v1/Secret" or "apps/v1/Deployment"
    #[arg(long = "resource", global = true, env = "KINFORMER_RESOURCE", default_value = "v1/Secret")]
    resource: String,

    /// Label selector passed to the API server
    #[arg(short = 'l', long = "selector", global = true)]
    selector: Option<String>,

    /// More logging (-v debug, -vv trace); KINFORMER_LOG wins when set
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Serve Prometheus metrics on this address (host:port)
    #[arg(long = "metrics-addr", global = true, env = "KINFORMER_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Periodic resync in seconds (0 disables)
    #[arg(long = "resync-secs", global = true)]
    resync_secs: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn filter(&self) -> WatchFilter {
        WatchFilter::new(self.resource.as_str()).namespace(Some(self.namespace.as_str())).labels(self.selector.as_deref())
    }

    fn config(&self) -> InformerConfig {
        let mut config = InformerConfig::from_env();
        if let Some(secs) = self.resync_secs {
            config.resync_period = (secs > 0).then(|| Duration::from_secs(secs));
        }
        config
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Log every add/update/delete until Ctrl-C
    Watch,
    /// Sync once, print the mirrored objects and exit
    Ls {
        /// Give up if the cache has not synced in time
        #[arg(long = "sync-timeout-secs", default_value_t = 30)]
        sync_timeout_secs: u64,
    },
    /// List served resources that can be watched
    Discover,
}

fn init_tracing(verbose: u8) {
    let fallback = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env = std::env::var("KINFORMER_LOG").unwrap_or_else(|_| fallback.to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

/// Metrics stay in-process no-ops unless an exporter address is given.
fn init_metrics(addr: Option<SocketAddr>) {
    let Some(addr) = addr else { return };
    if let Err(e) = PrometheusBuilder::new().with_http_listener(addr).install() {
        warn!(addr = %addr, error = %e, "metrics exporter not installed");
        return;
    }
    info!(addr = %addr, "serving Prometheus metrics");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    init_metrics(cli.metrics_addr);
    let (filter, config) = (cli.filter(), cli.config());

    match cli.command {
        Commands::Watch => watch(filter, config).await,
        Commands::Ls { sync_timeout_secs } => ls(filter, config, Duration::from_secs(sync_timeout_secs), cli.output).await,
        Commands::Discover => {
            let resources = kinformer_kubehub::discover().await?;
            match cli.output {
                Output::Human => {
                    println!("{:<48} {:<32} {}", "RESOURCE", "PLURAL", "SCOPE");
                    for r in resources {
                        let scope = if r.namespaced { "namespaced" } else { "cluster" };
                        println!("{:<48} {:<32} {}", r.key, r.plural, scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
            }
            Ok(())
        }
    }
}

async fn build(filter: WatchFilter, config: InformerConfig) -> Result<Informer> {
    let store = KubeStore::connect(&filter).await?;
    Ok(Informer::new(Arc::new(store), filter, config)?)
}

fn log_change(ev: &Notification) -> anyhow::Result<()> {
    match ev {
        Notification::Updated { old, new } if Arc::ptr_eq(old, new) => {
            tracing::debug!(key = %ev.key(), rv = %new.version, "resync");
        }
        _ => info!(key = %ev.key(), rv = ?ev.version().map(|v| v.to_string()), "{}", ev.kind_str()),
    }
    Ok(())
}

async fn stop(task: JoinHandle<Result<(), InformerError>>, cancel: &CancellationToken) -> Result<()> {
    cancel.cancel();
    match task.await {
        Ok(res) => Ok(res?),
        Err(e) => bail!("informer task failed: {}", e),
    }
}

async fn watch(filter: WatchFilter, config: InformerConfig) -> Result<()> {
    info!(resource = %filter.kind, ns = ?filter.namespace, selector = ?filter.label_selector, "watch invoked");
    let mut informer = build(filter, config).await?;
    informer.add_handler("log", log_change);
    let barrier = informer.barrier();
    let cancel = CancellationToken::new();
    let mut task = tokio::spawn(informer.run(cancel.clone()));

    tokio::select! {
        synced = barrier.wait_for_sync(&cancel) => {
            if synced {
                info!("cache synced");
            }
        }
        _ = signal::ctrl_c() => {
            info!("Ctrl-C received before sync; shutting down");
            return stop(task, &cancel).await;
        }
    }

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Ctrl-C received; shutting down watch");
            stop(task, &cancel).await
        }
        res = &mut task => match res {
            Ok(Ok(())) => {
                warn!("informer ended on its own");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(error = %e, "informer failed");
                Err(e.into())
            }
            Err(e) => bail!("informer task failed: {}", e),
        },
    }
}

async fn ls(filter: WatchFilter, config: InformerConfig, sync_timeout: Duration, output: Output) -> Result<()> {
    info!(resource = %filter.kind, ns = ?filter.namespace, "ls invoked");
    let informer = build(filter, config).await?;
    let cache = informer.cache();
    let barrier = informer.barrier();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(informer.run(cancel.clone()));

    let synced = tokio::time::timeout(sync_timeout, barrier.wait_for_sync(&cancel)).await.unwrap_or(false);
    if !synced {
        // surfaces the terminal error when the informer gave up
        stop(task, &cancel).await?;
        bail!("cache did not sync within {}s", sync_timeout.as_secs());
    }
    let snap = cache.snapshot();
    match output {
        Output::Human => {
            println!("{:<20} {:<40} {:<10} {}", "NAMESPACE", "NAME", "VERSION", "AGE");
            for item in snap.items.iter() {
                print_row(item);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&snap.items)?),
    }
    stop(task, &cancel).await
}

fn print_row(o: &TrackedObject) {
    let ns = o.key.namespace.as_deref().unwrap_or("-");
    println!("{:<20} {:<40} {:<10} {}", ns, o.key.name, o.version, render_age(o.meta.creation_ts, Utc::now()));
}

/// Compact kubectl-style age: `3d4h`, `2h10m`, `7m`, `42s`; `-` when unknown.
fn render_age(creation_ts: i64, now: DateTime<Utc>) -> String {
    let Some(created) = DateTime::from_timestamp(creation_ts, 0).filter(|_| creation_ts > 0) else {
        return "-".to_string();
    };
    let age = now.signed_duration_since(created).max(chrono::Duration::zero());
    match (age.num_days(), age.num_hours() % 24, age.num_minutes() % 60) {
        (d, h, _) if d > 0 => format!("{}d{}h", d, h),
        (_, h, m) if h > 0 => format!("{}h{}m", h, m),
        (_, _, m) if m > 0 => format!("{}m", m),
        _ => format!("{}s", age.num_seconds()),
    }
}
