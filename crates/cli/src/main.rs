use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use kwatch_controller::{ControllerConfig, UpdatePolicy};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "kwatchctl", version, about = "Watch Kubernetes Events and append them to a log file")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Path to a kubeconfig (default: in-cluster or ~/.kube/config)
    #[arg(long = "kubeconfig", global = true)]
    kubeconfig: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the Event controller until Ctrl-C
    Run(Overrides),
    /// Print the effective configuration
    Config(Overrides),
}

/// Flags layered over `KWATCH_*` environment settings.
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Namespace to watch (default: all)
    #[arg(long = "ns")]
    namespace: Option<String>,
    /// Worker count
    #[arg(long = "workers")]
    workers: Option<usize>,
    /// File the Event lines are appended to
    #[arg(long = "sink")]
    sink: Option<PathBuf>,
    /// Requeues before a failing key is dropped
    #[arg(long = "max-retries")]
    max_retries: Option<u32>,
    /// always | changed | source-and-reason
    #[arg(long = "update-policy")]
    update_policy: Option<String>,
    #[arg(long = "field-selector")]
    field_selector: Option<String>,
    #[arg(long = "label-selector")]
    label_selector: Option<String>,
}

impl Overrides {
    fn apply(self, mut cfg: ControllerConfig) -> Result<ControllerConfig> {
        if let Some(ns) = self.namespace.filter(|s| !s.is_empty()) {
            cfg.target.namespace = Some(ns);
        }
        if let Some(n) = self.workers {
            cfg.workers = n;
        }
        if let Some(p) = self.sink {
            cfg.sink_path = p;
        }
        if let Some(n) = self.max_retries {
            cfg.max_retries = n;
        }
        if let Some(p) = self.update_policy {
            cfg.update_policy = UpdatePolicy::from_str(&p)?;
        }
        if self.field_selector.is_some() {
            cfg.target.field_selector = self.field_selector;
        }
        if self.label_selector.is_some() {
            cfg.target.label_selector = self.label_selector;
        }
        Ok(cfg)
    }
}

const LOG_ENV: &str = "KWATCH_LOG";
const METRICS_ADDR_ENV: &str = "KWATCH_METRICS_ADDR";

fn init_tracing() {
    let directives = std::env::var(LOG_ENV).unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::from_str(&directives).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

/// `host:port` for the Prometheus listener; `None` when unset or unparsable.
fn metrics_listen_addr(raw: Option<&str>) -> Option<SocketAddr> {
    let raw = raw?.trim();
    match raw.parse::<SocketAddr>() {
        Ok(sock) => Some(sock),
        Err(_) => {
            warn!(var = METRICS_ADDR_ENV, value = %raw, "invalid listen address; expected host:port");
            None
        }
    }
}

fn init_metrics() {
    let raw = std::env::var(METRICS_ADDR_ENV).ok();
    let Some(sock) = metrics_listen_addr(raw.as_deref()) else {
        return;
    };
    match PrometheusBuilder::new().with_http_listener(sock).install() {
        Ok(()) => info!(addr = %sock, "Prometheus metrics exporter listening"),
        Err(e) => warn!(error = %e, "failed to install metrics exporter"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Config(overrides) => {
            let cfg = overrides.apply(ControllerConfig::from_env())?;
            match cli.output {
                Output::Human => {
                    println!("namespace      {}", cfg.target.namespace.as_deref().unwrap_or("<all>"));
                    println!("workers        {}", cfg.workers);
                    println!("max retries    {}", cfg.max_retries);
                    println!("sink           {}", cfg.sink_path.display());
                    println!("update policy  {}", cfg.update_policy);
                    println!("backoff        {}ms..{}s, {} qps / {} burst", cfg.backoff_base_ms, cfg.backoff_max_secs, cfg.qps, cfg.burst);
                    if let Some(fs) = &cfg.target.field_selector {
                        println!("field selector {}", fs);
                    }
                    if let Some(ls) = &cfg.target.label_selector {
                        println!("label selector {}", ls);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&cfg)?),
            }
        }
        Commands::Run(overrides) => {
            let cfg = overrides.apply(ControllerConfig::from_env())?;
            let client = kwatch_kubehub::client(cli.kubeconfig.as_deref())
                .await
                .context("building Kubernetes client")?;

            let shutdown = CancellationToken::new();
            tokio::spawn({
                let shutdown = shutdown.clone();
                async move {
                    match signal::ctrl_c().await {
                        Ok(()) => info!("interrupt received; shutting down"),
                        Err(e) => warn!(error = %e, "cannot listen for Ctrl-C; shutting down"),
                    }
                    shutdown.cancel();
                }
            });

            kwatch_controller::run_controller(cfg, client, shutdown).await?;
        }
    }

    Ok(())
}
