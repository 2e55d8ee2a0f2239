use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use reko_controller::components::JobComponent;
use reko_controller::Controller;
use reko_core::{EngineConfig, GroupVersionKind, Selector};
use reko_kubehub::{parse_gvk_key, KubeStore};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "reko-operator", version, about = "Reconcile primary resources into managed Jobs")]
struct Cli {
    /// Primary resource, e.g. "reko.dev/v1alpha1/Workload"
    #[arg(long, env = "REKO_PRIMARY", default_value = "reko.dev/v1alpha1/Workload")]
    primary: String,

    /// Only watch primaries in this namespace
    #[arg(long = "ns", env = "REKO_NAMESPACE")]
    namespace: Option<String>,

    /// Value of the managed-by label on created objects
    #[arg(long, env = "REKO_MANAGER", default_value = "reko")]
    manager: String,

    /// Worker count (overrides REKO_WORKERS)
    #[arg(long)]
    workers: Option<usize>,

    /// Requeue interval in seconds while converging (overrides REKO_REQUEUE_SECS)
    #[arg(long)]
    requeue_secs: Option<u64>,

    /// Print the effective engine configuration and exit
    #[arg(long)]
    print_config: bool,
}

impl Cli {
    fn engine_config(&self) -> EngineConfig {
        let mut cfg = EngineConfig::from_env();
        if let Some(n) = self.workers {
            cfg.worker_count = n;
        }
        if let Some(secs) = self.requeue_secs {
            cfg.requeue_interval = Duration::from_secs(secs);
        }
        cfg
    }
}

fn init_tracing() {
    let env = std::env::var("REKO_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("REKO_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid REKO_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = cli.engine_config();
    config.validate().context("engine configuration")?;
    if cli.print_config {
        println!("{config:#?}");
        return Ok(());
    }
    init_metrics();

    let primary = parse_gvk_key(&cli.primary)?;
    let store = KubeStore::try_default()
        .await
        .context("connecting to the cluster")?
        .discover(&[primary.clone(), GroupVersionKind::gvk("batch", "v1", "Job")])
        .await?;

    let mut builder = Controller::builder(Arc::new(store), primary.kind.clone())
        .config(config)
        .component(JobComponent::new(cli.manager.clone()));
    if let Some(ns) = cli.namespace.as_deref() {
        builder = builder.primary_selector(Selector::in_namespace(Some(ns)));
    }
    let controller = builder.build()?;

    let token = controller.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(e) => warn!(error = %e, "signal handler failed; shutting down"),
        }
        token.cancel();
    });

    info!(primary = %cli.primary, ns = ?cli.namespace, "reko-operator starting");
    controller.run().await;
    Ok(())
}
