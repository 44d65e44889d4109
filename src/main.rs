use clap::{Parser, Subcommand};
use dbkeeper::config::{OperatorConfig, DEFAULT_PROVISIONER_PORT};
use dbkeeper::errors::*;
use dbkeeper::manager::{crds, Manager};
use dbkeeper::metrics::{self, MetricsRegistry};
use dbkeeper::storage::provisioner::server::ProvisionerServer;
use kube::Client;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(name = "dbkeeper", version, about = "Database deployment operator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Watch deployments, replications and local storages.
    Operator {
        /// YAML settings file
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, env = "POD_NAMESPACE")]
        namespace: Option<String>,
        #[arg(long, env = "POD_NAME")]
        pod_name: Option<String>,
        #[arg(long)]
        metrics_address: Option<String>,
    },
    /// Serve local volume directories on this node.
    Provisioner {
        #[arg(long, default_value_t = DEFAULT_PROVISIONER_PORT)]
        port: u16,
        #[arg(long, env = "NODE_NAME")]
        node_name: String,
        /// Directory volumes may be created under; repeatable
        #[arg(long = "local-path")]
        local_path: Vec<PathBuf>,
    },
    /// Print the custom resource definitions as YAML.
    Crd,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    if let Err(err) = run(Cli::parse()).await {
        let mut causes = err.iter();
        if let Some(first) = causes.next() {
            error!("{}", first);
        }
        for cause in causes {
            error!("  caused by: {}", cause);
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Operator {
            config,
            namespace,
            pod_name,
            metrics_address,
        } => {
            let mut cfg = match config {
                Some(path) => OperatorConfig::load(&path)?,
                None => OperatorConfig::default(),
            };
            if let Some(ns) = namespace {
                cfg.namespace = ns;
            }
            if let Some(name) = pod_name {
                cfg.pod_name = name;
            }
            if let Some(addr) = metrics_address {
                cfg.metrics_address = addr;
            }
            cfg.validate()?;
            operator(cfg).await
        }
        Command::Provisioner {
            port,
            node_name,
            local_path,
        } => {
            let listener = TcpListener::bind(("0.0.0.0", port))
                .await
                .chain_err(|| format!("binding provisioner port {}", port))?;
            ProvisionerServer::new(&node_name, local_path)
                .serve(listener)
                .await
        }
        Command::Crd => {
            let docs = crds()
                .iter()
                .map(serde_yaml::to_string)
                .collect::<std::result::Result<Vec<_>, _>>()?;
            print!("{}", docs.join("---\n"));
            Ok(())
        }
    }
}

async fn operator(config: OperatorConfig) -> Result<()> {
    info!(
        "dbkeeper {} starting in namespace {}",
        env!("CARGO_PKG_VERSION"),
        config.namespace
    );
    let client = Client::try_default()
        .await
        .chain_err(|| "connecting to the Kubernetes API")?;
    let metrics = Arc::new(MetricsRegistry::new());

    let listener = TcpListener::bind(&config.metrics_address)
        .await
        .chain_err(|| format!("binding metrics address {}", config.metrics_address))?;
    let (manager, drainer) = Manager::new(client, config, metrics).await?;
    let router = metrics::router(manager.metrics.clone());
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router).await {
            warn!("metrics server stopped: {}", err);
        }
    });

    tokio::select! {
        _ = drainer => warn!("watchers ended"),
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("interrupted, shutting down");
        }
    }
    Ok(())
}
