//! Hostpool - infrastructure provider for pre-registered hosts

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hostpool::agent::drift::DriftDetector;
use hostpool::agent::metrics::MetricsState;
use hostpool::agent::cloudinit::DiskFileWriter;
use hostpool::agent::{reconciler, AgentContext, HostRegistrar, ShellRunner};
use hostpool::controller::{credential, csr, host as host_controller, machine};
use hostpool::crd::{BootstrapCredential, Host, PoolMachine};
use hostpool::retry::{retry_with_backoff, RetryConfig};

/// Hostpool - turn pre-registered hosts into cluster nodes on demand
#[derive(Parser, Debug)]
#[command(name = "hostpool", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the management-plane controllers (default mode)
    Controller(ControllerArgs),

    /// Run the host agent on this machine
    Agent(AgentArgs),
}

/// Controller mode arguments
#[derive(Parser, Debug)]
struct ControllerArgs {
    /// Identity written into claim leases; must differ between replicas
    #[arg(long, env = "CONTROLLER_ID")]
    controller_id: Option<String>,
}

/// Agent mode arguments
#[derive(Parser, Debug)]
struct AgentArgs {
    /// Name to register this host under (defaults to the kernel hostname)
    #[arg(long, env = "HOST_NAME")]
    host_name: Option<String>,

    /// Namespace the Host object lives in
    #[arg(long, env = "HOST_NAMESPACE", default_value = hostpool::DEFAULT_NAMESPACE)]
    namespace: String,

    /// Selection label to apply at registration (key=value, repeatable)
    #[arg(long = "label")]
    labels: Vec<String>,

    /// Path bundles and binaries are downloaded to
    #[arg(long, default_value = hostpool::DEFAULT_DOWNLOAD_PATH)]
    download_path: String,

    /// Skip Kubernetes component installation (pre-provisioned hosts)
    #[arg(long)]
    skip_installation: bool,

    /// Metrics endpoint listen address
    #[arg(long, default_value = hostpool::DEFAULT_METRICS_ADDR)]
    metrics_addr: SocketAddr,

    /// Seconds between host status refreshes
    #[arg(long, default_value_t = hostpool::DEFAULT_REFRESH_INTERVAL_SECS)]
    refresh_interval_secs: u64,

    /// Seconds between drift-detector sweeps
    #[arg(long, default_value_t = hostpool::DEFAULT_DRIFT_INTERVAL_SECS)]
    drift_interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        for crd in [
            serde_yaml::to_string(&Host::crd())?,
            serde_yaml::to_string(&PoolMachine::crd())?,
            serde_yaml::to_string(&BootstrapCredential::crd())?,
        ] {
            println!("---\n{crd}");
        }
        return Ok(());
    }

    match cli.command {
        Some(Commands::Agent(args)) => run_agent(args).await,
        Some(Commands::Controller(args)) => run_controller(args).await,
        None => {
            run_controller(ControllerArgs {
                controller_id: None,
            })
            .await
        }
    }
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/proc/sys/kernel/hostname")
                .ok()
                .map(|h| h.trim().to_string())
        })
        .unwrap_or_else(|| "localhost".to_string())
}

/// Run the management-plane controllers.
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    tracing::info!("hostpool controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {}", e))?;

    let controller_id = args
        .controller_id
        .unwrap_or_else(|| format!("hostpool-controller-{}", default_hostname()));
    tracing::info!(controller_id = %controller_id, "claim lease identity");

    let machines: Api<PoolMachine> = Api::all(client.clone());
    let hosts: Api<Host> = Api::all(client.clone());
    let credentials: Api<BootstrapCredential> = Api::all(client.clone());
    let csrs: Api<CertificateSigningRequest> = Api::all(client.clone());

    let machine_ctx = Arc::new(machine::Context::new(client.clone(), controller_id));
    let machine_controller = Controller::new(machines, WatcherConfig::default())
        .watches(hosts.clone(), WatcherConfig::default(), machine::host_to_machine)
        .shutdown_on_signal()
        .run(machine::reconcile, machine::error_policy, machine_ctx)
        .for_each(|result| async move {
            match result {
                Ok(obj) => tracing::debug!(?obj, "machine reconciled"),
                Err(e) => tracing::error!(error = ?e, "machine reconciliation error"),
            }
        });

    let host_ctx = Arc::new(host_controller::Context {
        client: client.clone(),
    });
    let host_loop = Controller::new(hosts, WatcherConfig::default())
        .shutdown_on_signal()
        .run(host_controller::reconcile, host_controller::error_policy, host_ctx)
        .for_each(|result| async move {
            match result {
                Ok(obj) => tracing::debug!(?obj, "host reconciled"),
                Err(e) => tracing::error!(error = ?e, "host reconciliation error"),
            }
        });

    let credential_ctx = Arc::new(credential::Context {
        client: client.clone(),
    });
    let credential_loop = Controller::new(credentials, WatcherConfig::default())
        .shutdown_on_signal()
        .run(credential::reconcile, credential::error_policy, credential_ctx)
        .for_each(|result| async move {
            match result {
                Ok(obj) => tracing::debug!(?obj, "credential reconciled"),
                Err(e) => tracing::error!(error = ?e, "credential reconciliation error"),
            }
        });

    let csr_ctx = Arc::new(csr::Context {
        client: client.clone(),
    });
    let csr_loop = Controller::new(csrs, WatcherConfig::default())
        .shutdown_on_signal()
        .run(csr::reconcile, csr::error_policy, csr_ctx)
        .for_each(|result| async move {
            match result {
                Ok(obj) => tracing::debug!(?obj, "csr reconciled"),
                Err(e) => tracing::error!(error = ?e, "csr reconciliation error"),
            }
        });

    tracing::info!("controllers running");
    tokio::join!(machine_controller, host_loop, credential_loop, csr_loop);

    tracing::info!("hostpool controller shutting down");
    Ok(())
}

/// Run the host agent.
async fn run_agent(args: AgentArgs) -> anyhow::Result<()> {
    let host_name = args.host_name.unwrap_or_else(default_hostname);
    tracing::info!(host = %host_name, namespace = %args.namespace, "hostpool agent starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {}", e))?;

    let mut labels = BTreeMap::new();
    for label in &args.labels {
        let Some((key, value)) = label.split_once('=') else {
            anyhow::bail!("invalid --label {:?}, expected key=value", label);
        };
        labels.insert(key.to_string(), value.to_string());
    }

    let cmd_runner = Arc::new(ShellRunner);
    let registrar = HostRegistrar {
        client: client.clone(),
        host_name: host_name.clone(),
        namespace: args.namespace.clone(),
        labels,
        cmd_runner: cmd_runner.clone(),
    };

    // Registration survives transient API unavailability at boot.
    retry_with_backoff(
        &RetryConfig::with_max_attempts(10),
        "register_host",
        || registrar.register(),
    )
    .await
    .map_err(|e| anyhow::anyhow!("failed to register host: {}", e))?;
    tracing::info!("host registered");

    let metrics = Arc::new(MetricsState::new(env!("CARGO_PKG_VERSION")));
    metrics.record_heartbeat();
    tokio::spawn(hostpool::agent::metrics::serve(
        args.metrics_addr,
        metrics.clone(),
    ));

    tokio::spawn(
        DriftDetector {
            interval: Duration::from_secs(args.drift_interval_secs),
            ..Default::default()
        }
        .run(),
    );

    let refresh_interval = Duration::from_secs(args.refresh_interval_secs);
    let refresh_metrics = metrics.clone();
    tokio::spawn(async move {
        registrar.refresh_loop(refresh_interval, refresh_metrics).await;
    });

    let ctx = Arc::new(AgentContext {
        client: client.clone(),
        host_name: host_name.clone(),
        namespace: args.namespace.clone(),
        cmd_runner,
        file_writer: Arc::new(DiskFileWriter),
        download_path: args.download_path,
        skip_installation: args.skip_installation,
    });

    // Watch only this agent's Host object.
    let hosts: Api<Host> = Api::namespaced(client, &args.namespace);
    let watcher_config =
        WatcherConfig::default().fields(&format!("metadata.name={}", host_name));

    tracing::info!("starting host reconciler");
    Controller::new(hosts, watcher_config)
        .shutdown_on_signal()
        .run(reconciler::reconcile, reconciler::error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(obj) => tracing::debug!(?obj, "host reconciled"),
                Err(e) => tracing::error!(error = ?e, "host reconciliation error"),
            }
        })
        .await;

    tracing::info!("hostpool agent shutting down");
    Ok(())
}
