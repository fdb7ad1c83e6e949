use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use kube::Client;
use kube::config::{KubeConfigOptions, Kubeconfig};
use libcsi::{ConnectionLostFn, CsiAttacher, CsiClient, CsiController, CsiIdentity};
use rka::cli::{Cli, LogFormat};
use rka::config::AttacherConfig;
use rka::controller::Controller;
use rka::handler::{CsiHandler, Handler, TrivialHandler};
use rka::k8s::{self, ApiRate, KubeCluster};
use rka::leader::LeaderElector;
use rka::metrics::MetricsAttacher;
use rka::server;
use rka::store::Cluster;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const PROBE_RETRY_START: Duration = Duration::from_secs(1);
const PROBE_RETRY_MAX: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);
    cli.validate().context("invalid command line")?;
    info!(version = env!("CARGO_PKG_VERSION"), "starting external attacher");

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let connection_lost = Arc::new(AtomicBool::new(false));
    let on_lost: ConnectionLostFn = {
        let lost = connection_lost.clone();
        let shutdown = shutdown.clone();
        Arc::new(move || {
            lost.store(true, Ordering::SeqCst);
            shutdown.cancel();
        })
    };
    let channel = libcsi::connect(&cli.attacher.csi_address, Some(on_lost))
        .await
        .context("failed to connect to the CSI driver")?;
    let csi = CsiClient::new(channel, cli.attacher.timeout)
        .with_max_log_length(cli.attacher.max_grpc_log_length);

    if let Some(addr) = cli.http_endpoint {
        let identity: Arc<dyn CsiIdentity> = Arc::new(csi.clone());
        let path = cli.metrics_path.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server::serve(addr, &path, identity, token).await {
                error!(%addr, error = %e, "http endpoint failed");
            }
        });
    }

    let probe_policy = libcsi::retry_policy(PROBE_RETRY_START, PROBE_RETRY_MAX);
    libcsi::probe_forever(&csi, probe_policy).await;
    let driver = libcsi::driver_name(&csi)
        .await
        .context("failed to read the CSI driver name")?;
    info!(%driver, "CSI driver is ready");

    let client = kube_client(&cli).await?;

    let leadership = if cli.leader_election.enabled {
        let elector = LeaderElector::new(client.clone(), &driver, cli.leader_election.clone());
        match elector.acquire(&shutdown).await? {
            Some(leadership) => Some(tokio::spawn(leadership.hold(shutdown.clone()))),
            None => return exit_status(&connection_lost),
        }
    } else {
        None
    };

    let (cluster, events) = KubeCluster::start(client, &shutdown);
    let handler = build_handler(&driver, &csi, cluster.clone(), &cli.attacher).await?;
    let controller = Arc::new(Controller::new(&driver, cluster, handler, &cli.attacher));
    controller
        .run(events, shutdown.clone())
        .await
        .context("controller failed")?;
    shutdown.cancel();

    if let Some(leadership) = leadership {
        leadership
            .await
            .context("leader election task panicked")?
            .context("lost leadership")?;
    }
    exit_status(&connection_lost)
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn kube_client(cli: &Cli) -> anyhow::Result<Client> {
    let config = match &cli.kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("invalid kubeconfig")?
        }
        None => kube::Config::infer()
            .await
            .context("failed to infer kubernetes configuration")?,
    };
    k8s::client(config, ApiRate::new(cli.kube_api_qps, cli.kube_api_burst))
        .context("failed to build kubernetes client")
}

/// Pick the handler matching what the driver can do.
async fn build_handler(
    driver: &str,
    csi: &CsiClient,
    cluster: Arc<KubeCluster>,
    config: &AttacherConfig,
) -> anyhow::Result<Arc<dyn Handler>> {
    let cluster: Arc<dyn Cluster> = cluster;
    if !libcsi::supports_controller_service(csi)
        .await
        .context("failed to read plugin capabilities")?
    {
        info!("driver has no controller service, attachments are recorded only");
        return Ok(Arc::new(TrivialHandler::new(cluster)));
    }
    let caps = csi
        .controller_get_capabilities()
        .await
        .context("failed to read controller capabilities")?;
    if !caps.supports_attach() {
        info!("driver does not publish volumes, attachments are recorded only");
        return Ok(Arc::new(TrivialHandler::new(cluster)));
    }

    info!(
        readonly = caps.supports_readonly_attach(),
        list_published = caps.supports_list_volumes_published_nodes(),
        "driver publishes volumes"
    );
    let attacher = Arc::new(MetricsAttacher::new(Arc::new(CsiAttacher::new(
        csi.clone(),
        config.max_entries,
    ))));
    Ok(Arc::new(
        CsiHandler::new(driver, cluster, attacher)
            .with_default_fs_type(&config.default_fstype)
            .with_readonly_publish(caps.supports_readonly_attach())
            .with_list_published_nodes(caps.supports_list_volumes_published_nodes()),
    ))
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            let _ = ctrl_c.await;
        }
    }
    info!("shutting down");
    shutdown.cancel();
}

fn exit_status(connection_lost: &AtomicBool) -> anyhow::Result<()> {
    if connection_lost.load(Ordering::SeqCst) {
        bail!("lost connection to the CSI driver");
    }
    Ok(())
}
