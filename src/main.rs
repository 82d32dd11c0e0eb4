use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use anyhow::Context as _;
use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use prometheus::{Encoder, TextEncoder};
use tracing::*;

pub use member_operator::{self, telemetry, Metrics, State};
use member_operator::host::{monitor_health, HostCluster, HostClusterRegistry};
use member_operator::telemetry::LogFormat;

#[derive(Debug, clap::Parser)]
struct Arguments {
    /// Namespace holding the NSTemplateSets
    #[arg(
        long = "watch-namespace",
        env = "WATCH_NAMESPACE",
        default_value = "toolchain-member-operator"
    )]
    watch_namespace: String,

    /// Namespace of the host operator, holding the TierTemplates
    #[arg(
        long = "host-operator-namespace",
        env = "HOST_OPERATOR_NAMESPACE",
        default_value = "toolchain-host-operator"
    )]
    host_operator_namespace: String,

    /// Kubeconfig of the host cluster; the in-cluster config is used when absent
    #[arg(long = "host-kubeconfig", env = "HOST_KUBECONFIG", value_name = "PATH")]
    host_kubeconfig: Option<PathBuf>,

    #[arg(
        long = "host-health-check-period-seconds",
        env = "HOST_HEALTH_CHECK_PERIOD_SECONDS",
        default_value_t = 10
    )]
    host_health_check_period_seconds: u64,

    #[arg(
        long = "metrics-bind-address",
        env = "METRICS_BIND_ADDRESS",
        default_value = "0.0.0.0:8080"
    )]
    metrics_bind_address: SocketAddr,

    #[arg(long = "log-format", env = "LOG_FORMAT", value_enum, default_value_t)]
    log_format: LogFormat,

    /// OTLP collector receiving the reconcile spans
    #[arg(long = "otlp-endpoint", env = "OPENTELEMETRY_ENDPOINT_URL")]
    otlp_endpoint: Option<String>,
}

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    match encoder.encode(&metrics, &mut buffer) {
        Ok(()) => HttpResponse::Ok().body(buffer),
        Err(e) => HttpResponse::InternalServerError().body(e.to_string()),
    }
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

async fn host_client(member: &Client, kubeconfig: Option<&PathBuf>) -> anyhow::Result<Client> {
    let Some(path) = kubeconfig else {
        info!("no host kubeconfig given, using the member cluster as host");
        return Ok(member.clone());
    };
    let kubeconfig = Kubeconfig::read_from(path)
        .with_context(|| format!("reading host kubeconfig {}", path.display()))?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .context("loading host kubeconfig")?;
    Ok(Client::try_from(config)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Arguments = Arguments::parse();
    telemetry::init(args.log_format, args.otlp_endpoint.clone())?;

    let client = Client::try_default()
        .await
        .context("creating the member cluster client")?;

    let host = host_client(&client, args.host_kubeconfig.as_ref()).await?;
    let registry = Arc::new(HostClusterRegistry::new());
    registry.register(HostCluster {
        client: Arc::new(host.clone()),
        operator_namespace: args.host_operator_namespace,
        ready: false,
    });

    // Controller state shared with the web server
    let state = State::new(args.watch_namespace, registry.clone());
    let operator_metrics = Metrics::default().register(&state.registry)?;

    tokio::spawn(monitor_health(
        registry,
        host,
        operator_metrics.clone(),
        Duration::from_secs(args.host_health_check_period_seconds),
    ));

    let controller =
        member_operator::controllers::nstemplateset::run(client, operator_metrics, state.clone());
    tokio::pin!(controller);

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind(args.metrics_bind_address)?
    .shutdown_timeout(5)
    .run();

    tokio::pin!(server);

    // Both runtimes implements graceful shutdown, so poll until both are done
    tokio::join!(controller, server).1?;
    Ok(())
}
