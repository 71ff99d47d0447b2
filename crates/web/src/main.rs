mod handlers;

use std::{
    fs::File,
    io::BufReader,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use axum::{
    Router,
    extract::{ConnectInfo, FromRef},
    http::{HeaderName, Request, StatusCode, header},
};
use power_check_bench::{shell::ShellBench, storage};
use power_check_circleci::{
    CircleCi,
    poller::{PipelinePoller, PollSettings},
};
use power_check_core::config::Config;
use power_check_github::GitHubApp;
use power_check_jobs::{DedupGuard, Dispatcher, JobContext, JobQueue, Worker};
use tokio::{net::TcpListener, signal, sync::Mutex};
use tower::ServiceBuilder;
use tower_http::{
    ServiceBuilderExt,
    normalize_path::NormalizePathLayer,
    timeout::TimeoutLayer,
    trace::{DefaultOnResponse, MakeSpan, TraceLayer},
};
use tracing::{Level, Span};
use tracing_subscriber::{
    EnvFilter, Layer, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::handlers::build_router;

const CONFIG_ENV: &str = "POWER_CHECK_CONFIG";

#[derive(Clone, FromRef)]
pub struct AppState {
    config: Arc<Config>,
    dispatcher: Arc<Dispatcher>,
}

#[tokio::main]
async fn main() {
    let env_filter = EnvFilter::builder()
        // Default to info level
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    let config_path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| "config.yml".to_string());
    let config = load_config(&config_path).expect("Failed to load config file");
    tracing::info!("Loaded {} (repository {})", config_path, config.github.repository);

    let github = GitHubApp::new(&config.github.app).expect("Failed to load GitHub app key");
    let circleci = CircleCi::new(&config.circleci).expect("Failed to create CircleCI client");
    let store = storage::from_config(&config.storage).expect("Failed to create storage client");
    let poller = PipelinePoller::new(Arc::new(circleci), PollSettings::from(&config.circleci));

    let job_context = JobContext {
        config: config.clone(),
        poller,
        bench: Arc::new(ShellBench::new(config.measurement.clone())),
        store,
        bench_lock: Arc::new(Mutex::new(())),
    };
    let (queue, jobs) = JobQueue::new();
    let worker = Worker::new(job_context, jobs, config.worker);
    let dispatcher = Dispatcher::new(config.clone(), Arc::new(github), DedupGuard::new(), queue);
    let state = AppState { config: config.clone(), dispatcher: Arc::new(dispatcher) };

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.server.port));
    tracing::info!("Web server: Listening on {}", addr);
    let listener = TcpListener::bind(addr).await.expect("bind error");
    let router = app(state).into_make_service_with_connect_info::<SocketAddr>();

    // Run the web server and worker concurrently, with graceful shutdown
    let web_server = async {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("Web server error");
        tracing::info!("Web server stopped");
        result
    };
    let job_worker = async {
        worker.run(shutdown_signal()).await;
        tracing::info!("Job worker stopped");
    };

    let (result, ()) = tokio::join!(web_server, job_worker);
    if let Err(e) = result {
        tracing::error!("{e:?}");
    }
    tracing::info!("Shut down gracefully");
}

fn load_config(path: &str) -> anyhow::Result<Arc<Config>> {
    let file = BufReader::new(File::open(path).with_context(|| format!("Failed to open {path}"))?);
    let config: Config =
        serde_yaml::from_reader(file).with_context(|| format!("Failed to parse {path}"))?;
    Ok(Arc::new(config))
}

fn app(state: AppState) -> Router {
    let sensitive_headers: Arc<[_]> = vec![
        header::AUTHORIZATION,
        HeaderName::from_static("x-hub-signature"),
        HeaderName::from_static("x-hub-signature-256"),
    ]
    .into();
    let middleware = ServiceBuilder::new()
        .sensitive_request_headers(sensitive_headers)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(MyMakeSpan { level: Level::INFO })
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(30),
        ))
        .layer(NormalizePathLayer::trim_trailing_slash());
    build_router().with_state(state).layer(middleware)
}

async fn shutdown_signal() {
    if let Err(e) = shutdown_signal_io().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}

async fn shutdown_signal_io() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result,
            _ = sigterm.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await
    }
}

#[derive(Debug, Clone)]
pub struct MyMakeSpan {
    level: Level,
}

impl<B> MakeSpan<B> for MyMakeSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let delivery = request
            .headers()
            .get("X-GitHub-Delivery")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");
        let forwarded_for = request.headers().get("X-Forwarded-For");
        let ip = if let Some(v) = forwarded_for {
            v.to_str()
                .ok()
                .and_then(|s| s.split(',').next())
                .and_then(|s| IpAddr::from_str(s.trim()).ok())
        } else if let Some(ConnectInfo(socket_addr)) =
            request.extensions().get::<ConnectInfo<SocketAddr>>()
        {
            Some(socket_addr.ip())
        } else {
            None
        };
        let ip = ip.unwrap_or(IpAddr::from([0, 0, 0, 0]));
        let user_agent = request
            .headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("[unknown]");
        macro_rules! make_span {
            ($level:expr) => {
                tracing::span!(
                    $level,
                    "request",
                    method = %request.method(),
                    uri = %request.uri(),
                    ip = %ip,
                    user_agent = %user_agent,
                    delivery = %delivery,
                )
            }
        }
        match self.level {
            Level::ERROR => make_span!(Level::ERROR),
            Level::WARN => make_span!(Level::WARN),
            Level::INFO => make_span!(Level::INFO),
            Level::DEBUG => make_span!(Level::DEBUG),
            Level::TRACE => make_span!(Level::TRACE),
        }
    }
}
