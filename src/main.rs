//! Folder Mock Server - CLI Entry Point

use anyhow::{Context, Result};
use clap::Parser;
use folder_mock_server::config::parse_host_list;
use folder_mock_server::store::DatabaseConfig;
use folder_mock_server::{
    metrics, router, CatalogStore, MemoryCatalog, MockServer, PgCatalog, RequestLogSink,
    ServerConfig,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "folder-mock-server",
    about = "Programmable HTTP mock server with folder namespaces and proxy fallback",
    version
)]
struct Args {
    /// Listener address
    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// Catalog database host
    #[arg(long, env = "DB_HOST")]
    db_host: Option<String>,

    #[arg(long, env = "DB_PORT", default_value_t = 5432)]
    db_port: u16,

    #[arg(long, env = "DB_NAME")]
    db_name: Option<String>,

    #[arg(long, env = "DB_USER")]
    db_user: Option<String>,

    #[arg(long, env = "DB_PASSWORD", hide_env_values = true)]
    db_password: Option<String>,

    /// YAML catalog served from memory instead of the database
    #[arg(long, env = "CATALOG_FILE")]
    catalog_file: Option<PathBuf>,

    /// TTL for mocks without their own, in seconds (0 disables caching)
    #[arg(long, env = "DEFAULT_CACHE_TTL_SECONDS", default_value_t = 0)]
    default_cache_ttl_seconds: u64,

    /// Requests per client per window (0 disables the limiter)
    #[arg(long, env = "RATE_LIMIT_REQUESTS", default_value_t = 0)]
    rate_limit_requests: u64,

    #[arg(long, env = "RATE_LIMIT_WINDOW_SECONDS", default_value_t = 60)]
    rate_limit_window_seconds: u64,

    /// Inbound body cap in bytes (0 disables the cap)
    #[arg(long, env = "MAX_REQUEST_BODY_BYTES", default_value_t = 10 * 1024 * 1024)]
    max_request_body_bytes: usize,

    /// Comma-separated upstream hosts the proxy may contact
    #[arg(long, env = "ALLOWED_PROXY_HOSTS", default_value = "")]
    allowed_proxy_hosts: String,

    #[arg(long, env = "UPSTREAM_TIMEOUT_SECONDS", default_value_t = 30)]
    upstream_timeout_seconds: u64,

    /// Whole-request deadline in seconds (0 disables it)
    #[arg(long, env = "REQUEST_TIMEOUT_SECONDS", default_value_t = 120)]
    request_timeout_seconds: u64,

    /// Base URL clients use to reach this server, for Location rewriting
    #[arg(long, env = "PUBLIC_URL")]
    public_url: Option<String>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short = 'L', long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Validate configuration and catalog, then exit
    #[arg(long)]
    validate: bool,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            default_cache_ttl_seconds: self.default_cache_ttl_seconds,
            rate_limit_requests: self.rate_limit_requests,
            rate_limit_window_seconds: self.rate_limit_window_seconds,
            max_request_body_bytes: self.max_request_body_bytes,
            allowed_proxy_hosts: parse_host_list(&self.allowed_proxy_hosts),
            upstream_timeout_seconds: self.upstream_timeout_seconds,
            request_timeout_seconds: self.request_timeout_seconds,
            public_url: self.public_url.clone(),
        }
    }

    fn database_config(&self) -> Result<DatabaseConfig> {
        let required = |value: &Option<String>, name: &str| {
            value
                .clone()
                .with_context(|| format!("{} is required unless --catalog-file is given", name))
        };
        Ok(DatabaseConfig {
            host: required(&self.db_host, "DB_HOST")?,
            port: self.db_port,
            name: required(&self.db_name, "DB_NAME")?,
            user: required(&self.db_user, "DB_USER")?,
            password: required(&self.db_password, "DB_PASSWORD")?,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .context("Invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = args.server_config();
    config.validate()?;

    // Select the catalog backend
    let (catalog, sink): (Arc<dyn CatalogStore>, Arc<dyn RequestLogSink>) = match &args.catalog_file {
        Some(path) => {
            info!(path = %path.display(), "Using in-memory catalog");
            let catalog = Arc::new(MemoryCatalog::from_file(path)?);
            (catalog.clone(), catalog)
        }
        None => {
            let db = args.database_config()?;
            let catalog = Arc::new(PgCatalog::connect(&db).await?);
            catalog.bootstrap().await?;
            (catalog.clone(), catalog)
        }
    };

    // Validate and exit if requested
    if args.validate {
        catalog.ping().await?;
        println!("Configuration is valid");
        return Ok(());
    }

    metrics::register_process_metrics();

    let server = Arc::new(MockServer::new(config, catalog, sink)?);
    let app = router(server);

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("Cannot bind {}", args.bind))?;
    info!(address = %args.bind, "Mock server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Mock server stopped");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigint, mut sigterm) = match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
        (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
        _ => {
            tracing::warn!("Cannot install signal handlers, shutdown only by termination");
            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}
