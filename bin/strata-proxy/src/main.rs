//! Strata proxy
//!
//! The stateless HTTP front door: translates the REST surface into auth,
//! metadata and storage RPC sequences, owns the group channel pool and
//! the upload registry, and runs the expired-blob sweep.

mod handlers;
mod pool;
mod registry;
mod rpc;
mod sweep;

use anyhow::Result;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use handlers::AppState;
use pool::GroupPool;
use registry::UploadRegistry;
use std::sync::Arc;
use std::time::Duration;
use strata_common::{load_config, ProxyConfig, MAX_TRANSPORT_SIZE};
use strata_proto::auth::auth_service_client::AuthServiceClient;
use strata_proto::metadata::metadata_service_client::MetadataServiceClient;
use tokio::net::TcpListener;
use tonic::transport::Endpoint;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "strata-proxy")]
#[command(about = "Strata HTTP proxy")]
#[command(version)]
struct Args {
    /// Listen address
    #[arg(long, default_value = "127.0.0.1:8083")]
    address: String,

    /// Auth server address
    #[arg(long, default_value = "127.0.0.1:8082")]
    auth: String,

    /// Metadata server address
    #[arg(long, default_value = "127.0.0.1:8081")]
    metadata: String,

    /// Config file path
    #[arg(long, default_value = "../config/proxy.json")]
    config: String,

    /// Use debug level of logging
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting strata proxy");
    let config: ProxyConfig = load_config(&args.config)?;
    info!(auth = %args.auth, metadata = %args.metadata, "upstream endpoints");

    // Lazy channels: the proxy starts regardless of service start order
    // and failures surface per request.
    let auth_channel = Endpoint::from_shared(format!("http://{}", args.auth))?.connect_lazy();
    let meta_channel = Endpoint::from_shared(format!("http://{}", args.metadata))?.connect_lazy();
    let auth = AuthServiceClient::new(auth_channel)
        .max_decoding_message_size(MAX_TRANSPORT_SIZE)
        .max_encoding_message_size(MAX_TRANSPORT_SIZE);
    let meta = MetadataServiceClient::new(meta_channel)
        .max_decoding_message_size(MAX_TRANSPORT_SIZE)
        .max_encoding_message_size(MAX_TRANSPORT_SIZE);

    let pool = Arc::new(GroupPool::new(config.max_groups));
    let uploads = Arc::new(UploadRegistry::new());
    let execute_timeout = Duration::from_millis(config.execute_timeout_ms);

    let sweeper = sweep::spawn(
        pool.clone(),
        uploads.clone(),
        Duration::from_secs(config.sweep_interval_secs),
        execute_timeout,
    );

    let state = Arc::new(AppState {
        auth,
        meta,
        pool,
        uploads,
        execute_timeout,
    });

    let app = Router::new()
        .route(
            "/api/bucket",
            post(handlers::create_bucket)
                .get(handlers::list_bucket)
                .delete(handlers::delete_bucket),
        )
        .route(
            "/api/upload",
            post(handlers::create_upload).put(handlers::put_object),
        )
        .route("/api/upload/confirm", post(handlers::confirm_upload))
        .route(
            "/api/object",
            get(handlers::get_object).delete(handlers::delete_object),
        )
        .route("/api/object/meta", get(handlers::get_object_meta))
        .route("/api/object/range", get(handlers::range_object))
        .route("/api/object/list", get(handlers::list_object))
        .route("/api/user/login", post(handlers::login_user))
        .route("/api/user/grant", post(handlers::grant_user))
        .route("/api/user", post(handlers::create_user))
        .layer(DefaultBodyLimit::max(MAX_TRANSPORT_SIZE))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: std::net::SocketAddr = args.address.parse()?;
    info!(%addr, "Starting HTTP server");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;

    sweeper.abort();
    info!("Proxy shut down gracefully");
    Ok(())
}
