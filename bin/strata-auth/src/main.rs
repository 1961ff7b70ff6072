//! Strata auth server
//!
//! Verifies tokens and per-bucket permissions for the proxy. A superuser
//! account is bootstrapped from the config file.

mod service;

use anyhow::Result;
use clap::Parser;
use service::AuthService;
use strata_common::{load_config, AuthConfig};
use strata_proto::auth::auth_service_server::AuthServiceServer;
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "strata-auth")]
#[command(about = "Strata auth server")]
#[command(version)]
struct Args {
    /// Listen address
    #[arg(long, default_value = "127.0.0.1:8082")]
    address: String,

    /// Config file path
    #[arg(long, default_value = "../config/auth.json")]
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

    info!("Starting strata auth server");
    let config: AuthConfig = load_config(&args.config)?;

    let addr = args.address.parse()?;
    info!(%addr, "Starting gRPC server");

    Server::builder()
        .add_service(AuthServiceServer::new(AuthService::new(
            &config.root_user,
            &config.root_pass,
        )))
        .serve_with_shutdown(addr, async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;

    info!("Auth server shut down gracefully");
    Ok(())
}
