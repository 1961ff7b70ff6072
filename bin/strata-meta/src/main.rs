//! Strata metadata server
//!
//! Serves bucket and object records, content-tag deduplication and write
//! placement over registered storage groups. The proxy treats this tier as
//! a linearizable key-value service.

mod service;

use anyhow::Result;
use clap::Parser;
use service::MetaService;
use strata_common::MAX_TRANSPORT_SIZE;
use strata_proto::metadata::metadata_service_server::MetadataServiceServer;
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "strata-meta")]
#[command(about = "Strata metadata server")]
#[command(version)]
struct Args {
    /// Listen address
    #[arg(long, default_value = "127.0.0.1:8081")]
    address: String,

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

    info!("Starting strata metadata server");

    let addr = args.address.parse()?;
    info!(%addr, "Starting gRPC server");

    let metadata_service = MetadataServiceServer::new(MetaService::new())
        .max_decoding_message_size(MAX_TRANSPORT_SIZE)
        .max_encoding_message_size(MAX_TRANSPORT_SIZE);

    Server::builder()
        .add_service(metadata_service)
        .serve_with_shutdown(addr, async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;

    info!("Metadata server shut down gracefully");
    Ok(())
}
