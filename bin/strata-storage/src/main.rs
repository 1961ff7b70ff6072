//! Strata storage server
//!
//! Hosts append-only volumes and the per-upload state machine, and
//! announces its replication group to the metadata service.

mod service;

use anyhow::Result;
use clap::Parser;
use service::StorageServer;
use std::time::Duration;
use strata_common::{load_config, StorageConfig, HEARTBEAT_INTERVAL_SECS, MAX_TRANSPORT_SIZE};
use strata_proto::metadata::{metadata_service_client::MetadataServiceClient, RegisterGroupRequest};
use strata_proto::storage::storage_service_server::StorageServiceServer;
use strata_volume::VolumeStore;
use tonic::transport::{Endpoint, Server};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "strata-storage")]
#[command(about = "Strata storage server")]
#[command(version)]
struct Args {
    /// Listen address
    #[arg(long, default_value = "127.0.0.1:8080")]
    address: String,

    /// Metadata server address
    #[arg(long, default_value = "127.0.0.1:8081")]
    metadata: String,

    /// Volume data root
    #[arg(long, default_value = "../data")]
    root: String,

    /// Config file path
    #[arg(long, default_value = "../config/storage.json")]
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

    info!("Starting strata storage server");
    let config: StorageConfig = load_config(&args.config)?;
    info!(group = %config.group_id, root = %args.root, "storage configuration loaded");

    let store = VolumeStore::open(&args.root, config.max_volume_bytes)?;
    let server = StorageServer::new(store, Duration::from_secs(config.expiration_secs));

    let advertise = if config.advertise_address.is_empty() {
        args.address.clone()
    } else {
        config.advertise_address.clone()
    };

    // Group registration doubles as the liveness heartbeat; failures are
    // retried on the next tick so the serving path never waits on the
    // metadata tier.
    let meta_endpoint = format!("http://{}", args.metadata);
    let channel = Endpoint::from_shared(meta_endpoint)?.connect_lazy();
    let group_id = config.group_id.clone();
    let heartbeat = tokio::spawn(async move {
        let mut client = MetadataServiceClient::new(channel);
        let mut ticker =
            tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            let request = RegisterGroupRequest {
                group_id: group_id.clone(),
                address: advertise.clone(),
            };
            match client.register_group(request).await {
                Ok(_) => tracing::debug!(group = %group_id, "heartbeat sent"),
                Err(e) => warn!(group = %group_id, error = %e, "group registration failed"),
            }
        }
    });

    let addr = args.address.parse()?;
    info!(%addr, "Starting gRPC server");

    let storage_service = StorageServiceServer::new(server)
        .max_decoding_message_size(MAX_TRANSPORT_SIZE)
        .max_encoding_message_size(MAX_TRANSPORT_SIZE);

    Server::builder()
        .add_service(storage_service)
        .serve_with_shutdown(addr, async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;

    heartbeat.abort();
    info!("Storage server shut down gracefully");
    Ok(())
}
