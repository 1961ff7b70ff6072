//! Storage RPC wrappers with replica failover
//!
//! Every storage call runs under one wall-clock deadline. Put, Confirm,
//! Get and CheckBlob rotate round-robin across the group's replicas,
//! advancing on any error and returning the last error once the deadline
//! passes: replicas are LAN-local, so a failure means a down (or
//! divergent) replica rather than congestion, and no backoff is applied.
//! Create instead fans out to every replica so that any of them can serve
//! the rest of the upload.

use std::future::Future;
use std::time::Duration;
use strata_proto::storage::{
    storage_service_client::StorageServiceClient, CheckBlobRequest, CheckBlobResponse,
    ConfirmRequest, ConfirmResponse, CreateRequest, GetRequest, GetResponse, PutRequest,
    PutResponse,
};
use tokio::task::JoinSet;
use tonic::transport::Channel;
use tonic::Status;
use tracing::warn;

type Client = StorageServiceClient<Channel>;

/// Round-robin rotation under a wall-clock deadline.
async fn rotate<T, F, Fut>(clients: &[Client], timeout: Duration, mut call: F) -> Result<T, Status>
where
    F: FnMut(Client) -> Fut,
    Fut: Future<Output = Result<tonic::Response<T>, Status>>,
{
    if clients.is_empty() {
        return Err(Status::unavailable("no replicas available"));
    }
    let deadline = tokio::time::Instant::now() + timeout;
    let mut index = 0;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let error = match tokio::time::timeout(remaining, call(clients[index].clone())).await {
            Ok(Ok(response)) => return Ok(response.into_inner()),
            Ok(Err(status)) => status,
            Err(_) => Status::deadline_exceeded("storage call timed out"),
        };
        index = (index + 1) % clients.len();
        if tokio::time::Instant::now() >= deadline {
            return Err(error);
        }
    }
}

/// Reserve the upload on every replica. Succeeds when at least one
/// replica accepts; replicas that miss the create are skipped over by
/// later rotation and never catch up (no self-healing).
pub async fn send_create(
    clients: &[Client],
    request: CreateRequest,
    timeout: Duration,
) -> Result<(), Status> {
    if clients.is_empty() {
        return Err(Status::unavailable("no replicas available"));
    }
    let mut attempts = JoinSet::new();
    for (replica, client) in clients.iter().cloned().enumerate() {
        let request = request.clone();
        attempts.spawn(async move {
            let mut client = client;
            let result = tokio::time::timeout(timeout, client.create(request)).await;
            (replica, result)
        });
    }

    let mut accepted = 0usize;
    let mut last_error = Status::unavailable("no replicas available");
    while let Some(joined) = attempts.join_next().await {
        let Ok((replica, result)) = joined else {
            continue;
        };
        match result {
            Ok(Ok(_)) => accepted += 1,
            Ok(Err(status)) => {
                warn!(replica, error = %status, "replica rejected create");
                last_error = status;
            }
            Err(_) => {
                warn!(replica, "replica create timed out");
                last_error = Status::deadline_exceeded("storage call timed out");
            }
        }
    }
    if accepted == 0 {
        return Err(last_error);
    }
    if accepted < clients.len() {
        warn!(accepted, replicas = clients.len(), "create not accepted by every replica");
    }
    Ok(())
}

pub async fn send_put(
    clients: &[Client],
    request: PutRequest,
    timeout: Duration,
) -> Result<PutResponse, Status> {
    rotate(clients, timeout, |mut client| {
        let request = request.clone();
        async move { client.put(request).await }
    })
    .await
}

pub async fn send_confirm(
    clients: &[Client],
    request: ConfirmRequest,
    timeout: Duration,
) -> Result<ConfirmResponse, Status> {
    rotate(clients, timeout, |mut client| {
        let request = request.clone();
        async move { client.confirm(request).await }
    })
    .await
}

pub async fn send_get(
    clients: &[Client],
    request: GetRequest,
    timeout: Duration,
) -> Result<GetResponse, Status> {
    rotate(clients, timeout, |mut client| {
        let request = request.clone();
        async move { client.get(request).await }
    })
    .await
}

pub async fn send_check_blob(
    clients: &[Client],
    request: CheckBlobRequest,
    timeout: Duration,
) -> Result<CheckBlobResponse, Status> {
    rotate(clients, timeout, |mut client| {
        let request = request.clone();
        async move { client.check_blob(request).await }
    })
    .await
}
