//! Storage gRPC service implementation

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use strata_proto::storage::{
    storage_service_server::StorageService, CheckBlobRequest, CheckBlobResponse, ConfirmRequest,
    ConfirmResponse, CreateRequest, CreateResponse, GetRequest, GetResponse, PutRequest,
    PutResponse,
};
use strata_volume::VolumeStore;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

/// A pending upload as the server tracks it. The volume store owns the
/// region itself; this table adds the tag and the activity clock that
/// drives expiration.
#[derive(Clone, Debug)]
struct PendingUpload {
    tag: String,
    volume_id: u64,
    offset: u64,
    last_activity: Instant,
}

/// Storage server state: one volume store plus the pending-upload table.
pub struct StorageServer {
    store: VolumeStore,
    pending: Mutex<HashMap<String, PendingUpload>>,
    /// Pending uploads older than this are reported by CheckBlob and
    /// aborted. Must exceed the proxy sweep period, or an upload could be
    /// reclaimed while its confirm is in flight.
    expiration: Duration,
}

impl StorageServer {
    pub fn new(store: VolumeStore, expiration: Duration) -> Self {
        Self {
            store,
            pending: Mutex::new(HashMap::new()),
            expiration,
        }
    }

    /// Number of pending uploads (diagnostic).
    #[allow(dead_code)]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[tonic::async_trait]
impl StorageService for StorageServer {
    async fn create(
        &self,
        request: Request<CreateRequest>,
    ) -> Result<Response<CreateResponse>, Status> {
        let req = request.into_inner();
        if req.id.is_empty() {
            return Err(Status::invalid_argument("empty upload id"));
        }

        // A repeated Create for the same id acknowledges without
        // re-reserving; the proxy retries across replicas.
        if let Some(upload) = self.pending.lock().get(&req.id) {
            if upload.tag != req.tag {
                return Err(Status::invalid_argument(
                    "upload id already bound to a different tag",
                ));
            }
            return Ok(Response::new(CreateResponse {}));
        }

        let (volume_id, offset) = self.store.reserve(&req.id, None).map_err(Status::from)?;
        self.pending.lock().insert(
            req.id.clone(),
            PendingUpload {
                tag: req.tag,
                volume_id,
                offset,
                last_activity: Instant::now(),
            },
        );
        debug!(id = %req.id, volume_id, offset, "upload created");
        Ok(Response::new(CreateResponse {}))
    }

    async fn put(&self, request: Request<PutRequest>) -> Result<Response<PutResponse>, Status> {
        let req = request.into_inner();
        {
            let mut pending = self.pending.lock();
            let upload = pending
                .get_mut(&req.id)
                .ok_or_else(|| Status::invalid_argument("invalid upload id value"))?;
            upload.last_activity = Instant::now();
        }

        self.store
            .write_at(&req.id, req.offset, &req.body)
            .map_err(Status::from)?;
        Ok(Response::new(PutResponse {}))
    }

    async fn confirm(
        &self,
        request: Request<ConfirmRequest>,
    ) -> Result<Response<ConfirmResponse>, Status> {
        let req = request.into_inner();
        if !self.pending.lock().contains_key(&req.id) {
            return Err(Status::invalid_argument("invalid upload id value"));
        }

        let region = self.store.commit(&req.id).map_err(Status::from)?;
        self.pending.lock().remove(&req.id);
        info!(id = %req.id, volume_id = region.volume_id, offset = region.offset, size = region.size, "upload confirmed");
        Ok(Response::new(ConfirmResponse {
            volume_id: region.volume_id,
            offset: region.offset,
            size: region.size,
        }))
    }

    async fn check_blob(
        &self,
        _request: Request<CheckBlobRequest>,
    ) -> Result<Response<CheckBlobResponse>, Status> {
        let expired: Vec<(String, PendingUpload)> = {
            let pending = self.pending.lock();
            pending
                .iter()
                .filter(|(_, upload)| upload.last_activity.elapsed() >= self.expiration)
                .map(|(id, upload)| (id.clone(), upload.clone()))
                .collect()
        };

        let mut ids = Vec::with_capacity(expired.len());
        for (id, upload) in expired {
            debug!(id = %id, volume_id = upload.volume_id, offset = upload.offset, "aborting expired upload");
            if let Err(e) = self.store.abort(&id) {
                warn!(id = %id, error = %e, "failed to abort expired upload");
            }
            self.pending.lock().remove(&id);
            ids.push(id);
        }
        if !ids.is_empty() {
            info!(count = ids.len(), "reclaimed expired uploads");
        }
        Ok(Response::new(CheckBlobResponse { ids }))
    }

    async fn get(&self, request: Request<GetRequest>) -> Result<Response<GetResponse>, Status> {
        let req = request.into_inner();
        let body = self
            .store
            .read(req.volume_id, req.offset, req.start)
            .map_err(Status::from)?;
        Ok(Response::new(GetResponse { body }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn server(dir: &std::path::Path, expiration: Duration) -> StorageServer {
        let store = VolumeStore::open(dir, 1 << 20).unwrap();
        StorageServer::new(store, expiration)
    }

    async fn create(server: &StorageServer, tag: &str, id: &str) -> Result<(), Status> {
        server
            .create(Request::new(CreateRequest {
                tag: tag.into(),
                id: id.into(),
            }))
            .await
            .map(|_| ())
    }

    async fn put(server: &StorageServer, id: &str, offset: u64, body: &[u8]) -> Result<(), Status> {
        server
            .put(Request::new(PutRequest {
                id: id.into(),
                offset,
                body: body.to_vec(),
            }))
            .await
            .map(|_| ())
    }

    async fn confirm(server: &StorageServer, id: &str) -> Result<ConfirmResponse, Status> {
        server
            .confirm(Request::new(ConfirmRequest { id: id.into() }))
            .await
            .map(|r| r.into_inner())
    }

    #[tokio::test]
    async fn test_upload_round_trip() {
        let dir = tempdir().unwrap();
        let server = server(dir.path(), Duration::from_secs(60));

        create(&server, "sha-AAA", "u1").await.unwrap();
        put(&server, "u1", 0, b"HELLO").await.unwrap();
        let region = confirm(&server, "u1").await.unwrap();
        assert_eq!(region.size, 5);

        let body = server
            .get(Request::new(GetRequest {
                volume_id: region.volume_id,
                offset: region.offset,
                start: 0,
            }))
            .await
            .unwrap()
            .into_inner()
            .body;
        assert_eq!(body, b"HELLO");
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let dir = tempdir().unwrap();
        let server = server(dir.path(), Duration::from_secs(60));

        create(&server, "t", "u1").await.unwrap();
        create(&server, "t", "u1").await.unwrap();
        assert_eq!(server.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_out_of_order_chunks_confirm_to_max_extent() {
        let dir = tempdir().unwrap();
        let server = server(dir.path(), Duration::from_secs(60));

        create(&server, "t", "u1").await.unwrap();
        put(&server, "u1", 6, b"WORLD").await.unwrap();
        put(&server, "u1", 0, b"HELLO ").await.unwrap();
        let region = confirm(&server, "u1").await.unwrap();
        assert_eq!(region.size, 11);
    }

    #[tokio::test]
    async fn test_resumed_upload_keeps_its_region() {
        let dir = tempdir().unwrap();
        let server = server(dir.path(), Duration::from_secs(60));

        create(&server, "t", "u1").await.unwrap();
        put(&server, "u1", 0, b"HELLO").await.unwrap();
        // The client restarts and re-announces the same id.
        create(&server, "t", "u1").await.unwrap();
        put(&server, "u1", 5, b"WORLD").await.unwrap();
        let region = confirm(&server, "u1").await.unwrap();
        assert_eq!(region.size, 10);

        let body = server
            .get(Request::new(GetRequest {
                volume_id: region.volume_id,
                offset: region.offset,
                start: 0,
            }))
            .await
            .unwrap()
            .into_inner()
            .body;
        assert_eq!(body, b"HELLOWORLD");
    }

    #[tokio::test]
    async fn test_zero_byte_upload() {
        let dir = tempdir().unwrap();
        let server = server(dir.path(), Duration::from_secs(60));

        create(&server, "t", "u1").await.unwrap();
        put(&server, "u1", 0, b"").await.unwrap();
        let region = confirm(&server, "u1").await.unwrap();
        assert_eq!(region.size, 0);

        let body = server
            .get(Request::new(GetRequest {
                volume_id: region.volume_id,
                offset: region.offset,
                start: 0,
            }))
            .await
            .unwrap()
            .into_inner()
            .body;
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_put_and_confirm_unknown_id() {
        let dir = tempdir().unwrap();
        let server = server(dir.path(), Duration::from_secs(60));

        let err = put(&server, "ghost", 0, b"x").await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
        let err = confirm(&server, "ghost").await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_confirm_twice_rejects_second() {
        let dir = tempdir().unwrap();
        let server = server(dir.path(), Duration::from_secs(60));

        create(&server, "t", "u1").await.unwrap();
        put(&server, "u1", 0, b"x").await.unwrap();
        confirm(&server, "u1").await.unwrap();
        let err = confirm(&server, "u1").await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_check_blob_reclaims_stale_uploads() {
        let dir = tempdir().unwrap();
        let server = server(dir.path(), Duration::ZERO);

        create(&server, "t", "stale").await.unwrap();
        let ids = server
            .check_blob(Request::new(CheckBlobRequest {}))
            .await
            .unwrap()
            .into_inner()
            .ids;
        assert_eq!(ids, vec!["stale".to_string()]);
        assert_eq!(server.pending_count(), 0);

        // The reservation is gone: further puts are rejected.
        let err = put(&server, "stale", 0, b"x").await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_check_blob_spares_active_uploads() {
        let dir = tempdir().unwrap();
        let server = server(dir.path(), Duration::from_secs(60));

        create(&server, "t", "live").await.unwrap();
        let ids = server
            .check_blob(Request::new(CheckBlobRequest {}))
            .await
            .unwrap()
            .into_inner()
            .ids;
        assert!(ids.is_empty());
        assert_eq!(server.pending_count(), 1);
    }
}
