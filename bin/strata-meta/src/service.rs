//! Metadata gRPC service implementation
//!
//! All state is in-memory behind reader/writer locks: bucket tables, the
//! content-tag index that drives deduplication, and the registry of
//! storage groups used for write placement. Lock order is buckets, then
//! tags, then groups.

use parking_lot::RwLock;
use std::collections::HashMap;
use strata_proto::metadata::{
    metadata_service_server::MetadataService, CheckMetaRequest, CheckMetaResponse,
    CreateBucketRequest, CreateBucketResponse, DeleteBucketRequest, DeleteBucketResponse,
    DeleteMetaRequest, DeleteMetaResponse, GetMetaRequest, GetMetaResponse, Group,
    ListBucketRequest, ListBucketResponse, ListObjectRequest, ListObjectResponse,
    ObjectEntry, PutMetaRequest, PutMetaResponse, RangeObjectRequest, RangeObjectResponse,
    RegisterGroupRequest, RegisterGroupResponse,
};
use tonic::{Request, Response, Status};
use tracing::{debug, info};

/// Where a confirmed byte sequence lives.
#[derive(Clone, Debug)]
struct StoredLocation {
    group_id: String,
    volume_id: u64,
    offset: u64,
    size: u64,
}

/// One published object record.
#[derive(Clone, Debug)]
struct ObjectRecord {
    name: String,
    tag: String,
    location: StoredLocation,
    created_time: i64,
}

/// Content-tag index entry: the canonical location plus how many records
/// reference it.
#[derive(Clone, Debug)]
struct TagEntry {
    location: StoredLocation,
    refs: u64,
}

/// Registered storage groups, in registration order for round-robin
/// placement.
#[derive(Default)]
struct GroupTable {
    order: Vec<String>,
    members: HashMap<String, Vec<String>>,
    cursor: usize,
}

/// Metadata service state
pub struct MetaService {
    /// bucket name -> (key -> record)
    buckets: RwLock<HashMap<String, HashMap<String, ObjectRecord>>>,
    tags: RwLock<HashMap<String, TagEntry>>,
    groups: RwLock<GroupTable>,
}

impl MetaService {
    pub fn new() -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            tags: RwLock::new(HashMap::new()),
            groups: RwLock::new(GroupTable::default()),
        }
    }

    fn current_timestamp() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }

    /// Drop one reference from the tag index, removing the entry when the
    /// last reference goes away. The bytes themselves are left for an
    /// out-of-band compaction.
    fn release_tag(tags: &mut HashMap<String, TagEntry>, tag: &str) {
        if let Some(entry) = tags.get_mut(tag) {
            entry.refs -= 1;
            if entry.refs == 0 {
                tags.remove(tag);
            }
        }
    }

    fn resolve_group(&self, group_id: &str) -> Result<Group, Status> {
        let groups = self.groups.read();
        let addresses = groups
            .members
            .get(group_id)
            .cloned()
            .ok_or_else(|| Status::unavailable(format!("group not registered: {group_id}")))?;
        Ok(Group {
            group_id: group_id.to_string(),
            addresses,
        })
    }
}

impl Default for MetaService {
    fn default() -> Self {
        Self::new()
    }
}

#[tonic::async_trait]
impl MetadataService for MetaService {
    async fn create_bucket(
        &self,
        request: Request<CreateBucketRequest>,
    ) -> Result<Response<CreateBucketResponse>, Status> {
        let req = request.into_inner();
        if req.bucket.is_empty() {
            return Err(Status::invalid_argument("empty bucket name"));
        }
        let mut buckets = self.buckets.write();
        if buckets.contains_key(&req.bucket) {
            return Err(Status::already_exists(format!(
                "bucket already exists: {}",
                req.bucket
            )));
        }
        buckets.insert(req.bucket.clone(), HashMap::new());
        info!(bucket = %req.bucket, "bucket created");
        Ok(Response::new(CreateBucketResponse {}))
    }

    async fn delete_bucket(
        &self,
        request: Request<DeleteBucketRequest>,
    ) -> Result<Response<DeleteBucketResponse>, Status> {
        let req = request.into_inner();
        let mut buckets = self.buckets.write();
        let objects = buckets
            .remove(&req.bucket)
            .ok_or_else(|| Status::not_found(format!("no such bucket: {}", req.bucket)))?;

        let mut tags = self.tags.write();
        for record in objects.values() {
            Self::release_tag(&mut tags, &record.tag);
        }
        info!(bucket = %req.bucket, objects = objects.len(), "bucket deleted");
        Ok(Response::new(DeleteBucketResponse {}))
    }

    async fn list_bucket(
        &self,
        _request: Request<ListBucketRequest>,
    ) -> Result<Response<ListBucketResponse>, Status> {
        let mut names: Vec<String> = self.buckets.read().keys().cloned().collect();
        names.sort();
        Ok(Response::new(ListBucketResponse { buckets: names }))
    }

    async fn check_meta(
        &self,
        request: Request<CheckMetaRequest>,
    ) -> Result<Response<CheckMetaResponse>, Status> {
        let req = request.into_inner();
        let mut buckets = self.buckets.write();
        let objects = buckets
            .get_mut(&req.bucket)
            .ok_or_else(|| Status::not_found(format!("no such bucket: {}", req.bucket)))?;

        let mut tags = self.tags.write();
        if let Some(entry) = tags.get_mut(&req.tag) {
            // Known content: publish the record immediately so the caller
            // can skip the upload entirely. The reference is taken before
            // any old record's tag is released, so re-publishing a key
            // with its own tag cannot drop the index entry.
            entry.refs += 1;
            let location = entry.location.clone();
            if let Some(old) = objects.insert(
                req.key.clone(),
                ObjectRecord {
                    name: req.name,
                    tag: req.tag.clone(),
                    location,
                    created_time: Self::current_timestamp(),
                },
            ) {
                Self::release_tag(&mut tags, &old.tag);
            }
            debug!(bucket = %req.bucket, key = %req.key, tag = %req.tag, "deduplicated");
            return Ok(Response::new(CheckMetaResponse {
                existed: true,
                group: None,
            }));
        }
        drop(tags);

        let mut groups = self.groups.write();
        if groups.order.is_empty() {
            return Err(Status::unavailable("no storage groups registered"));
        }
        let group_id = groups.order[groups.cursor % groups.order.len()].clone();
        groups.cursor = groups.cursor.wrapping_add(1);
        let addresses = groups.members.get(&group_id).cloned().unwrap_or_default();

        Ok(Response::new(CheckMetaResponse {
            existed: false,
            group: Some(Group {
                group_id,
                addresses,
            }),
        }))
    }

    async fn put_meta(
        &self,
        request: Request<PutMetaRequest>,
    ) -> Result<Response<PutMetaResponse>, Status> {
        let req = request.into_inner();
        let mut buckets = self.buckets.write();
        let objects = buckets
            .get_mut(&req.bucket)
            .ok_or_else(|| Status::not_found(format!("no such bucket: {}", req.bucket)))?;

        let location = StoredLocation {
            group_id: req.group_id,
            volume_id: req.volume_id,
            offset: req.offset,
            size: req.size,
        };
        let mut tags = self.tags.write();
        if let Some(old) = objects.insert(
            req.key.clone(),
            ObjectRecord {
                name: req.name,
                tag: req.tag.clone(),
                location: location.clone(),
                created_time: Self::current_timestamp(),
            },
        ) {
            Self::release_tag(&mut tags, &old.tag);
        }
        tags.entry(req.tag)
            .and_modify(|entry| entry.refs += 1)
            .or_insert(TagEntry { location, refs: 1 });

        debug!(bucket = %req.bucket, key = %req.key, "object published");
        Ok(Response::new(PutMetaResponse {}))
    }

    async fn get_meta(
        &self,
        request: Request<GetMetaRequest>,
    ) -> Result<Response<GetMetaResponse>, Status> {
        let req = request.into_inner();
        let record = {
            let buckets = self.buckets.read();
            let objects = buckets
                .get(&req.bucket)
                .ok_or_else(|| Status::not_found(format!("no such bucket: {}", req.bucket)))?;
            objects
                .get(&req.key)
                .cloned()
                .ok_or_else(|| Status::not_found(format!("no such object: {}", req.key)))?
        };

        let group = self.resolve_group(&record.location.group_id)?;
        Ok(Response::new(GetMetaResponse {
            group: Some(group),
            volume_id: record.location.volume_id,
            offset: record.location.offset,
            size: record.location.size,
            name: record.name,
            created_time: record.created_time,
        }))
    }

    async fn delete_meta(
        &self,
        request: Request<DeleteMetaRequest>,
    ) -> Result<Response<DeleteMetaResponse>, Status> {
        let req = request.into_inner();
        let mut buckets = self.buckets.write();
        let objects = buckets
            .get_mut(&req.bucket)
            .ok_or_else(|| Status::not_found(format!("no such bucket: {}", req.bucket)))?;
        let record = objects
            .remove(&req.key)
            .ok_or_else(|| Status::not_found(format!("no such object: {}", req.key)))?;

        Self::release_tag(&mut self.tags.write(), &record.tag);
        debug!(bucket = %req.bucket, key = %req.key, "object deleted");
        Ok(Response::new(DeleteMetaResponse {}))
    }

    async fn range_object(
        &self,
        request: Request<RangeObjectRequest>,
    ) -> Result<Response<RangeObjectResponse>, Status> {
        let req = request.into_inner();
        let buckets = self.buckets.read();
        let objects = buckets
            .get(&req.bucket)
            .ok_or_else(|| Status::not_found(format!("no such bucket: {}", req.bucket)))?;

        let mut keys: Vec<String> = objects
            .keys()
            .filter(|key| req.from.as_str() <= key.as_str() && key.as_str() <= req.to.as_str())
            .cloned()
            .collect();
        keys.sort();
        Ok(Response::new(RangeObjectResponse { keys }))
    }

    async fn list_object(
        &self,
        request: Request<ListObjectRequest>,
    ) -> Result<Response<ListObjectResponse>, Status> {
        let req = request.into_inner();
        let buckets = self.buckets.read();
        let objects = buckets
            .get(&req.bucket)
            .ok_or_else(|| Status::not_found(format!("no such bucket: {}", req.bucket)))?;

        let mut entries: Vec<ObjectEntry> = objects
            .iter()
            .map(|(key, record)| ObjectEntry {
                key: key.clone(),
                name: record.name.clone(),
                size: record.location.size,
                created_time: record.created_time,
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(Response::new(ListObjectResponse { objects: entries }))
    }

    async fn register_group(
        &self,
        request: Request<RegisterGroupRequest>,
    ) -> Result<Response<RegisterGroupResponse>, Status> {
        let req = request.into_inner();
        if req.group_id.is_empty() || req.address.is_empty() {
            return Err(Status::invalid_argument("empty group id or address"));
        }

        let mut groups = self.groups.write();
        let members = groups.members.entry(req.group_id.clone()).or_default();
        if !members.contains(&req.address) {
            members.push(req.address.clone());
            info!(group = %req.group_id, address = %req.address, "replica registered");
        }
        if !groups.order.contains(&req.group_id) {
            groups.order.push(req.group_id);
        }
        Ok(Response::new(RegisterGroupResponse {}))
    }
}
