//! HTTP handlers
//!
//! Each handler is an (auth.Check -> metadata verb -> storage verbs)
//! sequence. RPC errors bubble to the client verbatim; only their gRPC
//! codes are translated into HTTP statuses.

use crate::pool::GroupPool;
use crate::registry::UploadRegistry;
use crate::rpc;
use axum::extract::{Query, State};
use axum::http::{header::HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use strata_common::{error::http_status, Permission};
use strata_proto::auth::{
    auth_service_client::AuthServiceClient, CheckRequest, ClearRequest,
    ConfirmRequest as AuthConfirmRequest, GrantRequest, LoginRequest, RegisterRequest,
};
use strata_proto::metadata::{
    metadata_service_client::MetadataServiceClient, CheckMetaRequest, CreateBucketRequest,
    DeleteBucketRequest, DeleteMetaRequest, GetMetaRequest, Group, ListBucketRequest,
    ListObjectRequest, PutMetaRequest, RangeObjectRequest,
};
use strata_proto::storage::{ConfirmRequest, CreateRequest, GetRequest, PutRequest};
use tonic::transport::Channel;
use tonic::{Code, Status};
use tracing::debug;

/// Sentinel returned when deduplication made the upload unnecessary, and
/// accepted from clients that have no id to resume.
const NO_UPLOAD_ID: &str = "0";

/// Shared proxy state. The registry and the pool carry their own locks;
/// the tonic clients are cheap clones over one channel each.
pub struct AppState {
    pub auth: AuthServiceClient<Channel>,
    pub meta: MetadataServiceClient<Channel>,
    pub pool: Arc<GroupPool>,
    pub uploads: Arc<UploadRegistry>,
    pub execute_timeout: Duration,
}

type Params = HashMap<String, String>;

/// An RPC status on its way out to an HTTP client.
#[derive(Debug)]
pub struct ApiError(Status);

impl From<Status> for ApiError {
    fn from(status: Status) -> Self {
        Self(status)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = StatusCode::from_u16(http_status(self.0.code()))
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (code, self.0.message().to_string()).into_response()
    }
}

fn want<'a>(params: &'a Params, key: &str) -> Result<&'a str, ApiError> {
    params
        .get(key)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| Status::invalid_argument(format!("missing parameter: {key}")).into())
}

fn want_u64(params: &Params, key: &str) -> Result<u64, ApiError> {
    want(params, key)?
        .parse()
        .map_err(|_| Status::invalid_argument(format!("invalid {key} value")).into())
}

fn want_i64(params: &Params, key: &str) -> Result<i64, ApiError> {
    want(params, key)?
        .parse()
        .map_err(|_| Status::invalid_argument(format!("{key} should be a number")).into())
}

async fn check_auth(
    state: &AppState,
    token: &str,
    bucket: &str,
    permission: Permission,
) -> Result<(), ApiError> {
    state
        .auth
        .clone()
        .check(CheckRequest {
            token: token.to_string(),
            bucket: bucket.to_string(),
            permission: permission.as_i64(),
        })
        .await?;
    Ok(())
}

fn group_or_internal(group: Option<Group>) -> Result<Group, ApiError> {
    group.ok_or_else(|| Status::internal("metadata response missing group").into())
}

// ---- bucket operations ----

pub async fn create_bucket(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
) -> Result<(), ApiError> {
    let bucket = want(&params, "bucket")?;
    let token = want(&params, "token")?;
    check_auth(&state, token, bucket, Permission::None).await?;

    state
        .meta
        .clone()
        .create_bucket(CreateBucketRequest {
            bucket: bucket.to_string(),
        })
        .await?;
    state
        .auth
        .clone()
        .confirm(AuthConfirmRequest {
            token: token.to_string(),
            bucket: bucket.to_string(),
        })
        .await?;
    Ok(())
}

pub async fn list_bucket(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
) -> Result<String, ApiError> {
    let token = want(&params, "token")?;
    check_auth(&state, token, "", Permission::None).await?;

    let response = state.meta.clone().list_bucket(ListBucketRequest {}).await?;
    Ok(response.into_inner().buckets.join(" "))
}

pub async fn delete_bucket(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
) -> Result<(), ApiError> {
    let bucket = want(&params, "bucket")?;
    let token = want(&params, "token")?;
    check_auth(&state, token, bucket, Permission::Owner).await?;

    state
        .meta
        .clone()
        .delete_bucket(DeleteBucketRequest {
            bucket: bucket.to_string(),
        })
        .await?;
    state
        .auth
        .clone()
        .clear(ClearRequest {
            bucket: bucket.to_string(),
        })
        .await?;
    Ok(())
}

// ---- upload pipeline ----

pub async fn create_upload(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
) -> Result<String, ApiError> {
    let bucket = want(&params, "bucket")?;
    let name = want(&params, "name")?;
    let key = want(&params, "key")?;
    let tag = want(&params, "tag")?;
    let token = want(&params, "token")?;
    let proposed = want(&params, "id")?;
    check_auth(&state, token, bucket, Permission::Write).await?;

    let response = state
        .meta
        .clone()
        .check_meta(CheckMetaRequest {
            bucket: bucket.to_string(),
            name: name.to_string(),
            key: key.to_string(),
            tag: tag.to_string(),
        })
        .await?
        .into_inner();
    if response.existed {
        // Deduplicated: the record is already published, nothing to upload.
        return Ok(NO_UPLOAD_ID.to_string());
    }

    // Resume: a client retrying with an id we still track keeps it.
    if proposed != NO_UPLOAD_ID && state.uploads.contains(proposed) {
        return Ok(proposed.to_string());
    }

    let group = group_or_internal(response.group)?;
    let clients = state.pool.acquire(&group)?;
    let id = UploadRegistry::mint_id();
    rpc::send_create(
        &clients,
        CreateRequest {
            tag: tag.to_string(),
            id: id.clone(),
        },
        state.execute_timeout,
    )
    .await?;
    state.uploads.insert(&id, group);
    debug!(%id, bucket, key, "upload created");
    Ok(id)
}

pub async fn put_object(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
    body: Bytes,
) -> Result<(), ApiError> {
    let id = want(&params, "id")?;
    let bucket = want(&params, "bucket")?;
    let token = want(&params, "token")?;
    check_auth(&state, token, bucket, Permission::Write).await?;
    let offset = want_u64(&params, "offset")?;

    let group = state
        .uploads
        .get(id)
        .ok_or_else(|| Status::invalid_argument("invalid upload id value"))?;
    let clients = state.pool.acquire(&group)?;
    rpc::send_put(
        &clients,
        PutRequest {
            id: id.to_string(),
            offset,
            body: body.to_vec(),
        },
        state.execute_timeout,
    )
    .await?;
    Ok(())
}

pub async fn confirm_upload(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
) -> Result<(), ApiError> {
    let id = want(&params, "id")?;
    let name = want(&params, "name")?;
    let bucket = want(&params, "bucket")?;
    let key = want(&params, "key")?;
    let tag = want(&params, "tag")?;
    let token = want(&params, "token")?;
    check_auth(&state, token, bucket, Permission::Write).await?;

    let group = state
        .uploads
        .get(id)
        .ok_or_else(|| Status::invalid_argument("invalid upload id value"))?;
    let clients = state.pool.acquire(&group)?;
    let region = match rpc::send_confirm(
        &clients,
        ConfirmRequest { id: id.to_string() },
        state.execute_timeout,
    )
    .await
    {
        Ok(region) => region,
        Err(status) if status.code() == Code::InvalidArgument => {
            // The storage tier no longer knows the id. That is "already
            // confirmed" only when the record was in fact published.
            let published = state
                .meta
                .clone()
                .get_meta(GetMetaRequest {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                })
                .await
                .is_ok();
            if published {
                return Ok(());
            }
            return Err(status.into());
        }
        Err(status) => return Err(status.into()),
    };

    state
        .meta
        .clone()
        .put_meta(PutMetaRequest {
            bucket: bucket.to_string(),
            key: key.to_string(),
            tag: tag.to_string(),
            name: name.to_string(),
            group_id: group.group_id,
            volume_id: region.volume_id,
            offset: region.offset,
            size: region.size,
        })
        .await?;
    debug!(%id, bucket, key, size = region.size, "upload confirmed");
    Ok(())
}

// ---- object operations ----

pub async fn get_object(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    let bucket = want(&params, "bucket")?;
    let key = want(&params, "key")?;
    let token = want(&params, "token")?;
    let start = want_u64(&params, "start")?;
    check_auth(&state, token, bucket, Permission::Read).await?;

    let meta = state
        .meta
        .clone()
        .get_meta(GetMetaRequest {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
        .await?
        .into_inner();
    let group = group_or_internal(meta.group)?;
    let clients = state.pool.acquire(&group)?;
    let response = rpc::send_get(
        &clients,
        GetRequest {
            volume_id: meta.volume_id,
            offset: meta.offset,
            start,
        },
        state.execute_timeout,
    )
    .await?;

    let name = HeaderValue::from_str(&meta.name)
        .map_err(|_| Status::internal("object name is not a valid header value"))?;
    Ok(([(HeaderName::from_static("name"), name)], response.body).into_response())
}

pub async fn delete_object(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
) -> Result<(), ApiError> {
    let bucket = want(&params, "bucket")?;
    let key = want(&params, "key")?;
    let token = want(&params, "token")?;
    check_auth(&state, token, bucket, Permission::Write).await?;

    state
        .meta
        .clone()
        .delete_meta(DeleteMetaRequest {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
        .await?;
    Ok(())
}

pub async fn get_object_meta(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
) -> Result<String, ApiError> {
    let bucket = want(&params, "bucket")?;
    let key = want(&params, "key")?;
    let token = want(&params, "token")?;
    check_auth(&state, token, bucket, Permission::Read).await?;

    let meta = state
        .meta
        .clone()
        .get_meta(GetMetaRequest {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
        .await?
        .into_inner();
    Ok(format!("{meta:?}"))
}

pub async fn range_object(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
) -> Result<String, ApiError> {
    let bucket = want(&params, "bucket")?;
    let from = want(&params, "from")?;
    let to = want(&params, "to")?;
    let token = want(&params, "token")?;
    check_auth(&state, token, bucket, Permission::Read).await?;

    let response = state
        .meta
        .clone()
        .range_object(RangeObjectRequest {
            bucket: bucket.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        })
        .await?;
    Ok(response.into_inner().keys.join(" "))
}

pub async fn list_object(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
) -> Result<String, ApiError> {
    let bucket = want(&params, "bucket")?;
    let token = want(&params, "token")?;
    check_auth(&state, token, bucket, Permission::Read).await?;

    let response = state
        .meta
        .clone()
        .list_object(ListObjectRequest {
            bucket: bucket.to_string(),
        })
        .await?;
    let mut listing = String::new();
    for object in response.into_inner().objects {
        let created = DateTime::from_timestamp(object.created_time, 0)
            .unwrap_or(DateTime::UNIX_EPOCH)
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        listing.push_str(&format!(
            "{} {} {} {}\n",
            object.key, object.name, object.size, created
        ));
    }
    Ok(listing)
}

// ---- user operations ----

pub async fn login_user(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
) -> Result<String, ApiError> {
    let name = want(&params, "name")?;
    let pass = want(&params, "pass")?;

    let response = state
        .auth
        .clone()
        .login(LoginRequest {
            name: name.to_string(),
            pass: pass.to_string(),
        })
        .await?;
    Ok(response.into_inner().token)
}

pub async fn grant_user(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
) -> Result<(), ApiError> {
    let name = want(&params, "name")?;
    let bucket = want(&params, "bucket")?;
    let token = want(&params, "token")?;
    let permission = want_i64(&params, "permission")?;

    state
        .auth
        .clone()
        .grant(GrantRequest {
            token: token.to_string(),
            name: name.to_string(),
            bucket: bucket.to_string(),
            permission,
        })
        .await?;
    Ok(())
}

pub async fn create_user(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
) -> Result<(), ApiError> {
    let name = want(&params, "name")?;
    let pass = want(&params, "pass")?;
    let token = want(&params, "token")?;
    let role = want_i64(&params, "role")?;

    state
        .auth
        .clone()
        .register(RegisterRequest {
            token: token.to_string(),
            name: name.to_string(),
            pass: pass.to_string(),
            role,
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_want_rejects_missing_and_empty() {
        let mut params = Params::new();
        params.insert("bucket".into(), "b".into());
        params.insert("token".into(), String::new());

        assert_eq!(want(&params, "bucket").unwrap(), "b");
        assert!(want(&params, "token").is_err());
        assert!(want(&params, "key").is_err());
    }

    #[test]
    fn test_want_u64_rejects_garbage() {
        let mut params = Params::new();
        params.insert("offset".into(), "12".into());
        params.insert("start".into(), "-3".into());

        assert_eq!(want_u64(&params, "offset").unwrap(), 12);
        assert!(want_u64(&params, "start").is_err());
    }

    #[test]
    fn test_api_error_maps_codes() {
        let response = ApiError::from(Status::not_found("gone")).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = ApiError::from(Status::permission_denied("no")).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = ApiError::from(Status::unavailable("down")).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
