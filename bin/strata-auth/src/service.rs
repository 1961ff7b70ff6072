//! Auth gRPC service implementation

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use strata_common::{Permission, Role};
use strata_proto::auth::{
    auth_service_server::AuthService as AuthServiceTrait, CheckRequest, CheckResponse,
    ClearRequest, ClearResponse, ConfirmRequest, ConfirmResponse, GrantRequest, GrantResponse,
    LoginRequest, LoginResponse, RegisterRequest, RegisterResponse,
};
use tonic::{Request, Response, Status};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Clone, Debug)]
struct User {
    pass_digest: String,
    role: Role,
    /// Current login token, replaced on every login
    token: Option<String>,
}

/// Auth service state: accounts, live tokens and per-bucket grants.
/// Lock order is users, then tokens, then acls.
pub struct AuthService {
    users: RwLock<HashMap<String, User>>,
    /// token -> user name
    tokens: RwLock<HashMap<String, String>>,
    /// bucket -> (user name -> permission)
    acls: RwLock<HashMap<String, HashMap<String, Permission>>>,
}

impl AuthService {
    /// Create the service with a bootstrapped superuser.
    pub fn new(root_user: &str, root_pass: &str) -> Self {
        let mut users = HashMap::new();
        users.insert(
            root_user.to_string(),
            User {
                pass_digest: Self::digest(root_pass),
                role: Role::Super,
                token: None,
            },
        );
        info!(user = root_user, "superuser bootstrapped");
        Self {
            users: RwLock::new(users),
            tokens: RwLock::new(HashMap::new()),
            acls: RwLock::new(HashMap::new()),
        }
    }

    fn digest(pass: &str) -> String {
        hex::encode(Sha256::digest(pass.as_bytes()))
    }

    /// Resolve a token to (user name, role).
    fn resolve(&self, token: &str) -> Result<(String, Role), Status> {
        let name = self
            .tokens
            .read()
            .get(token)
            .cloned()
            .ok_or_else(|| Status::unauthenticated("invalid token"))?;
        let role = self
            .users
            .read()
            .get(&name)
            .map(|user| user.role)
            .ok_or_else(|| Status::unauthenticated("invalid token"))?;
        Ok((name, role))
    }

    fn grant_level(&self, bucket: &str, name: &str) -> Permission {
        self.acls
            .read()
            .get(bucket)
            .and_then(|grants| grants.get(name).copied())
            .unwrap_or(Permission::None)
    }
}

#[tonic::async_trait]
impl AuthServiceTrait for AuthService {
    async fn login(
        &self,
        request: Request<LoginRequest>,
    ) -> Result<Response<LoginResponse>, Status> {
        let req = request.into_inner();
        let mut users = self.users.write();
        let user = users
            .get_mut(&req.name)
            .ok_or_else(|| Status::unauthenticated("invalid name or password"))?;
        if user.pass_digest != Self::digest(&req.pass) {
            return Err(Status::unauthenticated("invalid name or password"));
        }

        let token = Uuid::new_v4().simple().to_string();
        let mut tokens = self.tokens.write();
        if let Some(old) = user.token.take() {
            tokens.remove(&old);
        }
        tokens.insert(token.clone(), req.name.clone());
        user.token = Some(token.clone());

        debug!(user = %req.name, "login");
        Ok(Response::new(LoginResponse { token }))
    }

    async fn check(
        &self,
        request: Request<CheckRequest>,
    ) -> Result<Response<CheckResponse>, Status> {
        let req = request.into_inner();
        let required = Permission::try_from(req.permission).map_err(Status::from)?;
        let (name, role) = self.resolve(&req.token)?;

        if role == Role::Super || required == Permission::None {
            return Ok(Response::new(CheckResponse {}));
        }
        if self.grant_level(&req.bucket, &name) < required {
            return Err(Status::permission_denied(format!(
                "{name} lacks {required} on {}",
                req.bucket
            )));
        }
        Ok(Response::new(CheckResponse {}))
    }

    async fn confirm(
        &self,
        request: Request<ConfirmRequest>,
    ) -> Result<Response<ConfirmResponse>, Status> {
        let req = request.into_inner();
        let (name, _) = self.resolve(&req.token)?;
        self.acls
            .write()
            .entry(req.bucket.clone())
            .or_default()
            .insert(name.clone(), Permission::Owner);
        debug!(user = %name, bucket = %req.bucket, "ownership recorded");
        Ok(Response::new(ConfirmResponse {}))
    }

    async fn clear(
        &self,
        request: Request<ClearRequest>,
    ) -> Result<Response<ClearResponse>, Status> {
        let req = request.into_inner();
        self.acls.write().remove(&req.bucket);
        debug!(bucket = %req.bucket, "grants cleared");
        Ok(Response::new(ClearResponse {}))
    }

    async fn grant(
        &self,
        request: Request<GrantRequest>,
    ) -> Result<Response<GrantResponse>, Status> {
        let req = request.into_inner();
        let level = Permission::try_from(req.permission).map_err(Status::from)?;
        let (caller, role) = self.resolve(&req.token)?;

        if !self.users.read().contains_key(&req.name) {
            return Err(Status::not_found(format!("no such user: {}", req.name)));
        }
        if role != Role::Super && self.grant_level(&req.bucket, &caller) < Permission::Owner {
            return Err(Status::permission_denied(format!(
                "{caller} may not grant on {}",
                req.bucket
            )));
        }

        self.acls
            .write()
            .entry(req.bucket.clone())
            .or_default()
            .insert(req.name.clone(), level);
        info!(user = %req.name, bucket = %req.bucket, %level, "granted");
        Ok(Response::new(GrantResponse {}))
    }

    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<RegisterResponse>, Status> {
        let req = request.into_inner();
        let role = Role::try_from(req.role).map_err(Status::from)?;
        let (_, caller_role) = self.resolve(&req.token)?;
        if caller_role != Role::Super {
            return Err(Status::permission_denied("only superusers register users"));
        }

        let mut users = self.users.write();
        if users.contains_key(&req.name) {
            return Err(Status::already_exists(format!(
                "user already exists: {}",
                req.name
            )));
        }
        users.insert(
            req.name.clone(),
            User {
                pass_digest: Self::digest(&req.pass),
                role,
                token: None,
            },
        );
        info!(user = %req.name, ?role, "user registered");
        Ok(Response::new(RegisterResponse {}))
    }
}
