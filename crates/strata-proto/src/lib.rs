//! Strata protocol - gRPC service definitions
//!
//! This crate contains the protobuf-generated code for strata's
//! internal gRPC services.

/// Storage service (volume server operations)
pub mod storage {
    tonic::include_proto!("strata.storage");
}

/// Metadata service (bucket, object and group operations)
pub mod metadata {
    tonic::include_proto!("strata.metadata");
}

/// Auth service (users, tokens, bucket grants)
pub mod auth {
    tonic::include_proto!("strata.auth");
}
