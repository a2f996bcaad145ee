//! Generated gRPC code for the quorus protobuf definitions.

/// Common types (Reference, Metadata, Object).
pub mod common {
    tonic::include_proto!("quorus.common");
}

/// Peer service (Get, Put, Delete, Head, CompactStatus,
/// DeleteObjectsUnderDir).
pub mod object {
    tonic::include_proto!("quorus.object");
}

/// Admin service (Health, GetStats).
pub mod admin {
    tonic::include_proto!("quorus.admin");
}
