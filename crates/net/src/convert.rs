//! Conversions between proto types and domain types.

use quorus_common::{Metadata, Object, ObjectError, Reference, StorageMethod};
use quorus_engine::PeerError;
use quorus_proto::common as pb;
use quorus_store::{CompactionStats, CompactionStatus};

// ---------------------------------------------------------------------------
// Reference
// ---------------------------------------------------------------------------

pub fn reference_to_proto(reference: Reference) -> pb::Reference {
    pb::Reference {
        id: reference.to_string(),
    }
}

pub fn reference_from_proto(proto: Option<&pb::Reference>) -> Result<Reference, tonic::Status> {
    let proto = proto.ok_or_else(|| tonic::Status::invalid_argument("missing reference"))?;
    Reference::parse(&proto.id)
        .map_err(|e| tonic::Status::invalid_argument(format!("bad reference: {}", e)))
}

// ---------------------------------------------------------------------------
// Metadata / Object
// ---------------------------------------------------------------------------

pub fn metadata_to_proto(meta: &Metadata) -> pb::Metadata {
    pb::Metadata {
        addr_id: meta.addr_id,
        key: meta.key.clone(),
        dsize: meta.dsize,
        cindex: meta.cindex,
        cnumber: meta.cnumber,
        parent_key: meta.parent_key.clone().unwrap_or_default(),
        clock: meta.clock,
        timestamp: meta.timestamp,
        checksum: meta.checksum,
        del: meta.del,
        ring_hash: meta.ring_hash,
        num_of_replicas: u32::from(meta.num_of_replicas),
    }
}

pub fn metadata_from_proto(proto: &pb::Metadata) -> Metadata {
    Metadata {
        addr_id: proto.addr_id,
        key: proto.key.clone(),
        dsize: proto.dsize,
        cindex: proto.cindex,
        cnumber: proto.cnumber,
        parent_key: if proto.parent_key.is_empty() {
            None
        } else {
            Some(proto.parent_key.clone())
        },
        clock: proto.clock,
        timestamp: proto.timestamp,
        checksum: proto.checksum,
        del: proto.del,
        ring_hash: proto.ring_hash,
        num_of_replicas: proto.num_of_replicas as u8,
    }
}

pub fn object_to_proto(object: &Object) -> pb::Object {
    pb::Object {
        metadata: Some(metadata_to_proto(&Metadata::from(object))),
        data: object.data.clone(),
        method: match object.method {
            StorageMethod::Put => 0,
            StorageMethod::Delete => 1,
        },
        req_id: object.req_id,
    }
}

pub fn object_from_proto(proto: &pb::Object) -> Result<Object, tonic::Status> {
    let meta = proto
        .metadata
        .as_ref()
        .ok_or_else(|| tonic::Status::invalid_argument("missing object metadata"))?;
    let meta = metadata_from_proto(meta);
    let method = match proto.method {
        0 => StorageMethod::Put,
        1 => StorageMethod::Delete,
        other => {
            return Err(tonic::Status::invalid_argument(format!(
                "unknown method {}",
                other
            )))
        }
    };
    Ok(Object {
        addr_id: meta.addr_id,
        key: meta.key,
        data: proto.data.clone(),
        dsize: meta.dsize,
        cindex: meta.cindex,
        cnumber: meta.cnumber,
        parent_key: meta.parent_key,
        clock: meta.clock,
        timestamp: meta.timestamp,
        checksum: meta.checksum,
        method,
        del: meta.del,
        req_id: proto.req_id,
        ring_hash: meta.ring_hash,
        num_of_replicas: meta.num_of_replicas,
    })
}

// ---------------------------------------------------------------------------
// Compaction stats
// ---------------------------------------------------------------------------

pub fn compaction_status_code(status: CompactionStatus) -> u32 {
    match status {
        CompactionStatus::Idle => 0,
        CompactionStatus::Running => 1,
    }
}

pub fn compaction_stats_from_proto(
    proto: &quorus_proto::object::CompactStatusResponse,
) -> CompactionStats {
    CompactionStats {
        status: if proto.status == 1 {
            CompactionStatus::Running
        } else {
            CompactionStatus::Idle
        },
        pending_targets: proto.pending_targets.clone(),
        latest_exec_time: proto.latest_exec_time,
    }
}

// ---------------------------------------------------------------------------
// Errors across the wire
// ---------------------------------------------------------------------------

/// Map a handler-level error onto a gRPC status, preserving the kind.
pub fn object_error_to_status(err: ObjectError) -> tonic::Status {
    match err {
        ObjectError::NotFound => tonic::Status::not_found("not found"),
        ObjectError::Unavailable => tonic::Status::unavailable("unavailable"),
        ObjectError::Timeout => tonic::Status::deadline_exceeded("timeout"),
        ObjectError::NoRedundancy => tonic::Status::failed_precondition("no redundancy set"),
        ObjectError::NotSatisfyQuorum { needed, available } => tonic::Status::failed_precondition(
            format!("quorum not satisfiable: need {}, available {}", needed, available),
        ),
        ObjectError::InvalidData(m) => tonic::Status::invalid_argument(m),
        ObjectError::RecoverFailure(m) | ObjectError::ReplicateFailure(m) => {
            tonic::Status::internal(m)
        }
    }
}

/// Map a gRPC status back onto the peer-error taxonomy.
pub fn status_to_peer_error(status: tonic::Status) -> PeerError {
    match status.code() {
        tonic::Code::NotFound => PeerError::NotFound,
        tonic::Code::Unavailable => PeerError::Unavailable,
        tonic::Code::DeadlineExceeded => PeerError::Timeout,
        code => PeerError::Rpc(format!("{:?}: {}", code, status.message())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_roundtrip() {
        let mut object = Object::new_put(9, "a/b", b"body".to_vec());
        object.stamp(42, 7);
        object.cnumber = 3;
        object.parent_key = Some("a/".into());

        let proto = object_to_proto(&object);
        let back = object_from_proto(&proto).unwrap();
        assert_eq!(back, object);
    }

    #[test]
    fn test_metadata_roundtrip_empty_parent() {
        let object = Object::tombstone(1, "k");
        let meta = Metadata::from(&object);
        let back = metadata_from_proto(&metadata_to_proto(&meta));
        assert_eq!(back, meta);
        assert_eq!(back.parent_key, None);
    }

    #[test]
    fn test_reference_roundtrip() {
        let reference = Reference::mint();
        let proto = reference_to_proto(reference);
        let back = reference_from_proto(Some(&proto)).unwrap();
        assert_eq!(back, reference);
    }

    #[test]
    fn test_missing_reference_rejected() {
        assert!(reference_from_proto(None).is_err());
    }

    #[test]
    fn test_error_mapping_preserves_kinds() {
        assert_eq!(
            status_to_peer_error(object_error_to_status(ObjectError::NotFound)),
            PeerError::NotFound
        );
        assert_eq!(
            status_to_peer_error(object_error_to_status(ObjectError::Unavailable)),
            PeerError::Unavailable
        );
        assert_eq!(
            status_to_peer_error(object_error_to_status(ObjectError::Timeout)),
            PeerError::Timeout
        );
        assert!(matches!(
            status_to_peer_error(object_error_to_status(ObjectError::ReplicateFailure(
                "x".into()
            ))),
            PeerError::Rpc(_)
        ));
    }
}
