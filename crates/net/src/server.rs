//! gRPC service implementations.
//!
//! Bridges the tonic-generated service traits to the engine: replica
//! mutations run through the worker pool's admission valve, reads and
//! HEADs hit the local store directly, and every reply echoes the
//! initiator's reference.

use crate::convert;
use quorus_common::ReadParams;
use quorus_engine::{ObjectHandler, PeerClient, WorkerPool};
use quorus_store::ObjectStore;
use std::sync::Arc;
use std::time::Instant;

fn count_received(rpc_type: &str) {
    let m = quorus_metrics::metrics();
    m.rpcs_received.inc();
    m.rpcs_received_by_type.with_label_values(&[rpc_type]).inc();
}

// ---------------------------------------------------------------------------
// Peer service
// ---------------------------------------------------------------------------

pub struct PeerServiceImpl<S: ObjectStore, P: PeerClient> {
    pub handler: Arc<ObjectHandler<S, P>>,
    pub pool: Arc<WorkerPool>,
    pub store: Arc<S>,
}

impl<S: ObjectStore, P: PeerClient> std::fmt::Debug for PeerServiceImpl<S, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerServiceImpl").finish_non_exhaustive()
    }
}

#[tonic::async_trait]
impl<S: ObjectStore, P: PeerClient> quorus_proto::object::peer_service_server::PeerService
    for PeerServiceImpl<S, P>
{
    async fn get(
        &self,
        request: tonic::Request<quorus_proto::object::GetRequest>,
    ) -> Result<tonic::Response<quorus_proto::object::GetResponse>, tonic::Status> {
        count_received("get");
        let _timer = quorus_metrics::start_rpc_timer("get", "inbound");
        let req = request.into_inner();
        let reference = convert::reference_from_proto(req.reference.as_ref())?;

        let params = ReadParams {
            reference,
            addr_id: req.addr_id,
            key: req.key,
            etag: req.etag,
            start_pos: req.start_pos,
            end_pos: req.end_pos,
            num_of_replicas: 0,
            quorum: 0,
            req_id: req.req_id,
        };

        let (meta, data) = self
            .handler
            .local_get(&params)
            .map_err(convert::object_error_to_status)?;

        Ok(tonic::Response::new(quorus_proto::object::GetResponse {
            reference: Some(convert::reference_to_proto(reference)),
            metadata: Some(convert::metadata_to_proto(&meta)),
            data,
        }))
    }

    async fn put(
        &self,
        request: tonic::Request<quorus_proto::object::PutRequest>,
    ) -> Result<tonic::Response<quorus_proto::object::PutResponse>, tonic::Status> {
        count_received("put");
        let _timer = quorus_metrics::start_rpc_timer("put", "inbound");
        let req = request.into_inner();
        let reference = convert::reference_from_proto(req.reference.as_ref())?;
        let object = convert::object_from_proto(
            req.object
                .as_ref()
                .ok_or_else(|| tonic::Status::invalid_argument("missing object"))?,
        )?;

        let handler = self.handler.clone();
        let (echoed, result) = self
            .pool
            .submit(async move { Ok(handler.apply_put(object, reference)) })
            .await
            .map_err(convert::object_error_to_status)?;
        let etag = result.map_err(convert::object_error_to_status)?;

        Ok(tonic::Response::new(quorus_proto::object::PutResponse {
            reference: Some(convert::reference_to_proto(echoed)),
            etag,
        }))
    }

    async fn delete(
        &self,
        request: tonic::Request<quorus_proto::object::DeleteRequest>,
    ) -> Result<tonic::Response<quorus_proto::object::DeleteResponse>, tonic::Status> {
        count_received("delete");
        let _timer = quorus_metrics::start_rpc_timer("delete", "inbound");
        let req = request.into_inner();
        let reference = convert::reference_from_proto(req.reference.as_ref())?;
        let object = convert::object_from_proto(
            req.object
                .as_ref()
                .ok_or_else(|| tonic::Status::invalid_argument("missing object"))?,
        )?;

        let handler = self.handler.clone();
        let (echoed, result) = self
            .pool
            .submit(async move { Ok(handler.apply_delete(object, reference)) })
            .await
            .map_err(convert::object_error_to_status)?;
        result.map_err(convert::object_error_to_status)?;

        Ok(tonic::Response::new(quorus_proto::object::DeleteResponse {
            reference: Some(convert::reference_to_proto(echoed)),
        }))
    }

    async fn head(
        &self,
        request: tonic::Request<quorus_proto::object::HeadRequest>,
    ) -> Result<tonic::Response<quorus_proto::object::HeadResponse>, tonic::Status> {
        count_received("head");
        let _timer = quorus_metrics::start_rpc_timer("head", "inbound");
        let req = request.into_inner();

        let metadata = self
            .handler
            .local_head(req.addr_id, &req.key)
            .map_err(convert::object_error_to_status)?;

        Ok(tonic::Response::new(quorus_proto::object::HeadResponse {
            metadata,
        }))
    }

    async fn compact_status(
        &self,
        _request: tonic::Request<quorus_proto::object::CompactStatusRequest>,
    ) -> Result<tonic::Response<quorus_proto::object::CompactStatusResponse>, tonic::Status> {
        count_received("compact_status");
        let stats = self.store.compaction_stats();

        Ok(tonic::Response::new(
            quorus_proto::object::CompactStatusResponse {
                status: convert::compaction_status_code(stats.status),
                pending_targets: stats.pending_targets,
                latest_exec_time: stats.latest_exec_time,
            },
        ))
    }

    async fn delete_objects_under_dir(
        &self,
        request: tonic::Request<quorus_proto::object::DeleteDirRequest>,
    ) -> Result<tonic::Response<quorus_proto::object::DeleteDirResponse>, tonic::Status> {
        count_received("delete_objects_under_dir");
        let req = request.into_inner();
        let reference = convert::reference_from_proto(req.reference.as_ref())?;

        let prefixes: Vec<Option<String>> = req
            .prefixes
            .into_iter()
            .map(|p| if p.is_empty() { None } else { Some(p) })
            .collect();
        let echoed = self.handler.delete_objects_under_dir(reference, &prefixes);

        Ok(tonic::Response::new(
            quorus_proto::object::DeleteDirResponse {
                reference: Some(convert::reference_to_proto(echoed)),
            },
        ))
    }
}

// ---------------------------------------------------------------------------
// Admin service
// ---------------------------------------------------------------------------

pub struct AdminServiceImpl<S: ObjectStore> {
    pub store: Arc<S>,
    pub node_id: String,
    pub start_time: Instant,
}

impl<S: ObjectStore> std::fmt::Debug for AdminServiceImpl<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminServiceImpl")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

#[tonic::async_trait]
impl<S: ObjectStore> quorus_proto::admin::admin_service_server::AdminService
    for AdminServiceImpl<S>
{
    async fn health(
        &self,
        _request: tonic::Request<quorus_proto::admin::HealthRequest>,
    ) -> Result<tonic::Response<quorus_proto::admin::HealthResponse>, tonic::Status> {
        Ok(tonic::Response::new(quorus_proto::admin::HealthResponse {
            healthy: true,
            node_id: self.node_id.clone(),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }))
    }

    async fn get_stats(
        &self,
        _request: tonic::Request<quorus_proto::admin::StatsRequest>,
    ) -> Result<tonic::Response<quorus_proto::admin::StatsResponse>, tonic::Status> {
        let stats = self.store.compaction_stats();
        let m = quorus_metrics::metrics();

        Ok(tonic::Response::new(quorus_proto::admin::StatsResponse {
            total_rpcs_sent: m.rpcs_sent.get(),
            total_rpcs_received: m.rpcs_received.get(),
            compaction_status: convert::compaction_status_code(stats.status),
            pending_compaction_targets: stats.pending_targets,
        }))
    }
}
