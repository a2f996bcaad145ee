//! gRPC networking layer for quorus.
//!
//! Provides:
//! - `GrpcPeerClient`: implements the engine's `PeerClient` over tonic
//! - `PeerServiceImpl`: bridges the peer proto to the handler
//! - `AdminServiceImpl`: health and node stats
//! - `build_server`: assembles all services into a tonic `Router`

pub mod convert;
pub mod peer_client;
pub mod server;

pub use peer_client::GrpcPeerClient;
pub use server::{AdminServiceImpl, PeerServiceImpl};

use quorus_engine::{ObjectHandler, PeerClient, WorkerPool};
use quorus_store::ObjectStore;
use std::sync::Arc;
use std::time::Instant;

/// Build a tonic `Router` with the peer and admin services.
pub fn build_server<S: ObjectStore, P: PeerClient>(
    handler: Arc<ObjectHandler<S, P>>,
    pool: Arc<WorkerPool>,
    store: Arc<S>,
    node_id: String,
) -> tonic::transport::server::Router {
    let peer_svc = PeerServiceImpl {
        handler,
        pool,
        store: store.clone(),
    };
    let admin_svc = AdminServiceImpl {
        store,
        node_id,
        start_time: Instant::now(),
    };

    tonic::transport::Server::builder()
        .add_service(quorus_proto::object::peer_service_server::PeerServiceServer::new(peer_svc))
        .add_service(quorus_proto::admin::admin_service_server::AdminServiceServer::new(admin_svc))
}
