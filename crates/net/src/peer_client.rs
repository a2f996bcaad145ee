//! gRPC client implementing the engine's `PeerClient` seam.
//!
//! Maintains a pool of tonic channels keyed by peer address; every call is
//! wrapped in the configured deadline and classified onto the peer-error
//! taxonomy via the status code.

use crate::convert;
use quorus_common::{Metadata, Object, ReadParams, Reference};
use quorus_engine::{PeerClient, PeerError};
use quorus_proto::object::peer_service_client::PeerServiceClient;
use quorus_store::CompactionStats;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tonic::transport::Channel;

#[derive(Debug)]
pub struct GrpcPeerClient {
    channels: Arc<RwLock<HashMap<SocketAddr, Channel>>>,
    timeout: Duration,
}

impl GrpcPeerClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            timeout,
        }
    }

    async fn client(&self, target: SocketAddr) -> Result<PeerServiceClient<Channel>, PeerError> {
        // Check the cache first.
        {
            let cache = self.channels.read().await;
            if let Some(channel) = cache.get(&target) {
                return Ok(PeerServiceClient::new(channel.clone()));
            }
        }

        let endpoint = format!("http://{}", target);
        let channel = Channel::from_shared(endpoint)
            .map_err(|e| PeerError::Rpc(format!("invalid endpoint: {}", e)))?
            .connect()
            .await
            .map_err(|e| PeerError::Rpc(format!("connect to {} failed: {}", target, e)))?;

        {
            let mut cache = self.channels.write().await;
            cache.insert(target, channel.clone());
        }

        Ok(PeerServiceClient::new(channel))
    }

    async fn with_deadline<T, F>(&self, fut: F) -> Result<T, PeerError>
    where
        F: std::future::Future<Output = Result<T, PeerError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(PeerError::Timeout),
        }
    }

    fn count_sent(rpc_type: &str) {
        let m = quorus_metrics::metrics();
        m.rpcs_sent.inc();
        m.rpcs_sent_by_type.with_label_values(&[rpc_type]).inc();
    }
}

#[async_trait::async_trait]
impl PeerClient for GrpcPeerClient {
    async fn get(
        &self,
        target: SocketAddr,
        reference: Reference,
        params: &ReadParams,
    ) -> Result<(Metadata, Vec<u8>), PeerError> {
        Self::count_sent("get");
        let _timer = quorus_metrics::start_rpc_timer("get", "outbound");

        let request = quorus_proto::object::GetRequest {
            reference: Some(convert::reference_to_proto(reference)),
            addr_id: params.addr_id,
            key: params.key.clone(),
            etag: params.etag,
            start_pos: params.start_pos,
            end_pos: params.end_pos,
            req_id: params.req_id,
        };

        self.with_deadline(async {
            let mut client = self.client(target).await?;
            let response = client
                .get(request)
                .await
                .map_err(convert::status_to_peer_error)?
                .into_inner();
            let meta = response
                .metadata
                .as_ref()
                .ok_or_else(|| PeerError::Rpc("missing metadata in get reply".into()))?;
            Ok((convert::metadata_from_proto(meta), response.data))
        })
        .await
    }

    async fn put(
        &self,
        target: SocketAddr,
        reference: Reference,
        object: &Object,
    ) -> Result<u64, PeerError> {
        Self::count_sent("put");
        let _timer = quorus_metrics::start_rpc_timer("put", "outbound");

        let request = quorus_proto::object::PutRequest {
            object: Some(convert::object_to_proto(object)),
            reference: Some(convert::reference_to_proto(reference)),
        };

        self.with_deadline(async {
            let mut client = self.client(target).await?;
            let response = client
                .put(request)
                .await
                .map_err(convert::status_to_peer_error)?
                .into_inner();
            Ok(response.etag)
        })
        .await
    }

    async fn delete(
        &self,
        target: SocketAddr,
        reference: Reference,
        object: &Object,
    ) -> Result<(), PeerError> {
        Self::count_sent("delete");
        let _timer = quorus_metrics::start_rpc_timer("delete", "outbound");

        let request = quorus_proto::object::DeleteRequest {
            object: Some(convert::object_to_proto(object)),
            reference: Some(convert::reference_to_proto(reference)),
        };

        self.with_deadline(async {
            let mut client = self.client(target).await?;
            client
                .delete(request)
                .await
                .map_err(convert::status_to_peer_error)?;
            Ok(())
        })
        .await
    }

    async fn head(
        &self,
        target: SocketAddr,
        addr_id: u32,
        key: &str,
    ) -> Result<Vec<u8>, PeerError> {
        Self::count_sent("head");
        let _timer = quorus_metrics::start_rpc_timer("head", "outbound");

        let request = quorus_proto::object::HeadRequest {
            addr_id,
            key: key.to_string(),
        };

        self.with_deadline(async {
            let mut client = self.client(target).await?;
            let response = client
                .head(request)
                .await
                .map_err(convert::status_to_peer_error)?
                .into_inner();
            Ok(response.metadata)
        })
        .await
    }

    async fn compact_status(&self, target: SocketAddr) -> Result<CompactionStats, PeerError> {
        Self::count_sent("compact_status");
        let _timer = quorus_metrics::start_rpc_timer("compact_status", "outbound");

        self.with_deadline(async {
            let mut client = self.client(target).await?;
            let response = client
                .compact_status(quorus_proto::object::CompactStatusRequest {})
                .await
                .map_err(convert::status_to_peer_error)?
                .into_inner();
            Ok(convert::compaction_stats_from_proto(&response))
        })
        .await
    }

    async fn delete_objects_under_dir(
        &self,
        target: SocketAddr,
        reference: Reference,
        prefixes: &[Option<String>],
    ) -> Result<Reference, PeerError> {
        Self::count_sent("delete_objects_under_dir");
        let _timer = quorus_metrics::start_rpc_timer("delete_objects_under_dir", "outbound");

        let request = quorus_proto::object::DeleteDirRequest {
            reference: Some(convert::reference_to_proto(reference)),
            prefixes: prefixes
                .iter()
                .map(|p| p.clone().unwrap_or_default())
                .collect(),
        };

        self.with_deadline(async {
            let mut client = self.client(target).await?;
            let response = client
                .delete_objects_under_dir(request)
                .await
                .map_err(convert::status_to_peer_error)?
                .into_inner();
            let echoed = response
                .reference
                .as_ref()
                .map(|r| Reference::parse(&r.id))
                .transpose()
                .map_err(|e| PeerError::Rpc(e.to_string()))?;
            Ok(echoed.unwrap_or(reference))
        })
        .await
    }
}
