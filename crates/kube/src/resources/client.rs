//! Live pod-resources client: gRPC over the kubelet's Unix socket.

use super::api;
use super::{ResourceClient, ResourceMap};
use crate::client::PodInfo;
use async_trait::async_trait;
use hyper_util::rt::TokioIo;
use std::path::Path;
use std::time::Duration;
use tokio::net::UnixStream;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Endpoint, Uri};
use tower::service_fn;
use tracing::debug;
use trellis_common::{Error, Result};

/// Deadline for the listing query.
const LIST_TIMEOUT: Duration = Duration::from_secs(10);

/// Response size cap; the listing covers every pod on the node.
const MAX_RESPONSE_BYTES: usize = 16 * 1024 * 1024;

const LIST_METHOD: &str = "/v1alpha1.PodResources/List";

/// Client holding a point-in-time snapshot of the kubelet's allocation
/// listing, taken once at connect.
pub struct PodResourcesClient {
    resources: Vec<api::PodResources>,
}

impl PodResourcesClient {
    /// Connect to the kubelet endpoint and snapshot the current listing.
    pub async fn connect(socket: &Path) -> Result<Self> {
        let socket_path = socket.to_path_buf();
        // Endpoint wants a URI but the connector below dials the socket.
        let channel = Endpoint::try_from("http://[::]:50051")
            .map_err(|e| Error::Internal(format!("invalid endpoint URI: {}", e)))?
            .connect_with_connector(service_fn(move |_: Uri| {
                let path = socket_path.clone();
                async move { UnixStream::connect(path).await.map(TokioIo::new) }
            }))
            .await
            .map_err(|e| {
                Error::Upstream(format!("cannot connect to pod-resources endpoint: {}", e))
            })?;

        let mut grpc =
            tonic::client::Grpc::new(channel).max_decoding_message_size(MAX_RESPONSE_BYTES);

        let listing = tokio::time::timeout(LIST_TIMEOUT, async {
            grpc.ready().await.map_err(|e| {
                Error::Upstream(format!("pod-resources endpoint not ready: {}", e))
            })?;
            let codec: tonic::codec::ProstCodec<
                api::ListPodResourcesRequest,
                api::ListPodResourcesResponse,
            > = tonic::codec::ProstCodec::default();
            grpc.unary(
                tonic::Request::new(api::ListPodResourcesRequest {}),
                PathAndQuery::from_static(LIST_METHOD),
                codec,
            )
            .await
            .map_err(|status| Error::Upstream(format!("pod-resources list failed: {}", status)))
        })
        .await
        .map_err(|_| {
            Error::Upstream(format!(
                "pod-resources list timed out after {}s",
                LIST_TIMEOUT.as_secs()
            ))
        })??;

        let resources = listing.into_inner().pod_resources;
        debug!(pods = resources.len(), "pod-resources listing fetched");
        Ok(Self { resources })
    }
}

#[async_trait]
impl ResourceClient for PodResourcesClient {
    async fn pod_resource_map(&self, pod: &PodInfo) -> Result<ResourceMap> {
        let name = &pod.metadata.name;
        let namespace = &pod.metadata.namespace;
        if name.is_empty() || namespace.is_empty() {
            return Err(Error::Upstream(
                "pod name and namespace are required for a resource lookup".to_string(),
            ));
        }

        let mut map = ResourceMap::new();
        for pod_resources in &self.resources {
            if pod_resources.name != *name || pod_resources.namespace != *namespace {
                continue;
            }
            for container in &pod_resources.containers {
                for device in &container.devices {
                    map.entry(device.resource_name.clone())
                        .or_default()
                        .device_ids
                        .extend(device.device_ids.iter().cloned());
                }
            }
        }
        Ok(map)
    }
}
