//! Device accounting: which devices the kubelet allocated to a sandbox.
//!
//! Two backends provide the same snapshot: the kubelet pod-resources gRPC
//! endpoint ([`client::PodResourcesClient`]) and the device-manager
//! checkpoint file ([`checkpoint::Checkpoint`]). [`resource_client`] picks
//! one by probing for the endpoint's socket.

pub mod api;
pub mod checkpoint;
pub mod client;

use crate::client::PodInfo;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;
use trellis_common::Result;

/// Kubelet pod-resources endpoint socket.
pub const KUBELET_SOCKET: &str = "/var/lib/kubelet/pod-resources/kubelet.sock";

/// Kubelet device-manager checkpoint file.
pub const KUBELET_CHECKPOINT: &str =
    "/var/lib/kubelet/device-plugins/kubelet_internal_checkpoint";

/// Allocation snapshot for one sandbox: resource name to device cursor.
pub type ResourceMap = HashMap<String, ResourceInfo>;

/// Ordered device identifiers for one resource name, with a consumption
/// cursor advanced as attachments claim devices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceInfo {
    /// Allocated device identifiers, in kubelet listing order.
    pub device_ids: Vec<String>,
    /// Index of the next unclaimed device.
    pub index: usize,
}

/// Trait for device accounting lookups.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// The sandbox's allocation snapshot, keyed by resource name.
    ///
    /// # Errors
    /// Returns [`trellis_common::Error::Upstream`] when the sandbox identity
    /// is unusable for this backend or the backend cannot be queried.
    async fn pod_resource_map(&self, pod: &PodInfo) -> Result<ResourceMap>;
}

/// Select the accounting backend for this invocation.
///
/// Prefers the live pod-resources endpoint when its socket exists, falling
/// back to the checkpoint file otherwise. The probe is a point-in-time
/// existence check: the endpoint can appear or vanish between the probe and
/// the query. Known limitation, kept as-is.
pub async fn resource_client() -> Result<Box<dyn ResourceClient>> {
    resource_client_at(Path::new(KUBELET_SOCKET), Path::new(KUBELET_CHECKPOINT)).await
}

/// [`resource_client`] with explicit socket and checkpoint paths.
pub async fn resource_client_at(
    socket: &Path,
    checkpoint: &Path,
) -> Result<Box<dyn ResourceClient>> {
    if tokio::fs::try_exists(socket).await.unwrap_or(false) {
        debug!(socket = %socket.display(), "using kubelet pod-resources endpoint");
        Ok(Box::new(client::PodResourcesClient::connect(socket).await?))
    } else {
        debug!(checkpoint = %checkpoint.display(), "pod-resources socket absent, using checkpoint");
        Ok(Box::new(checkpoint::Checkpoint::load(checkpoint).await?))
    }
}
