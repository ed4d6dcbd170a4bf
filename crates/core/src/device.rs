//! Device allocation for attachments backed by a resource.

use tracing::debug;
use trellis_common::Result;
use trellis_kube::resources::{self, ResourceClient, ResourceMap};
use trellis_kube::PodInfo;

/// Hands out allocated device identifiers to attachments, one at a time in
/// kubelet listing order.
///
/// The allocation snapshot is fetched lazily, at most once per create
/// invocation; the consumption cursor lives only for that invocation.
pub struct DeviceAllocator {
    client: Option<Box<dyn ResourceClient>>,
    snapshot: Option<ResourceMap>,
}

impl DeviceAllocator {
    /// Allocator that probes for an accounting backend on first use.
    pub fn new() -> Self {
        Self {
            client: None,
            snapshot: None,
        }
    }

    /// Allocator with an explicit accounting backend.
    pub fn with_client(client: Box<dyn ResourceClient>) -> Self {
        Self {
            client: Some(client),
            snapshot: None,
        }
    }

    /// Allocator over an already-fetched snapshot.
    pub fn with_snapshot(snapshot: ResourceMap) -> Self {
        Self {
            client: None,
            snapshot: Some(snapshot),
        }
    }

    /// Claim the next device allocated to the sandbox for `resource_name`.
    ///
    /// Returns `Ok(None)` when no pod object is at hand, the resource has
    /// no allocation for this sandbox, or the allocation is exhausted.
    pub async fn next_device(
        &mut self,
        resource_name: &str,
        pod: Option<&PodInfo>,
    ) -> Result<Option<String>> {
        let Some(pod) = pod else {
            return Ok(None);
        };
        if self.snapshot.is_none() {
            let snapshot = match &self.client {
                Some(client) => client.pod_resource_map(pod).await?,
                None => {
                    let client = resources::resource_client().await?;
                    client.pod_resource_map(pod).await?
                }
            };
            debug!(resources = snapshot.len(), "fetched device allocation snapshot");
            self.snapshot = Some(snapshot);
        }
        match self.snapshot.as_mut() {
            Some(snapshot) => Ok(take_next(snapshot, resource_name)),
            None => Ok(None),
        }
    }
}

impl Default for DeviceAllocator {
    fn default() -> Self {
        Self::new()
    }
}

fn take_next(snapshot: &mut ResourceMap, resource_name: &str) -> Option<String> {
    let info = snapshot.get_mut(resource_name)?;
    let id = info.device_ids.get(info.index)?.clone();
    info.index += 1;
    Some(id)
}
