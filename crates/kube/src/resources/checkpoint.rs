//! Checkpoint-file fallback for device accounting.
//!
//! The kubelet device manager checkpoints its allocations to disk; when the
//! pod-resources endpoint is unavailable this file is the source of truth.
//! Entries are keyed by pod UID rather than name/namespace.

use super::{ResourceClient, ResourceMap};
use crate::client::PodInfo;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use tracing::debug;
use trellis_common::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
struct CheckpointFile {
    #[serde(rename = "Data")]
    data: CheckpointData,
}

#[derive(Debug, Clone, Deserialize)]
struct CheckpointData {
    #[serde(rename = "PodDeviceEntries", default)]
    pod_device_entries: Vec<PodDevicesEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct PodDevicesEntry {
    #[serde(rename = "PodUID", default)]
    pod_uid: String,
    #[serde(rename = "ResourceName", default)]
    resource_name: String,
    #[serde(rename = "DeviceIDs", default)]
    device_ids: Vec<String>,
}

/// Decoded device-manager checkpoint.
pub struct Checkpoint {
    entries: Vec<PodDevicesEntry>,
}

impl Checkpoint {
    /// Load and decode the checkpoint file.
    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            Error::Upstream(format!(
                "cannot read kubelet checkpoint {}: {}",
                path.display(),
                e
            ))
        })?;
        let file: CheckpointFile = serde_json::from_slice(&bytes).map_err(|e| {
            Error::Upstream(format!(
                "cannot decode kubelet checkpoint {}: {}",
                path.display(),
                e
            ))
        })?;
        debug!(entries = file.data.pod_device_entries.len(), "checkpoint loaded");
        Ok(Self {
            entries: file.data.pod_device_entries,
        })
    }
}

#[async_trait]
impl ResourceClient for Checkpoint {
    async fn pod_resource_map(&self, pod: &PodInfo) -> Result<ResourceMap> {
        let uid = &pod.metadata.uid;
        if uid.is_empty() {
            return Err(Error::Upstream(
                "pod UID is required for a checkpoint lookup".to_string(),
            ));
        }

        let mut map = ResourceMap::new();
        for entry in &self.entries {
            if entry.pod_uid != *uid {
                continue;
            }
            map.entry(entry.resource_name.clone())
                .or_default()
                .device_ids
                .extend(entry.device_ids.iter().cloned());
        }
        Ok(map)
    }
}
