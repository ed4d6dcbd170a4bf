//! Builds the delegate list from resolved attachments.

use tracing::debug;
use trellis_common::{Error, NetworkAttachment, Result};
use trellis_kube::{ClusterClient, PodInfo};

use crate::delegate::{self, DelegateConf, DeviceBinding};
use crate::device::DeviceAllocator;

async fn delegate_conf_for(
    client: &dyn ClusterClient,
    devices: &mut DeviceAllocator,
    attachment: &NetworkAttachment,
    primary: bool,
    pod: Option<&PodInfo>,
) -> Result<String> {
    if attachment.name.is_empty() {
        return Err(Error::Config("network name can't be empty".to_string()));
    }
    let descriptor = client.network_descriptor(&attachment.name).await?;
    let device = match descriptor.resource_name() {
        Some(resource_name) => devices
            .next_device(resource_name, pod)
            .await?
            .map(|device_id| DeviceBinding {
                device_id,
                resource_name: resource_name.to_string(),
            }),
        None => None,
    };
    delegate::render_delegate(
        &descriptor.spec.plugin,
        &descriptor.spec.config,
        &attachment.name,
        primary,
        device.as_ref(),
    )
}

/// Build one delegate configuration per attachment, in attachment order.
///
/// An attachment is rendered as the master plugin only when it is marked
/// primary and this is not an auxiliary single-network invocation.
pub async fn build_delegates(
    client: &dyn ClusterClient,
    devices: &mut DeviceAllocator,
    attachments: &[NetworkAttachment],
    aux_only: bool,
    pod: Option<&PodInfo>,
) -> Result<Vec<DelegateConf>> {
    let mut rendered = Vec::with_capacity(attachments.len());
    for attachment in attachments {
        let primary = attachment.is_primary && !aux_only;
        rendered.push(delegate_conf_for(client, devices, attachment, primary, pod).await?);
    }
    debug!(delegates = rendered.len(), "built delegate configurations");
    delegate::parse_delegate_list(&format!("[{}]", rendered.join(",")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use trellis_kube::resources::{ResourceInfo, ResourceMap};
    use trellis_kube::{NetworkDescriptor, NetworkDescriptorSpec, ObjectMeta};

    struct MockCluster {
        descriptors: HashMap<String, NetworkDescriptor>,
    }

    impl MockCluster {
        fn new() -> Self {
            Self {
                descriptors: HashMap::new(),
            }
        }

        fn descriptor(mut self, name: &str, plugin: &str, config: &str, resource: Option<&str>) -> Self {
            let mut annotations = HashMap::new();
            if let Some(resource) = resource {
                annotations.insert("trellis.dev/resourceName".to_string(), resource.to_string());
            }
            self.descriptors.insert(
                name.to_string(),
                NetworkDescriptor {
                    metadata: ObjectMeta {
                        name: name.to_string(),
                        annotations,
                        ..ObjectMeta::default()
                    },
                    spec: NetworkDescriptorSpec {
                        plugin: plugin.to_string(),
                        config: config.to_string(),
                    },
                },
            );
            self
        }
    }

    #[async_trait]
    impl ClusterClient for MockCluster {
        async fn pod(&self, namespace: &str, name: &str) -> Result<trellis_kube::PodInfo> {
            Err(Error::PodNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
        }

        async fn network_descriptor(&self, name: &str) -> Result<NetworkDescriptor> {
            self.descriptors
                .get(name)
                .cloned()
                .ok_or_else(|| Error::Upstream(format!("network descriptor {} not found", name)))
        }
    }

    fn pod() -> PodInfo {
        PodInfo {
            metadata: ObjectMeta {
                name: "web-0".to_string(),
                namespace: "default".to_string(),
                uid: "uid-1".to_string(),
                annotations: HashMap::new(),
            },
        }
    }

    fn device_map(resource: &str, devices: &[&str]) -> ResourceMap {
        let mut map = HashMap::new();
        map.insert(
            resource.to_string(),
            ResourceInfo {
                device_ids: devices.iter().map(|d| d.to_string()).collect(),
                index: 0,
            },
        );
        map
    }

    #[tokio::test]
    async fn test_builds_in_attachment_order() {
        let cluster = MockCluster::new()
            .descriptor("data-net", "bridge", r#"{"mtu": 1500}"#, None)
            .descriptor("storage", "macvlan", r#"{"mode": "bridge"}"#, None);
        let attachments = vec![
            NetworkAttachment::new("data-net").with_primary(true),
            NetworkAttachment::new("storage"),
        ];
        let mut devices = DeviceAllocator::new();
        let delegates = build_delegates(&cluster, &mut devices, &attachments, false, None)
            .await
            .unwrap();
        assert_eq!(delegates.len(), 2);
        assert_eq!(delegates[0].plugin_type(), Some("bridge"));
        assert!(delegates[0].is_master_plugin());
        assert_eq!(delegates[1].plugin_type(), Some("macvlan"));
        assert!(!delegates[1].is_master_plugin());
        assert_eq!(delegates[1].network_name(), Some("storage"));
    }

    #[tokio::test]
    async fn test_aux_invocation_never_renders_a_master() {
        let cluster = MockCluster::new().descriptor("data-net", "bridge", r#"{"mtu": 1500}"#, None);
        let attachments = vec![NetworkAttachment::new("data-net").with_primary(true)];
        let mut devices = DeviceAllocator::new();
        let delegates = build_delegates(&cluster, &mut devices, &attachments, true, None)
            .await
            .unwrap();
        assert!(!delegates[0].is_master_plugin());
    }

    #[tokio::test]
    async fn test_devices_are_claimed_in_order_until_exhausted() {
        let cluster = MockCluster::new().descriptor(
            "fast-net",
            "sriov",
            r#"{"vlan": 100}"#,
            Some("vendor.example/sriov"),
        );
        let attachments = vec![
            NetworkAttachment::new("fast-net"),
            NetworkAttachment::new("fast-net"),
            NetworkAttachment::new("fast-net"),
        ];
        let mut devices =
            DeviceAllocator::with_snapshot(device_map("vendor.example/sriov", &["dev-0", "dev-1"]));
        let pod = pod();
        let delegates = build_delegates(&cluster, &mut devices, &attachments, false, Some(&pod))
            .await
            .unwrap();

        let rendered: Vec<String> = delegates
            .iter()
            .map(|d| serde_json::to_string(d).unwrap())
            .collect();
        assert!(rendered[0].contains(r#""deviceID":"dev-0""#));
        assert!(rendered[1].contains(r#""deviceID":"dev-1""#));
        assert!(!rendered[2].contains("deviceID"));
        assert!(rendered[0].contains(r#""resourceName":"vendor.example/sriov""#));
    }

    #[tokio::test]
    async fn test_missing_descriptor_is_an_upstream_error() {
        let cluster = MockCluster::new();
        let attachments = vec![NetworkAttachment::new("absent")];
        let mut devices = DeviceAllocator::new();
        let err = build_delegates(&cluster, &mut devices, &attachments, false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Upstream(_)));
    }

    #[tokio::test]
    async fn test_empty_attachment_name_is_rejected() {
        let cluster = MockCluster::new();
        let attachments = vec![NetworkAttachment::synthetic_primary()];
        let mut devices = DeviceAllocator::new();
        let err = build_delegates(&cluster, &mut devices, &attachments, false, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("can't be empty"));
    }

    #[tokio::test]
    async fn test_empty_list_builds_empty() {
        let cluster = MockCluster::new();
        let mut devices = DeviceAllocator::new();
        let delegates = build_delegates(&cluster, &mut devices, &[], false, None).await.unwrap();
        assert!(delegates.is_empty());
    }
}
