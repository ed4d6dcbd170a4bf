//! Attachment resolution: from command arguments and pod metadata to the
//! ordered attachment list driving delegation.

use std::str::FromStr;

use macaddr::MacAddr;
use tracing::debug;
use trellis_common::{Error, NetworkAttachment, Result};
use trellis_kube::{ClusterClient, PodInfo};

const POD_NAME_ARG: &str = "K8S_POD_NAME";
const POD_NAMESPACE_ARG: &str = "K8S_POD_NAMESPACE";
const POD_INFRA_CONTAINER_ARG: &str = "K8S_POD_INFRA_CONTAINER_ID";
const POD_NETWORK_ARG: &str = "K8S_POD_NETWORK";
const POD_IFMAC_ARG: &str = "K8S_POD_IFMAC";

/// Sandbox identity and dynamic-attachment arguments carried in `CNI_ARGS`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodArgs {
    pub name: String,
    pub namespace: String,
    pub infra_container_id: String,
    pub network: String,
    pub if_mac: String,
}

impl PodArgs {
    /// Parse the `;`-separated `KEY=VALUE` pairs of `CNI_ARGS`. Unknown
    /// keys and malformed pairs are ignored.
    pub fn parse(args: &str) -> Self {
        let mut out = Self::default();
        for pair in args.split(';') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            match key {
                POD_NAME_ARG => out.name = value.to_string(),
                POD_NAMESPACE_ARG => out.namespace = value.to_string(),
                POD_INFRA_CONTAINER_ARG => out.infra_container_id = value.to_string(),
                POD_NETWORK_ARG => out.network = value.to_string(),
                POD_IFMAC_ARG => out.if_mac = value.to_string(),
                _ => {}
            }
        }
        out
    }

    /// Whether this invocation targets a single named network dynamically
    /// instead of the pod's declared attachment set.
    pub fn is_dynamic(&self) -> bool {
        !self.network.is_empty()
    }
}

/// Resolve the ordered attachment list for this invocation.
///
/// Returns the attachments, whether this is an auxiliary single-network
/// invocation, and the pod object when one was fetched. Dynamic mode never
/// consults the cluster.
pub async fn pod_attachments(
    client: &dyn ClusterClient,
    args: &PodArgs,
) -> Result<(Vec<NetworkAttachment>, bool, Option<PodInfo>)> {
    if args.is_dynamic() {
        debug!(network = %args.network, "dynamic single-attachment invocation");
        let mut attachment = NetworkAttachment::new(&args.network);
        if !args.if_mac.is_empty() {
            attachment.if_mac = Some(args.if_mac.clone());
        }
        return Ok((vec![attachment], true, None));
    }

    let pod = client.pod(&args.namespace, &args.name).await?;
    let attachments = match pod.networks_annotation() {
        None | Some("") => vec![NetworkAttachment::synthetic_primary()],
        Some(annotation) => serde_json::from_str(annotation).map_err(|e| {
            Error::Config(format!(
                "cannot parse networks annotation of pod {}/{}: {}",
                args.namespace, args.name, e
            ))
        })?,
    };
    debug!(
        pod = %args.name,
        namespace = %args.namespace,
        attachments = attachments.len(),
        "resolved pod attachments"
    );
    Ok((attachments, false, Some(pod)))
}

/// Enforce the attachment invariants before any delegate is built: at most
/// one primary, and every MAC override syntactically valid.
///
/// Returns whether any attachment claimed the primary interface.
pub fn validate_attachments(attachments: &[NetworkAttachment]) -> Result<bool> {
    let mut have_primary = false;
    for attachment in attachments {
        if attachment.is_primary {
            if have_primary {
                return Err(Error::Config(
                    "only one network attachment can have isPrimary set to true".to_string(),
                ));
            }
            have_primary = true;
        }
        if let Some(mac) = attachment.mac_override() {
            MacAddr::from_str(mac).map_err(|e| {
                Error::Config(format!(
                    "invalid ifMac {} on network {}: {}",
                    mac, attachment.name, e
                ))
            })?;
        }
    }
    Ok(have_primary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use trellis_kube::{NetworkDescriptor, ObjectMeta};

    struct MockCluster {
        pods: HashMap<String, PodInfo>,
    }

    impl MockCluster {
        fn empty() -> Self {
            Self { pods: HashMap::new() }
        }

        fn with_pod(namespace: &str, name: &str, annotation: Option<&str>) -> Self {
            let mut annotations = HashMap::new();
            if let Some(value) = annotation {
                annotations.insert("networks".to_string(), value.to_string());
            }
            let pod = PodInfo {
                metadata: ObjectMeta {
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                    uid: "uid-1".to_string(),
                    annotations,
                },
            };
            let mut pods = HashMap::new();
            pods.insert(format!("{}/{}", namespace, name), pod);
            Self { pods }
        }
    }

    #[async_trait]
    impl ClusterClient for MockCluster {
        async fn pod(&self, namespace: &str, name: &str) -> Result<PodInfo> {
            self.pods
                .get(&format!("{}/{}", namespace, name))
                .cloned()
                .ok_or_else(|| Error::PodNotFound {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })
        }

        async fn network_descriptor(&self, name: &str) -> Result<NetworkDescriptor> {
            Err(Error::Upstream(format!("no descriptor {}", name)))
        }
    }

    fn args(extra: &str) -> PodArgs {
        PodArgs::parse(&format!(
            "IgnoreUnknown=1;K8S_POD_NAMESPACE=default;K8S_POD_NAME=web-0{}",
            extra
        ))
    }

    #[test]
    fn test_parse_pod_args() {
        let parsed = args(";K8S_POD_INFRA_CONTAINER_ID=abc123");
        assert_eq!(parsed.name, "web-0");
        assert_eq!(parsed.namespace, "default");
        assert_eq!(parsed.infra_container_id, "abc123");
        assert!(parsed.network.is_empty());
        assert!(!parsed.is_dynamic());
    }

    #[test]
    fn test_parse_ignores_malformed_pairs() {
        let parsed = PodArgs::parse("garbage;K8S_POD_NAME=a;;still=fine");
        assert_eq!(parsed.name, "a");
    }

    #[tokio::test]
    async fn test_dynamic_mode_skips_pod_lookup() {
        let cluster = MockCluster::empty();
        let parsed = args(";K8S_POD_NETWORK=storage;K8S_POD_IFMAC=00:11:22:33:44:55");
        let (attachments, aux_only, pod) = pod_attachments(&cluster, &parsed).await.unwrap();
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].name, "storage");
        assert_eq!(attachments[0].if_mac.as_deref(), Some("00:11:22:33:44:55"));
        assert!(aux_only);
        assert!(pod.is_none());
    }

    #[tokio::test]
    async fn test_missing_annotation_yields_synthetic_primary() {
        let cluster = MockCluster::with_pod("default", "web-0", None);
        let (attachments, aux_only, pod) = pod_attachments(&cluster, &args("")).await.unwrap();
        assert_eq!(attachments.len(), 1);
        assert!(attachments[0].name.is_empty());
        assert!(attachments[0].is_primary);
        assert!(!aux_only);
        assert!(pod.is_some());
    }

    #[tokio::test]
    async fn test_annotation_resolves_in_declared_order() {
        let annotation = r#"[{"name": "data-net", "isPrimary": true}, {"name": "storage"}]"#;
        let cluster = MockCluster::with_pod("default", "web-0", Some(annotation));
        let (attachments, aux_only, _) = pod_attachments(&cluster, &args("")).await.unwrap();
        assert_eq!(attachments.len(), 2);
        assert_eq!(attachments[0].name, "data-net");
        assert!(attachments[0].is_primary);
        assert_eq!(attachments[1].name, "storage");
        assert!(!aux_only);
    }

    #[tokio::test]
    async fn test_malformed_annotation_is_a_config_error() {
        let cluster = MockCluster::with_pod("default", "web-0", Some("not json"));
        let err = pod_attachments(&cluster, &args("")).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_unknown_pod_propagates_not_found() {
        let cluster = MockCluster::empty();
        let err = pod_attachments(&cluster, &args("")).await.unwrap_err();
        assert!(err.is_pod_not_found());
    }

    #[test]
    fn test_validate_rejects_two_primaries() {
        let mut first = NetworkAttachment::new("a");
        first.is_primary = true;
        let mut second = NetworkAttachment::new("b");
        second.is_primary = true;
        let err = validate_attachments(&[first, second]).unwrap_err();
        assert!(err.to_string().contains("only one network attachment"));
    }

    #[test]
    fn test_validate_rejects_bad_mac() {
        let attachment = NetworkAttachment::new("blue-net").with_mac("zz:11:22:33:44:55");
        let err = validate_attachments(&[attachment]).unwrap_err();
        assert!(err.to_string().contains("blue-net"));
    }

    #[test]
    fn test_validate_reports_primary_presence() {
        let plain = NetworkAttachment::new("a");
        assert!(!validate_attachments(std::slice::from_ref(&plain)).unwrap());
        let mut primary = NetworkAttachment::new("b");
        primary.is_primary = true;
        assert!(validate_attachments(&[plain, primary]).unwrap());
    }

    #[test]
    fn test_validate_accepts_valid_macs() {
        let colons = NetworkAttachment::new("a").with_mac("00:11:22:33:44:55");
        let eui64 = NetworkAttachment::new("b").with_mac("00:11:22:33:44:55:66:77");
        validate_attachments(&[colons, eui64]).unwrap();
    }
}
