//! Kubernetes API access for pod metadata and network descriptors.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;
use trellis_common::{Error, Result};

/// Pod annotation listing the sandbox's requested network attachments.
pub const NETWORKS_ANNOTATION: &str = "networks";

/// Network-descriptor annotation naming the device resource to pair with.
pub const RESOURCE_NAME_ANNOTATION: &str = "trellis.dev/resourceName";

/// Collection path for the network descriptor custom resources.
const NETWORKS_API_BASE: &str = "/apis/trellis.dev/v1/namespaces/default/networks";

const DEFAULT_TOKEN_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const DEFAULT_CA_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Object metadata shared by the cluster objects we fetch.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

/// The slice of a pod object the resolver and accounting lookups need.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PodInfo {
    #[serde(default)]
    pub metadata: ObjectMeta,
}

impl PodInfo {
    /// The pod's network-attachment annotation, if present.
    pub fn networks_annotation(&self) -> Option<&str> {
        self.metadata
            .annotations
            .get(NETWORKS_ANNOTATION)
            .map(|s| s.as_str())
    }
}

/// A network descriptor custom resource: the plugin type and configuration
/// fragment behind an attachment name.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkDescriptor {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: NetworkDescriptorSpec,
}

/// Spec section of a network descriptor.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkDescriptorSpec {
    /// Delegate plugin binary name.
    #[serde(default)]
    pub plugin: String,
    /// JSON configuration fragment spliced into the delegate config.
    #[serde(default)]
    pub config: String,
}

impl NetworkDescriptor {
    /// The device resource this network pairs with, if annotated.
    pub fn resource_name(&self) -> Option<&str> {
        self.metadata
            .annotations
            .get(RESOURCE_NAME_ANNOTATION)
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
    }
}

/// API server access overrides carried in the top-level configuration.
///
/// Absent fields fall back to in-cluster service-account defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterAccess {
    /// API server base URL, e.g. `https://10.0.0.1:6443`.
    #[serde(default)]
    pub api_server: Option<String>,
    /// Bearer token file.
    #[serde(default)]
    pub token_file: Option<PathBuf>,
    /// CA bundle for the API server's certificate.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
}

/// Trait for the cluster lookups used during attachment resolution.
///
/// This abstraction keeps the orchestrator testable with in-process fakes.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch a pod object by namespace and name.
    ///
    /// # Errors
    /// Returns [`Error::PodNotFound`] when the pod does not exist and
    /// [`Error::Upstream`] for any other API failure.
    async fn pod(&self, namespace: &str, name: &str) -> Result<PodInfo>;

    /// Fetch the network descriptor for an attachment name.
    ///
    /// # Errors
    /// Returns [`Error::Upstream`] when the descriptor cannot be fetched
    /// or decoded.
    async fn network_descriptor(&self, name: &str) -> Result<NetworkDescriptor>;
}

/// HTTPS client against the Kubernetes API server.
pub struct ApiServerClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ApiServerClient {
    /// Build a client from the configuration overrides, falling back to
    /// in-cluster service-account defaults for anything not set.
    pub async fn new(access: &ClusterAccess) -> Result<Self> {
        let base_url = match &access.api_server {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => in_cluster_url()?,
        };

        let token_file = access
            .token_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TOKEN_FILE));
        let token = match tokio::fs::read_to_string(&token_file).await {
            Ok(t) => Some(t.trim().to_string()),
            // A missing default token just means we are not in-cluster;
            // a missing configured one is an operator mistake.
            Err(e) if access.token_file.is_some() => {
                return Err(Error::Config(format!(
                    "cannot read token file {}: {}",
                    token_file.display(),
                    e
                )));
            }
            Err(_) => None,
        };

        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
        let ca_file = access
            .ca_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CA_FILE));
        match tokio::fs::read(&ca_file).await {
            Ok(pem) => {
                let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                    Error::Config(format!("invalid CA bundle {}: {}", ca_file.display(), e))
                })?;
                builder = builder.add_root_certificate(cert);
            }
            Err(e) if access.ca_file.is_some() => {
                return Err(Error::Config(format!(
                    "cannot read CA bundle {}: {}",
                    ca_file.display(),
                    e
                )));
            }
            Err(_) => {}
        }

        let http = builder
            .build()
            .map_err(|e| Error::Config(format!("cannot build API client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        debug!(path = %path, "cluster API GET");
        let mut req = self.http.get(&url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req.send()
            .await
            .map_err(|e| Error::Upstream(format!("GET {} failed: {}", path, e)))
    }
}

/// API server URL from the in-cluster service environment.
fn in_cluster_url() -> Result<String> {
    let host = std::env::var("KUBERNETES_SERVICE_HOST").map_err(|_| {
        Error::Config(
            "no apiServer configured and KUBERNETES_SERVICE_HOST is not set".to_string(),
        )
    })?;
    let port =
        std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
    Ok(format!("https://{}:{}", host, port))
}

/// First part of a response body, for error context.
async fn body_snippet(resp: reqwest::Response) -> String {
    match resp.text().await {
        Ok(body) => body.chars().take(200).collect(),
        Err(_) => String::new(),
    }
}

#[async_trait]
impl ClusterClient for ApiServerClient {
    async fn pod(&self, namespace: &str, name: &str) -> Result<PodInfo> {
        let path = format!("/api/v1/namespaces/{}/pods/{}", namespace, name);
        let resp = self.get(&path).await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::PodNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(Error::Upstream(format!(
                "pod {}/{} fetch returned {}: {}",
                namespace,
                name,
                status,
                body_snippet(resp).await
            )));
        }
        resp.json::<PodInfo>()
            .await
            .map_err(|e| Error::Upstream(format!("cannot decode pod object: {}", e)))
    }

    async fn network_descriptor(&self, name: &str) -> Result<NetworkDescriptor> {
        let path = format!("{}/{}", NETWORKS_API_BASE, name);
        let resp = self.get(&path).await?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(Error::Upstream(format!(
                "network descriptor {} fetch returned {}: {}",
                name,
                status,
                body_snippet(resp).await
            )));
        }
        resp.json::<NetworkDescriptor>().await.map_err(|e| {
            Error::Upstream(format!("cannot decode network descriptor {}: {}", name, e))
        })
    }
}
