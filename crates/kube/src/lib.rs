//! Cluster-facing clients for the trellis delegation plugin.
//!
//! This crate provides:
//! - [`client::ClusterClient`]: pod metadata and network-descriptor lookups
//!   against the Kubernetes API server
//! - [`resources`]: the device accounting collaborator, a kubelet
//!   pod-resources gRPC client with a checkpoint-file fallback

pub mod client;
pub mod resources;

// Re-export commonly used items
pub use client::{
    ApiServerClient, ClusterAccess, ClusterClient, NetworkDescriptor, NetworkDescriptorSpec,
    ObjectMeta, PodInfo,
};
pub use resources::{resource_client, ResourceClient, ResourceInfo, ResourceMap};
