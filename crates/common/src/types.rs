//! Domain types used throughout the trellis delegation plugin.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a sandbox.
///
/// This is the container ID handed to us by the runtime; it keys the
/// persisted delegate record that links create and destroy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxId(String);

impl SandboxId {
    /// Create a sandbox ID from a string.
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SandboxId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SandboxId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<SandboxId> for String {
    fn from(id: SandboxId) -> String {
        id.0
    }
}

/// One requested network attachment for a sandbox.
///
/// This is the element type of the pod's `networks` annotation; unknown
/// fields in the annotation are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    /// Network name; resolves to a network descriptor.
    #[serde(default)]
    pub name: String,
    /// Optional MAC override for the attachment's interface.
    #[serde(rename = "ifMac", default, skip_serializing_if = "Option::is_none")]
    pub if_mac: Option<String>,
    /// Whether this attachment is the sandbox's primary data-plane network.
    #[serde(rename = "isPrimary", default)]
    pub is_primary: bool,
    /// Names of attachments layered on top of this one.
    #[serde(rename = "upperLayers", default, skip_serializing_if = "Option::is_none")]
    pub upper_layers: Option<Vec<String>>,
    /// Namespace override for the network descriptor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Whether the dynamic-attachment agent should leave this network alone.
    #[serde(rename = "agentSkip", default)]
    pub agent_skip: bool,
}

impl NetworkAttachment {
    /// Create an attachment for the given network name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Create the synthetic primary attachment used when a sandbox has no
    /// explicit network annotation (empty name signals pass-through).
    pub fn synthetic_primary() -> Self {
        Self {
            is_primary: true,
            ..Self::default()
        }
    }

    /// Set the MAC override.
    pub fn with_mac(mut self, mac: impl Into<String>) -> Self {
        self.if_mac = Some(mac.into());
        self
    }

    /// Mark the attachment as primary.
    pub fn with_primary(mut self, primary: bool) -> Self {
        self.is_primary = primary;
        self
    }

    /// The MAC override, if one is present and non-empty.
    pub fn mac_override(&self) -> Option<&str> {
        self.if_mac.as_deref().filter(|m| !m.is_empty())
    }
}
