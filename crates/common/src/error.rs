//! Error types for the trellis delegation plugin.

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Invalid environment variables (CNI well-known code).
pub const ERR_INVALID_ENVIRONMENT: u32 = 4;
/// I/O failure (CNI well-known code).
pub const ERR_IO_FAILURE: u32 = 5;
/// Failed to decode content (CNI well-known code).
pub const ERR_DECODING_FAILURE: u32 = 6;
/// Invalid network configuration (CNI well-known code).
pub const ERR_INVALID_NETWORK_CONFIG: u32 = 7;
/// Cluster API or device accounting request failed.
pub const ERR_UPSTREAM: u32 = 100;
/// A delegate plugin invocation failed.
pub const ERR_DELEGATE: u32 = 101;
/// The per-sandbox delegate record could not be read or written.
pub const ERR_PERSISTENCE: u32 = 102;
/// The requested operation is not implemented.
pub const ERR_NOT_IMPLEMENTED: u32 = 103;
/// Unrecovered internal fault.
pub const ERR_INTERNAL: u32 = 999;

/// Main error type for the trellis delegation plugin.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed top-level or delegate configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The sandbox's pod object does not exist.
    #[error("Pod {namespace}/{name} not found")]
    PodNotFound { namespace: String, name: String },

    /// A cluster API or device accounting request failed.
    #[error("Upstream request failed: {0}")]
    Upstream(String),

    /// A delegate plugin invocation failed.
    #[error("Delegate {plugin} failed: {message}")]
    Delegate { plugin: String, message: String },

    /// The per-sandbox delegate record could not be read, written or decoded.
    #[error("Delegate record error: {0}")]
    Persistence(String),

    /// A required environment variable is missing or malformed.
    #[error("Invalid environment: {0}")]
    InvalidEnv(String),

    /// The requested command verb is not implemented.
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    /// JSON encoding/decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Internal error (unexpected condition).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error means the sandbox's pod is gone.
    ///
    /// Destroy treats this as "nothing to tear down" rather than a failure.
    pub fn is_pod_not_found(&self) -> bool {
        matches!(self, Error::PodNotFound { .. })
    }

    /// Numeric error code for the CNI structured error object.
    pub fn cni_code(&self) -> u32 {
        match self {
            Error::Config(_) => ERR_INVALID_NETWORK_CONFIG,
            Error::PodNotFound { .. } | Error::Upstream(_) => ERR_UPSTREAM,
            Error::Delegate { .. } => ERR_DELEGATE,
            Error::Persistence(_) => ERR_PERSISTENCE,
            Error::InvalidEnv(_) => ERR_INVALID_ENVIRONMENT,
            Error::NotImplemented(_) => ERR_NOT_IMPLEMENTED,
            Error::Json(_) => ERR_DECODING_FAILURE,
            Error::Io(_) => ERR_IO_FAILURE,
            Error::Internal(_) => ERR_INTERNAL,
        }
    }

    /// Short category label for the CNI error object's `msg` field.
    pub fn cni_msg(&self) -> &'static str {
        match self {
            Error::Config(_) => "invalid network configuration",
            Error::PodNotFound { .. } | Error::Upstream(_) => "upstream request failed",
            Error::Delegate { .. } => "delegate invocation failed",
            Error::Persistence(_) => "delegate record failure",
            Error::InvalidEnv(_) => "invalid environment variables",
            Error::NotImplemented(_) => "not implemented",
            Error::Json(_) => "decoding failure",
            Error::Io(_) => "I/O failure",
            Error::Internal(_) => "internal error",
        }
    }
}

/// Structured CNI error object, printed to stdout on failure.
///
/// Delegate plugins emit the same shape on their own failures, so this type
/// is used both to render our errors and to decode theirs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CniErrorReply {
    /// CNI version of the configuration that failed.
    #[serde(rename = "cniVersion", default, skip_serializing_if = "String::is_empty")]
    pub cni_version: String,
    /// Numeric error code.
    pub code: u32,
    /// Short category label.
    pub msg: String,
    /// Full error text.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
}

impl CniErrorReply {
    /// Render an [`Error`] into the structured CNI error object.
    pub fn from_error(err: &Error, cni_version: &str) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            code: err.cni_code(),
            msg: err.cni_msg().to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Delegate {
            plugin: "bridge".to_string(),
            message: "no such device".to_string(),
        };
        assert_eq!(err.to_string(), "Delegate bridge failed: no such device");
    }

    #[test]
    fn test_cni_code_mapping() {
        assert_eq!(Error::Config("x".to_string()).cni_code(), 7);
        assert_eq!(Error::InvalidEnv("x".to_string()).cni_code(), 4);
        assert_eq!(Error::Upstream("x".to_string()).cni_code(), 100);
        assert_eq!(Error::Persistence("x".to_string()).cni_code(), 102);
        assert_eq!(Error::Internal("x".to_string()).cni_code(), 999);
    }

    #[test]
    fn test_is_pod_not_found() {
        let err = Error::PodNotFound {
            namespace: "default".to_string(),
            name: "web-0".to_string(),
        };
        assert!(err.is_pod_not_found());
        assert!(!Error::Upstream("503".to_string()).is_pod_not_found());
    }

    #[test]
    fn test_error_reply_serialization() {
        let reply = CniErrorReply::from_error(&Error::Config("bad".to_string()), "1.0.0");
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["cniVersion"], "1.0.0");
        assert_eq!(json["code"], 7);
        assert_eq!(json["msg"], "invalid network configuration");
        assert_eq!(json["details"], "Invalid configuration: bad");
    }

    #[test]
    fn test_error_reply_skips_empty_fields() {
        let reply = CniErrorReply {
            cni_version: String::new(),
            code: 999,
            msg: "internal error".to_string(),
            details: String::new(),
        };
        let json = serde_json::to_string(&reply).unwrap();
        assert!(!json.contains("cniVersion"));
        assert!(!json.contains("details"));
    }
}
