//! Network configuration handed to the plugin on stdin.

use std::path::PathBuf;

use serde::Deserialize;
use trellis_common::{Error, Result};
use trellis_kube::ClusterAccess;

use crate::delegate::DelegateConf;

const DEFAULT_CNI_DIR: &str = "/var/lib/cni/trellis";

/// Top-level configuration for one invocation of the meta-plugin.
///
/// Unknown keys are ignored so runtimes can carry extra bookkeeping
/// fields without breaking us.
#[derive(Debug, Clone, Deserialize)]
pub struct NetConf {
    /// CNI version of this configuration, injected into every delegate.
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    /// Name of this network configuration.
    #[serde(default)]
    pub name: String,
    /// Plugin type, i.e. this binary.
    #[serde(rename = "type", default)]
    pub plugin_type: String,
    /// Directory holding the per-sandbox delegate records.
    #[serde(rename = "cniDir", default = "default_cni_dir")]
    pub cni_dir: PathBuf,
    /// Statically declared delegates, used when no attachment names one.
    #[serde(default)]
    pub delegates: Vec<DelegateConf>,
    /// Cluster API access overrides.
    #[serde(default)]
    pub cluster: ClusterAccess,
}

fn default_cni_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CNI_DIR)
}

impl NetConf {
    /// Decode the configuration bytes read from stdin.
    pub fn load(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::Config(format!("cannot decode network configuration: {}", e)))
    }
}
