//! The CNI process contract: environment variables, stdin, verbs and
//! replies.

use std::env;

use tokio::io::AsyncReadExt;
use tracing::debug;
use trellis_common::{Error, Result};
use trellis_core::invoke::ExecRunner;
use trellis_core::store::DelegateStore;
use trellis_core::{CmdArgs, NetConf, Orchestrator};
use trellis_kube::ApiServerClient;

/// CNI spec version this plugin reports and stamps into error replies.
pub const CNI_VERSION: &str = "1.0.0";

/// Configuration versions this plugin accepts.
pub const SUPPORTED_VERSIONS: &[&str] = &["0.1.0", "0.2.0", "0.3.0", "0.3.1", "0.4.0", "1.0.0"];

/// Cap on the configuration document read from stdin.
const MAX_CONFIG_BYTES: u64 = 1024 * 1024;

/// Dispatch one CNI invocation. The Ok value is what to print on stdout,
/// if anything.
pub async fn run() -> Result<Option<String>> {
    let verb = env::var("CNI_COMMAND")
        .map_err(|_| Error::InvalidEnv("CNI_COMMAND is not set".to_string()))?;
    debug!(command = %verb, "dispatching command");

    match verb.as_str() {
        "ADD" => {
            let args = cmd_args(true)?;
            let conf = read_conf().await?;
            let cluster = ApiServerClient::new(&conf.cluster).await?;
            let runner = ExecRunner::new();
            let store = DelegateStore::new(conf.cni_dir.clone());
            let orchestrator = Orchestrator::new(&cluster, &runner, store);
            let result = orchestrator.create(&args, &conf).await?;
            Ok(Some(serde_json::to_string(&result)?))
        }
        "DEL" => {
            let args = cmd_args(false)?;
            let conf = read_conf().await?;
            let cluster = ApiServerClient::new(&conf.cluster).await?;
            let runner = ExecRunner::new();
            let store = DelegateStore::new(conf.cni_dir.clone());
            Orchestrator::new(&cluster, &runner, store).destroy(&args).await?;
            Ok(None)
        }
        "CHECK" => Err(Error::NotImplemented("CHECK")),
        "VERSION" => Ok(Some(version_reply()?)),
        other => Err(Error::InvalidEnv(format!("unknown CNI_COMMAND {}", other))),
    }
}

/// Collect the runtime-provided invocation variables. `CNI_NETNS` is only
/// required for create; teardown can proceed without a namespace.
fn cmd_args(netns_required: bool) -> Result<CmdArgs> {
    let container_id = require_env("CNI_CONTAINERID")?;
    let ifname = require_env("CNI_IFNAME")?;
    let netns = match env::var("CNI_NETNS") {
        Ok(value) if !value.is_empty() => value,
        _ if netns_required => {
            return Err(Error::InvalidEnv("CNI_NETNS is not set".to_string()));
        }
        _ => String::new(),
    };
    Ok(CmdArgs {
        container_id,
        netns,
        ifname,
        args: env::var("CNI_ARGS").unwrap_or_default(),
        path: env::var("CNI_PATH").unwrap_or_default(),
    })
}

fn require_env(key: &'static str) -> Result<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(Error::InvalidEnv(format!("{} is not set", key))),
    }
}

/// Read and decode the network configuration from stdin.
async fn read_conf() -> Result<NetConf> {
    let mut buf = Vec::new();
    tokio::io::stdin()
        .take(MAX_CONFIG_BYTES)
        .read_to_end(&mut buf)
        .await?;
    NetConf::load(&buf)
}

fn version_reply() -> Result<String> {
    let reply = serde_json::json!({
        "cniVersion": CNI_VERSION,
        "supportedVersions": SUPPORTED_VERSIONS,
    });
    Ok(serde_json::to_string(&reply)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_reply_shape() {
        let reply: serde_json::Value = serde_json::from_str(&version_reply().unwrap()).unwrap();
        assert_eq!(reply["cniVersion"], "1.0.0");
        let versions = reply["supportedVersions"].as_array().unwrap();
        assert_eq!(versions.len(), 6);
        assert!(versions.contains(&serde_json::Value::String("0.3.1".to_string())));
    }

    #[test]
    fn test_require_env_rejects_missing_variable() {
        let err = require_env("TRELLIS_TEST_SURELY_UNSET").unwrap_err();
        assert!(matches!(err, Error::InvalidEnv(_)));
        assert!(err.to_string().contains("TRELLIS_TEST_SURELY_UNSET"));
    }
}
