//! Delegate plugin invocation over the exec transport.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;
use trellis_common::{CniErrorReply, Error, Result};

use crate::delegate::DelegateConf;

/// CNI verbs passed on to delegate binaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Add,
    Del,
}

impl Verb {
    /// Value for the child's `CNI_COMMAND` variable.
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Add => "ADD",
            Verb::Del => "DEL",
        }
    }
}

/// Everything one delegate invocation needs.
///
/// The values are applied to the child's environment only; the plugin's
/// own environment is never mutated, so invocations cannot bleed state
/// into each other.
#[derive(Debug, Clone)]
pub struct InvokeContext {
    pub verb: Verb,
    pub container_id: String,
    pub netns: String,
    pub ifname: String,
    /// Auxiliary `CNI_ARGS` pairs. When empty, the child inherits the
    /// runtime's own value.
    pub extra_args: Vec<(String, String)>,
    /// Colon-separated plugin search path, passed through as `CNI_PATH`.
    pub paths: String,
}

impl InvokeContext {
    fn args_value(&self) -> Option<String> {
        if self.extra_args.is_empty() {
            return None;
        }
        Some(
            self.extra_args
                .iter()
                .map(|(key, value)| format!("{}={}", key, value))
                .collect::<Vec<_>>()
                .join(";"),
        )
    }
}

/// Transport for delegate plugin invocations.
#[async_trait]
pub trait DelegateRunner: Send + Sync {
    /// Run a delegate's create and return its result document.
    ///
    /// # Errors
    ///
    /// Returns [`trellis_common::Error::Delegate`] when the binary cannot
    /// be found or spawned, or when it reports failure.
    async fn add(&self, ctx: &InvokeContext, conf: &DelegateConf) -> Result<Value>;

    /// Run a delegate's teardown.
    async fn del(&self, ctx: &InvokeContext, conf: &DelegateConf) -> Result<()>;
}

/// Runner spawning delegate binaries found on the search path.
pub struct ExecRunner;

impl ExecRunner {
    pub fn new() -> Self {
        Self
    }

    fn find_plugin(&self, plugin: &str, paths: &str) -> Result<PathBuf> {
        for dir in paths.split(':').filter(|d| !d.is_empty()) {
            let candidate = Path::new(dir).join(plugin);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(Error::Delegate {
            plugin: plugin.to_string(),
            message: format!("failed to find plugin in path [{}]", paths),
        })
    }

    async fn invoke(&self, ctx: &InvokeContext, conf: &DelegateConf) -> Result<Value> {
        let plugin = conf
            .plugin_type()
            .ok_or_else(|| Error::Config("delegate must have the field type".to_string()))?
            .to_string();
        let binary = self.find_plugin(&plugin, &ctx.paths)?;
        let payload = conf.to_json()?;

        debug!(
            plugin = %plugin,
            command = ctx.verb.as_str(),
            ifname = %ctx.ifname,
            "invoking delegate"
        );

        let mut command = Command::new(&binary);
        command
            .env("CNI_COMMAND", ctx.verb.as_str())
            .env("CNI_CONTAINERID", &ctx.container_id)
            .env("CNI_NETNS", &ctx.netns)
            .env("CNI_IFNAME", &ctx.ifname)
            .env("CNI_PATH", &ctx.paths)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(args) = ctx.args_value() {
            command.env("CNI_ARGS", args);
        }

        let mut child = command.spawn().map_err(|e| Error::Delegate {
            plugin: plugin.clone(),
            message: format!("cannot spawn {}: {}", binary.display(), e),
        })?;
        if let Some(mut stdin) = child.stdin.take() {
            // A plugin that exits before reading its config breaks the
            // pipe; its exit status carries the real failure.
            if let Err(e) = stdin.write_all(&payload).await {
                debug!(plugin = %plugin, error = %e, "short write to delegate stdin");
            }
        }
        let output = child.wait_with_output().await.map_err(|e| Error::Delegate {
            plugin: plugin.clone(),
            message: format!("cannot collect delegate output: {}", e),
        })?;

        if output.status.success() {
            if output.stdout.is_empty() {
                return Ok(Value::Null);
            }
            serde_json::from_slice(&output.stdout).map_err(|e| Error::Delegate {
                plugin,
                message: format!("cannot decode delegate result: {}", e),
            })
        } else {
            Err(Error::Delegate {
                plugin,
                message: failure_message(&output),
            })
        }
    }
}

impl Default for ExecRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DelegateRunner for ExecRunner {
    async fn add(&self, ctx: &InvokeContext, conf: &DelegateConf) -> Result<Value> {
        self.invoke(ctx, conf).await
    }

    async fn del(&self, ctx: &InvokeContext, conf: &DelegateConf) -> Result<()> {
        self.invoke(ctx, conf).await.map(|_| ())
    }
}

/// Fold a failed delegate's output into one message, preferring the
/// structured error object it printed on stdout.
fn failure_message(output: &std::process::Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    if let Ok(reply) = serde_json::from_str::<CniErrorReply>(stdout.trim()) {
        if reply.details.is_empty() {
            return format!("code {}: {}", reply.code, reply.msg);
        }
        return format!("code {}: {}: {}", reply.code, reply.msg, reply.details);
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    format!(
        "exit {}: {} {}",
        output.status.code().unwrap_or(-1),
        stdout.trim(),
        stderr.trim()
    )
}

/// Create failures that are treated as success, keyed by plugin type and
/// a pattern over the failure message. Narrow compatibility shim for
/// plugins whose create is not idempotent under supervisor retries.
const IDEMPOTENT_CREATE_ERRORS: &[(&str, &str)] = &[("ovs", "interface .* already exists")];

/// Whether a failed create for `plugin` matches an exemption pattern.
pub fn exempt_create_failure(plugin: &str, message: &str) -> bool {
    for (exempt_plugin, pattern) in IDEMPOTENT_CREATE_ERRORS {
        if plugin != *exempt_plugin {
            continue;
        }
        if let Ok(re) = Regex::new(pattern) {
            if re.is_match(message) {
                return true;
            }
        }
    }
    false
}
