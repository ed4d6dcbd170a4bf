//! Create/destroy orchestration for one CNI invocation.

use serde_json::Value;
use tracing::{debug, info, warn};
use trellis_common::{attachment_ifname, Error, NetworkAttachment, Result, SandboxId};
use trellis_kube::resources::ResourceMap;
use trellis_kube::ClusterClient;

use crate::builder;
use crate::config::NetConf;
use crate::delegate::{self, DelegateConf};
use crate::device::DeviceAllocator;
use crate::invoke::{self, DelegateRunner, InvokeContext, Verb};
use crate::resolver::{self, PodArgs};
use crate::store::DelegateStore;

/// One CNI invocation of this plugin, as handed over by the runtime.
#[derive(Debug, Clone, Default)]
pub struct CmdArgs {
    pub container_id: String,
    pub netns: String,
    pub ifname: String,
    pub args: String,
    pub path: String,
}

/// Drives create and destroy for one command invocation.
pub struct Orchestrator<'a> {
    cluster: &'a dyn ClusterClient,
    runner: &'a dyn DelegateRunner,
    store: DelegateStore,
    device_snapshot: Option<ResourceMap>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        cluster: &'a dyn ClusterClient,
        runner: &'a dyn DelegateRunner,
        store: DelegateStore,
    ) -> Self {
        Self {
            cluster,
            runner,
            store,
            device_snapshot: None,
        }
    }

    /// Use a pre-fetched device snapshot instead of querying the kubelet.
    pub fn with_device_snapshot(mut self, snapshot: ResourceMap) -> Self {
        self.device_snapshot = Some(snapshot);
        self
    }

    fn allocator(&self) -> DeviceAllocator {
        match &self.device_snapshot {
            Some(snapshot) => DeviceAllocator::with_snapshot(snapshot.clone()),
            None => DeviceAllocator::new(),
        }
    }

    /// Create: resolve the sandbox's attachments, build and validate the
    /// delegate list, invoke every delegate in order, persist the applied
    /// set and return the primary result document.
    ///
    /// A delegate failure rolls back the already-invoked prefix (in
    /// invocation order, teardown failures logged and swallowed) and
    /// leaves no record behind.
    pub async fn create(&self, args: &CmdArgs, conf: &NetConf) -> Result<Value> {
        let sandbox = SandboxId::from(args.container_id.as_str());
        let pod_args = PodArgs::parse(&args.args);
        info!(
            sandbox = %sandbox,
            pod = %pod_args.name,
            namespace = %pod_args.namespace,
            "creating network attachments"
        );

        let (mut attachments, aux_only, pod) =
            resolver::pod_attachments(self.cluster, &pod_args).await?;
        let have_primary = resolver::validate_attachments(&attachments)?;

        let explicit = attachments.first().map(|a| !a.name.is_empty()).unwrap_or(false);
        let mut delegates = if explicit {
            let mut allocator = self.allocator();
            let resolved = builder::build_delegates(
                self.cluster,
                &mut allocator,
                &attachments,
                aux_only,
                pod.as_ref(),
            )
            .await?;
            if !have_primary && !aux_only {
                // The statically declared delegates own the primary
                // interface; a placeholder attachment keeps index i of the
                // attachment list aligned with delegate i.
                attachments.insert(0, NetworkAttachment::synthetic_primary());
                let mut combined = conf.delegates.clone();
                combined.extend(resolved);
                combined
            } else {
                resolved
            }
        } else {
            conf.delegates.clone()
        };

        delegate::validate_delegates(&delegates)?;

        let mut result: Option<Value> = None;
        let fallback = NetworkAttachment::default();
        for i in 0..delegates.len() {
            if !conf.cni_version.is_empty() {
                delegates[i].set_cni_version(&conf.cni_version);
            }
            let attachment = attachments.get(i).unwrap_or(&fallback);
            let track = delegates[i].is_master_plugin() || aux_only;
            let ctx = self.add_context(args, &delegates[i], attachment);
            match self.runner.add(&ctx, &delegates[i]).await {
                Ok(value) => {
                    if track && result.is_none() && !value.is_null() {
                        result = Some(value);
                    }
                }
                Err(err) => {
                    let plugin = delegates[i].plugin_type().unwrap_or("").to_string();
                    if invoke::exempt_create_failure(&plugin, &err.to_string()) {
                        warn!(
                            plugin = %plugin,
                            error = %err,
                            "treating already-exists failure as success"
                        );
                        if track && result.is_none() {
                            result = Some(Value::Object(serde_json::Map::new()));
                        }
                        continue;
                    }
                    warn!(
                        index = i,
                        plugin = %plugin,
                        error = %err,
                        "delegate failed, rolling back the applied prefix"
                    );
                    self.rollback(args, &delegates[..i]).await;
                    return Err(err);
                }
            }
        }

        let Some(result) = result else {
            return Err(Error::Internal(
                "delegate sequence produced no result".to_string(),
            ));
        };

        self.store.save(&sandbox, true, delegates).await?;
        info!(sandbox = %sandbox, "network attachments created");
        Ok(result)
    }

    /// Destroy: tear down what this sandbox's record says was created.
    ///
    /// A gone pod or an absent record means nothing to tear down. The
    /// surviving remainder of the record is rewritten before any teardown
    /// runs, and the first teardown failure aborts the invocation.
    pub async fn destroy(&self, args: &CmdArgs) -> Result<()> {
        let sandbox = SandboxId::from(args.container_id.as_str());
        let pod_args = PodArgs::parse(&args.args);
        info!(
            sandbox = %sandbox,
            pod = %pod_args.name,
            namespace = %pod_args.namespace,
            "destroying network attachments"
        );

        let (attachments, aux_only, _pod) =
            match resolver::pod_attachments(self.cluster, &pod_args).await {
                Ok(resolved) => resolved,
                Err(err) if err.is_pod_not_found() => {
                    info!(sandbox = %sandbox, "pod already gone, nothing to tear down");
                    return Ok(());
                }
                Err(err) => return Err(err),
            };

        let bytes = match self.store.consume(&sandbox).await {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(sandbox = %sandbox, error = %err, "no delegate record, nothing to tear down");
                return Ok(());
            }
        };
        let delegates: Vec<DelegateConf> = serde_json::from_slice(&bytes).map_err(|e| {
            Error::Persistence(format!("cannot decode delegate record for {}: {}", sandbox, e))
        })?;

        let mut to_delete = Vec::new();
        let mut to_keep = Vec::new();
        for conf in delegates {
            match conf.network_name() {
                None if !aux_only => to_delete.push(conf),
                None => to_keep.push(conf),
                Some(name) => {
                    if attachments.iter().any(|a| a.name == name) {
                        to_delete.push(conf);
                    } else {
                        to_keep.push(conf);
                    }
                }
            }
        }

        // Rewrite the surviving remainder before tearing anything down, so
        // a crash mid-teardown leaves it on disk.
        if let Err(err) = self.store.save(&sandbox, false, to_keep).await {
            warn!(sandbox = %sandbox, error = %err, "cannot rewrite remaining delegate record");
        }

        for conf in &to_delete {
            let ctx = self.del_context(args, conf);
            self.runner.del(&ctx, conf).await?;
        }

        info!(sandbox = %sandbox, torn_down = to_delete.len(), "network attachments destroyed");
        Ok(())
    }

    fn add_context(
        &self,
        args: &CmdArgs,
        conf: &DelegateConf,
        attachment: &NetworkAttachment,
    ) -> InvokeContext {
        let (ifname, extra_args) = if conf.is_master_plugin() {
            (args.ifname.clone(), Vec::new())
        } else {
            let extra = match attachment.mac_override() {
                Some(mac) => vec![
                    ("IgnoreUnknown".to_string(), "1".to_string()),
                    ("CNI_IFMAC".to_string(), mac.to_string()),
                ],
                None => Vec::new(),
            };
            (attachment_ifname(&attachment.name), extra)
        };
        InvokeContext {
            verb: Verb::Add,
            container_id: args.container_id.clone(),
            netns: args.netns.clone(),
            ifname,
            extra_args,
            paths: args.path.clone(),
        }
    }

    fn del_context(&self, args: &CmdArgs, conf: &DelegateConf) -> InvokeContext {
        let ifname = if conf.is_master_plugin() {
            args.ifname.clone()
        } else {
            attachment_ifname(conf.network_name().unwrap_or(""))
        };
        InvokeContext {
            verb: Verb::Del,
            container_id: args.container_id.clone(),
            netns: args.netns.clone(),
            ifname,
            extra_args: Vec::new(),
            paths: args.path.clone(),
        }
    }

    async fn rollback(&self, args: &CmdArgs, invoked: &[DelegateConf]) {
        for conf in invoked {
            let ctx = self.del_context(args, conf);
            if let Err(err) = self.runner.del(&ctx, conf).await {
                warn!(
                    plugin = conf.plugin_type().unwrap_or(""),
                    error = %err,
                    "rollback teardown failed"
                );
            }
        }
    }
}
