//! Delegate configurations: the model, validation and rendering.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use trellis_common::{Error, Result};

const TYPE_KEY: &str = "type";
const NETWORK_NAME_KEY: &str = "networkName";
const MASTER_PLUGIN_KEY: &str = "masterPlugin";
const CNI_VERSION_KEY: &str = "cniVersion";

/// One delegate plugin's configuration, an ordered JSON object.
///
/// Beyond the handful of keys this engine reads, the object is opaque and
/// handed to the delegate binary byte-faithfully: key order and numeric
/// literals survive a decode/encode cycle unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DelegateConf(Map<String, Value>);

impl DelegateConf {
    /// Build from a decoded JSON value; non-objects are rejected.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(Error::Config("delegate must be a JSON object".to_string())),
        }
    }

    /// The delegate's plugin binary name, when present and a string.
    pub fn plugin_type(&self) -> Option<&str> {
        self.0.get(TYPE_KEY).and_then(Value::as_str)
    }

    /// The attachment name this delegate was rendered from, when present
    /// and a string.
    pub fn network_name(&self) -> Option<&str> {
        self.0.get(NETWORK_NAME_KEY).and_then(Value::as_str)
    }

    /// Whether this delegate owns the sandbox's primary interface. Only a
    /// literal `true` counts.
    pub fn is_master_plugin(&self) -> bool {
        self.0
            .get(MASTER_PLUGIN_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Stamp the top-level CNI version into the object before invocation.
    pub fn set_cni_version(&mut self, version: &str) {
        self.0.insert(
            CNI_VERSION_KEY.to_string(),
            Value::String(version.to_string()),
        );
    }

    /// Serialize for handing to the delegate binary.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.0)?)
    }
}

fn check_delegate(conf: &DelegateConf, found_master: &mut bool) -> Result<()> {
    match conf.0.get(TYPE_KEY) {
        None => return Err(Error::Config("delegate must have the field type".to_string())),
        Some(value) if !value.is_string() => {
            return Err(Error::Config("delegate field type must be a string".to_string()))
        }
        _ => {}
    }
    if conf.is_master_plugin() {
        if *found_master {
            return Err(Error::Config(
                "only one delegate can have masterPlugin set to true".to_string(),
            ));
        }
        *found_master = true;
    }
    Ok(())
}

/// Validate a delegate list before anything is invoked: every entry must
/// carry a string `type`, and at most one may be the master plugin.
pub fn validate_delegates(delegates: &[DelegateConf]) -> Result<()> {
    let mut found_master = false;
    for conf in delegates {
        check_delegate(conf, &mut found_master)?;
    }
    Ok(())
}

/// A device paired with an attachment while building its delegate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceBinding {
    pub device_id: String,
    pub resource_name: String,
}

/// Render one delegate configuration from a descriptor's plugin name and
/// config fragment.
///
/// The engine's own keys lead the object and the fragment's keys follow,
/// spliced in verbatim from the fragment's first quote so the fragment's
/// own closing brace terminates the object.
pub fn render_delegate(
    plugin: &str,
    config: &str,
    network_name: &str,
    primary: bool,
    device: Option<&DeviceBinding>,
) -> Result<String> {
    if plugin.is_empty() || config.is_empty() {
        return Err(Error::Config(format!(
            "network {} has an empty plugin name or config",
            network_name
        )));
    }
    let splice_at = config.find('"').ok_or_else(|| {
        Error::Config(format!(
            "plugin config for network {} has no fields to splice",
            network_name
        ))
    })?;

    let mut rendered = format!(
        r#"{{"type": "{}", "networkName": "{}""#,
        plugin, network_name
    );
    if let Some(device) = device {
        rendered.push_str(&format!(
            r#", "deviceID": "{}", "resourceName": "{}""#,
            device.device_id, device.resource_name
        ));
    }
    if primary {
        rendered.push_str(r#", "masterPlugin": true"#);
    }
    rendered.push_str(", ");
    rendered.push_str(&config[splice_at..]);
    Ok(rendered)
}

/// Decode a JSON array of rendered delegate configurations.
pub fn parse_delegate_list(json_array: &str) -> Result<Vec<DelegateConf>> {
    serde_json::from_str(json_array)
        .map_err(|e| Error::Config(format!("cannot decode delegate list: {}", e)))
}
