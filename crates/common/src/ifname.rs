//! Derived interface naming for auxiliary attachments.
//!
//! Non-master delegates get a deterministic interface name computed from the
//! attachment's network name, so repeated invocations for the same network
//! always address the same interface.

use md5::{Digest, Md5};

/// Maximum interface name length on Linux (IFNAMSIZ minus the NUL).
pub const MAX_IFNAME_LEN: usize = 15;

const IFNAME_PREFIX: &str = "net";

/// Derive the delegate-facing interface name for a network.
///
/// The name is `net` followed by the lowercase hex MD5 of the network name,
/// truncated to [`MAX_IFNAME_LEN`] bytes. Must stay bit-exact across
/// releases: persisted delegates are torn down by re-deriving this name.
pub fn attachment_ifname(network_name: &str) -> String {
    let digest = Md5::digest(network_name.as_bytes());
    let mut ifname = format!("{}{:x}", IFNAME_PREFIX, digest);
    ifname.truncate(MAX_IFNAME_LEN);
    ifname
}
