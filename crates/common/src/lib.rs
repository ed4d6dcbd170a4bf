//! Common types and utilities shared across the trellis delegation plugin.
//!
//! This crate provides:
//! - Core domain types (SandboxId, NetworkAttachment)
//! - Error handling types and the CNI error-code mapping
//! - The derived interface-name scheme for auxiliary attachments

pub mod error;
pub mod ifname;
pub mod types;

// Re-export commonly used items
pub use error::{CniErrorReply, Error, Result};
pub use ifname::attachment_ifname;
pub use types::{NetworkAttachment, SandboxId};
