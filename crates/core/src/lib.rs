//! Delegation engine for the trellis meta-plugin.
//!
//! The engine turns one CNI invocation into an ordered sequence of delegate
//! plugin invocations: it resolves the sandbox's requested attachments from
//! pod metadata, renders one delegate configuration per attachment from the
//! cluster's network descriptors, runs the delegates in order, and keeps a
//! durable per-sandbox record so teardown can replay the same set.

pub mod builder;
pub mod config;
pub mod delegate;
pub mod device;
pub mod invoke;
pub mod orchestrator;
pub mod resolver;
pub mod store;

pub use config::NetConf;
pub use delegate::DelegateConf;
pub use orchestrator::{CmdArgs, Orchestrator};
