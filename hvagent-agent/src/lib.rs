//! Node-level hypervisor control agent.
//!
//! Receives typed commands from an orchestrator and drives the local
//! libvirt/QEMU hypervisor: builds domain descriptors from instance specs,
//! boots and stops domains, samples utilization, scales CPU, and performs
//! live snapshot merges.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod accounting;
pub mod builder;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod dispatch;
pub mod error;
pub mod guest_os;
pub mod handlers;
pub mod merge;
pub mod native;
pub mod probe;
mod process;
pub mod stats;
pub mod storage;
pub mod vif;
pub mod virsh;

pub use builder::DomainBuilder;
pub use config::AgentConfig;
pub use context::AgentContext;
pub use descriptor::DomainDescriptor;
pub use dispatch::{CommandHandler, Dispatcher};
pub use error::{AgentError, NativeError, StorageError, VifError};
pub use merge::MergeCoordinator;
pub use native::{Domain, HypervisorConnection};
