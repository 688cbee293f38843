//! Commands accepted by the agent and the answers it returns.
//!
//! Commands arrive already deserialized; the serde representation below is
//! the adjacently tagged form `{"type": "<tag>", "payload": {...}}` used when
//! commands are read from JSON.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::capability::CapabilitySnapshot;
use crate::id::DomainName;
use crate::instance::InstanceSpec;
use crate::stats::VmStatsEntry;

/// Command type tags, as used on the wire and as dispatcher registry keys.
pub mod tag {
    pub const START_INSTANCE: &str = "start_instance";
    pub const STOP_INSTANCE: &str = "stop_instance";
    pub const GET_VM_STATS: &str = "get_vm_stats";
    pub const MERGE_SNAPSHOT: &str = "merge_snapshot";
    pub const SCALE_CPU: &str = "scale_cpu";
    pub const GET_DOMAIN_XML: &str = "get_domain_xml";
    pub const REFRESH_CAPABILITIES: &str = "refresh_capabilities";
    pub const CHECK_HEALTH: &str = "check_health";
}

/// A request from the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
#[non_exhaustive]
pub enum Command {
    /// Define and boot a domain from an instance spec.
    StartInstance(StartInstance),
    /// Shut down or destroy a running domain.
    StopInstance(StopInstance),
    /// Sample counters and utilization of running domains.
    GetVmStats(GetVmStats),
    /// Live-merge a disk snapshot layer into its base.
    MergeSnapshot(MergeSnapshot),
    /// Re-apply CPU shares and quota to a running domain.
    ScaleCpu(ScaleCpu),
    /// Fetch the live domain XML.
    GetDomainXml(GetDomainXml),
    /// Re-run the capability probe and replace the cached snapshot.
    RefreshCapabilities,
    /// Verify the hypervisor connection is usable.
    CheckHealth,
}

impl Command {
    /// Every tag a [`Command`] can carry.
    pub const TAGS: &'static [&'static str] = &[
        tag::START_INSTANCE,
        tag::STOP_INSTANCE,
        tag::GET_VM_STATS,
        tag::MERGE_SNAPSHOT,
        tag::SCALE_CPU,
        tag::GET_DOMAIN_XML,
        tag::REFRESH_CAPABILITIES,
        tag::CHECK_HEALTH,
    ];

    /// The type tag of this command.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::StartInstance(_) => tag::START_INSTANCE,
            Self::StopInstance(_) => tag::STOP_INSTANCE,
            Self::GetVmStats(_) => tag::GET_VM_STATS,
            Self::MergeSnapshot(_) => tag::MERGE_SNAPSHOT,
            Self::ScaleCpu(_) => tag::SCALE_CPU,
            Self::GetDomainXml(_) => tag::GET_DOMAIN_XML,
            Self::RefreshCapabilities => tag::REFRESH_CAPABILITIES,
            Self::CheckHealth => tag::CHECK_HEALTH,
        }
    }
}

/// Payload of [`Command::StartInstance`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartInstance {
    pub spec: InstanceSpec,
}

/// Payload of [`Command::StopInstance`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopInstance {
    pub name: DomainName,
    /// Destroy immediately instead of requesting an ACPI shutdown.
    #[serde(default)]
    pub force: bool,
}

/// Payload of [`Command::GetVmStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetVmStats {
    pub names: Vec<DomainName>,
}

/// Payload of [`Command::MergeSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSnapshot {
    pub domain: DomainName,
    /// Target device of the disk, e.g. `vda`.
    pub disk_label: String,
    /// Image the top layer is merged into.
    pub base_path: PathBuf,
    /// Snapshot layer being merged away.
    pub top_path: PathBuf,
}

/// Payload of [`Command::ScaleCpu`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleCpu {
    pub name: DomainName,
    pub cpus: u32,
    pub speed_mhz: u32,
    #[serde(default)]
    pub limit_cpu_use: bool,
    #[serde(default)]
    pub cpu_quota_percentage: Option<f64>,
}

/// Payload of [`Command::GetDomainXml`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetDomainXml {
    pub name: DomainName,
}

/// Operation-specific part of an [`Answer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[non_exhaustive]
pub enum AnswerResult {
    /// No operation-specific data (failures, health checks).
    None,
    /// The command tag has no registered handler.
    Unsupported,
    Started {
        name: DomainName,
        max_vcpus: u32,
        current_memory_kib: u64,
        max_memory_kib: u64,
    },
    Stopped {
        name: DomainName,
    },
    VmStats {
        stats: BTreeMap<DomainName, VmStatsEntry>,
    },
    Merged {
        domain: DomainName,
        disk_label: String,
        /// Whether the library removed the top image itself.
        deleted_by_library: bool,
    },
    CpuScaled {
        name: DomainName,
        shares: u64,
        quota: i64,
        period: u64,
    },
    DomainXml {
        name: DomainName,
        xml: String,
    },
    Capabilities {
        snapshot: CapabilitySnapshot,
    },
}

/// The agent's reply to exactly one [`Command`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Answer {
    /// Tag of the command this answers.
    pub command: String,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Human-readable outcome; the error chain on failure.
    pub details: String,
    /// Operation-specific fields.
    pub result: AnswerResult,
}

impl Answer {
    /// A successful answer.
    pub fn success(command: impl Into<String>, details: impl Into<String>, result: AnswerResult) -> Self {
        Self {
            command: command.into(),
            success: true,
            details: details.into(),
            result,
        }
    }

    /// A failed answer carrying only a message.
    pub fn failure(command: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            success: false,
            details: details.into(),
            result: AnswerResult::None,
        }
    }

    /// The distinguished answer for a command with no registered handler.
    pub fn unsupported(command: impl Into<String>) -> Self {
        let command = command.into();
        Self {
            details: format!("unsupported command '{command}'"),
            command,
            success: false,
            result: AnswerResult::Unsupported,
        }
    }

    /// Returns `true` if this is an unsupported-command answer.
    #[must_use]
    pub fn is_unsupported(&self) -> bool {
        matches!(self.result, AnswerResult::Unsupported)
    }
}
