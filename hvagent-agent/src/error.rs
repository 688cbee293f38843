//! Error types for the agent crate.

use std::path::PathBuf;
use std::time::Duration;

use hvagent_core::{CoreError, DomainName, StoragePoolType, TrafficType};

/// Errors surfaced by agent components.
///
/// Every variant is converted into a failed answer at the dispatcher
/// boundary; none of them escape to the caller of `dispatch`.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AgentError {
    /// The instance spec or its boot/device details are inconsistent.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A disk's pool or volume could not be resolved.
    #[error(transparent)]
    StorageResolution(#[from] StorageError),

    /// No VIF driver could produce an interface for a NIC.
    #[error(transparent)]
    Vif(#[from] VifError),

    /// The hypervisor client reported a failure.
    #[error("native library error: {0}")]
    NativeLibrary(#[from] NativeError),

    /// The block-commit job failed or could not be started.
    #[error("merge of {disk} on {domain} failed: {reason}")]
    MergeFailed {
        domain: DomainName,
        disk: String,
        reason: String,
    },

    /// A merge stage did not finish in time.
    #[error("merge of {disk} on {domain} timed out after {}s waiting for {stage}", after.as_secs())]
    MergeTimeout {
        domain: DomainName,
        disk: String,
        stage: &'static str,
        after: Duration,
    },

    /// Removing a merged snapshot layer failed for a reason other than it being absent.
    #[error("cleanup of {} failed: {source}", path.display())]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A command payload could not be decoded.
    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

impl From<CoreError> for AgentError {
    fn from(e: CoreError) -> Self {
        Self::Configuration(e.to_string())
    }
}

/// Failures of the hypervisor client.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum NativeError {
    /// The client binary or library is not available.
    #[error("hypervisor client not found at {path}")]
    ClientNotFound { path: PathBuf },

    /// A client process could not be started.
    #[error("failed to run `{command}`: {reason}")]
    Spawn { command: String, reason: String },

    /// A client call exited unsuccessfully.
    #[error("`{command}` failed: {stderr}")]
    CallFailed { command: String, stderr: String },

    /// A client call did not complete in time.
    #[error("`{command}` did not complete within {}s", after.as_secs())]
    Timeout { command: String, after: Duration },

    /// The named domain does not exist.
    #[error("domain not found: {0}")]
    DomainNotFound(DomainName),

    /// Client output could not be interpreted.
    #[error("cannot parse {what}: {reason}")]
    Parse { what: &'static str, reason: String },

    /// The block-job event stream closed before reporting an outcome.
    #[error("block job listener for {disk} on {domain} closed unexpectedly")]
    ListenerClosed { domain: DomainName, disk: String },

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures resolving storage for a disk.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The pool is unknown to the resolver.
    #[error("storage pool {uuid} ({pool_type:?}) not found")]
    PoolNotFound { pool_type: StoragePoolType, uuid: String },

    /// The pool exists but the volume cannot be mapped to a host path.
    #[error("volume {path} not resolvable in pool {uuid}: {reason}")]
    DiskNotFound { uuid: String, path: String, reason: String },
}

/// Failures plugging a NIC.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum VifError {
    /// No driver is registered for the traffic type.
    #[error("no VIF driver registered for {0} traffic")]
    NoDriver(TrafficType),

    /// The driver rejected the NIC.
    #[error("VIF driver failed for NIC {mac}: {reason}")]
    PlugFailed { mac: String, reason: String },
}

/// Failures of the capability probe.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProbeError {
    /// The probe command could not be executed.
    #[error("capability probe failed: {0}")]
    Native(#[from] NativeError),

    /// The probe output did not contain a recognisable version.
    #[error("unrecognised {what} in probe output: {output}")]
    Unrecognised { what: &'static str, output: String },
}

/// Failures loading the agent configuration.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for [`crate::AgentConfig`].
    #[error("cannot parse config: {0}")]
    Toml(#[from] toml::de::Error),

    /// An environment override has an invalid value.
    #[error("invalid value '{value}' for {key}")]
    InvalidOverride { key: String, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_error_wraps_into_agent_error() {
        let err: AgentError = NativeError::DomainNotFound("i-1".into()).into();
        assert!(matches!(err, AgentError::NativeLibrary(_)));
        assert!(err.to_string().contains("domain not found: i-1"));
    }

    #[test]
    fn merge_timeout_display_names_stage() {
        let err = AgentError::MergeTimeout {
            domain: "i-1".into(),
            disk: "vda".to_owned(),
            stage: "block job completion",
            after: Duration::from_secs(30),
        };
        let msg = err.to_string();
        assert!(msg.contains("30s"), "got {msg}");
        assert!(msg.contains("block job completion"), "got {msg}");
    }

    #[test]
    fn core_error_maps_to_configuration() {
        let err: AgentError = CoreError::InvalidInstance {
            field: "cpus".to_owned(),
            reason: "must be at least 1".to_owned(),
        }
        .into();
        assert!(matches!(err, AgentError::Configuration(_)));
    }
}
