//! Core types for the hvagent node-level hypervisor control agent.
//!
//! Defines the data the agent exchanges with the orchestrator: instance
//! specs, commands and answers, host capability snapshots, and stats samples.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod capability;
pub mod command;
pub mod error;
pub mod id;
pub mod instance;
pub mod samples;
pub mod stats;
pub mod version;

pub use capability::{CapabilitySnapshot, CgroupVersion, FeatureFlags};
pub use command::{Answer, AnswerResult, Command};
pub use error::CoreError;
pub use id::{DomainName, InstanceId};
pub use instance::{
    Arch, BootMode, BootType, DiskKind, DiskSpec, InstanceSpec, InstanceType, NicSpec,
    StoragePoolType, TrafficType, VncCredentials,
};
pub use stats::{VmStatsEntry, VmStatsSample, VmUtilization};
pub use version::Version;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::samples::{sample_instance, sample_router};

    #[test]
    fn samples_are_valid() {
        for spec in [sample_instance(), sample_router()] {
            if let Err(e) = spec.validate() {
                panic!("sample {} invalid: {e}", spec.name);
            }
        }
    }

    #[test]
    fn sample_instance_has_ballooning_headroom() {
        let spec = sample_instance();
        assert_eq!(spec.cpus, 2);
        assert_eq!(spec.min_ram_bytes, 256 * 1024 * 1024);
        assert_eq!(spec.max_ram_bytes, 512 * 1024 * 1024);
        assert_eq!(spec.disks.len(), 3);
    }

    #[test]
    fn sample_router_nics_are_in_device_order() {
        let spec = sample_router();
        let ids: Vec<u32> = spec.nics.iter().map(|n| n.device_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(spec.instance_type, InstanceType::DomainRouter);
    }

    #[test]
    fn instance_spec_survives_json() {
        let spec = sample_instance();
        let json = match serde_json::to_string(&spec) {
            Ok(s) => s,
            Err(e) => panic!("serialization failed: {e}"),
        };
        let back: InstanceSpec = match serde_json::from_str(&json) {
            Ok(s) => s,
            Err(e) => panic!("deserialization failed: {e}"),
        };
        assert_eq!(back, spec);
    }

    #[test]
    fn start_command_carries_spec() {
        let cmd = Command::StartInstance(command::StartInstance { spec: sample_instance() });
        assert_eq!(cmd.tag(), command::tag::START_INSTANCE);
    }

    proptest::proptest! {
        #[test]
        fn proptest_version_encoding_is_order_preserving(
            a in (0u32..20, 0u32..1000, 0u32..1000),
            b in (0u32..20, 0u32..1000, 0u32..1000),
        ) {
            let va = Version::new(a.0, a.1, a.2);
            let vb = Version::new(b.0, b.1, b.2);
            proptest::prop_assert_eq!(va.cmp(&vb), va.encoded().cmp(&vb.encoded()));
            proptest::prop_assert_eq!(Version::from_encoded(va.encoded()), va);
        }
    }
}
