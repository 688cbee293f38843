//! Instance description handed to the agent by the orchestrator.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::id::{DomainName, InstanceId};

/// Well-known keys of [`InstanceSpec::details`].
pub mod detail {
    /// Explicit bus for the root disk (`virtio`, `scsi`, `ide`, `sata`).
    pub const ROOT_DISK_CONTROLLER: &str = "rootDiskController";
    /// Explicit bus for data disks.
    pub const DATA_DISK_CONTROLLER: &str = "dataDiskController";
    /// UEFI boot mode, `LEGACY` or `SECURE`. Only valid with UEFI boot.
    pub const UEFI_MODE: &str = "UEFI";
    /// When `true`, current memory is always the maximum and no balloon is attached.
    pub const NO_MEM_BALLOON: &str = "noMemBalloon";
    /// Virtual TPM version, `1.2` or `2.0`.
    pub const TPM_VERSION: &str = "tpmversion";
}

/// A fully described guest instance.
///
/// Built by the orchestrator and never mutated by the agent. Memory sizes are
/// in bytes, CPU speeds in MHz.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct InstanceSpec {
    /// Orchestrator identity, reused as the domain UUID.
    pub id: InstanceId,
    /// Domain name on this host.
    pub name: DomainName,
    /// Role of the instance in the cloud.
    pub instance_type: InstanceType,
    /// vCPUs online at boot.
    pub cpus: u32,
    /// Hot-plug ceiling for vCPUs, if dynamic scaling is allowed.
    pub max_cpus: Option<u32>,
    /// Guaranteed per-core speed.
    pub min_speed_mhz: u32,
    /// Offered per-core speed.
    pub max_speed_mhz: u32,
    /// Memory guaranteed to the guest.
    pub min_ram_bytes: u64,
    /// Memory visible to the guest.
    pub max_ram_bytes: u64,
    /// Firmware type.
    pub boot_type: BootType,
    /// Guest OS / platform emulator description (e.g. `"Ubuntu 22.04 (64-bit)"`).
    pub os: String,
    /// Guest architecture.
    pub arch: Arch,
    /// Console credentials.
    pub vnc: VncCredentials,
    /// Whether a hard CPU cap (quota/period) is applied.
    pub limit_cpu_use: bool,
    /// Fraction of the period the guest may run, in `(0, 1]`.
    pub cpu_quota_percentage: Option<f64>,
    /// Whether shares are computed from the guaranteed rather than the offered speed.
    pub enable_dynamic_scaling: bool,
    /// Disks in device order.
    pub disks: Vec<DiskSpec>,
    /// NICs in device order.
    pub nics: Vec<NicSpec>,
    /// Free-form key/value details (see [`detail`]).
    pub details: BTreeMap<String, String>,
    /// Extra configuration forwarded to VIF drivers.
    pub extra_config: BTreeMap<String, String>,
}

impl InstanceSpec {
    /// Create a BIOS-booted x86_64 instance with fixed speed and memory and no devices.
    #[must_use]
    pub fn new(name: impl Into<DomainName>, cpus: u32, speed_mhz: u32, ram_bytes: u64) -> Self {
        Self {
            id: InstanceId::new(),
            name: name.into(),
            instance_type: InstanceType::User,
            cpus,
            max_cpus: None,
            min_speed_mhz: speed_mhz,
            max_speed_mhz: speed_mhz,
            min_ram_bytes: ram_bytes,
            max_ram_bytes: ram_bytes,
            boot_type: BootType::Bios,
            os: "Other Linux (64-bit)".to_owned(),
            arch: Arch::X86_64,
            vnc: VncCredentials::default(),
            limit_cpu_use: false,
            cpu_quota_percentage: None,
            enable_dynamic_scaling: false,
            disks: Vec::new(),
            nics: Vec::new(),
            details: BTreeMap::new(),
            extra_config: BTreeMap::new(),
        }
    }

    /// Looks up a free-form detail.
    #[must_use]
    pub fn detail(&self, key: &str) -> Option<&str> {
        self.details.get(key).map(String::as_str)
    }

    /// Returns `true` if the detail is present and equals `true` (case-insensitive).
    #[must_use]
    pub fn detail_flag(&self, key: &str) -> bool {
        self.detail(key).is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    /// The vCPU ceiling: the declared maximum, never below the boot count.
    #[must_use]
    pub fn effective_max_cpus(&self) -> u32 {
        self.max_cpus.unwrap_or(self.cpus).max(self.cpus)
    }

    /// Checks the structural invariants the builder relies on.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidInstance`] naming the first offending field.
    pub fn validate(&self) -> Result<(), CoreError> {
        let invalid = |field: &str, reason: String| CoreError::InvalidInstance {
            field: field.to_owned(),
            reason,
        };

        if self.name.as_str().is_empty() {
            return Err(invalid("name", "must not be empty".to_owned()));
        }
        if self.cpus == 0 {
            return Err(invalid("cpus", "must be at least 1".to_owned()));
        }
        if self.max_ram_bytes == 0 {
            return Err(invalid("max_ram_bytes", "must be positive".to_owned()));
        }
        if self.min_ram_bytes > self.max_ram_bytes {
            return Err(invalid(
                "min_ram_bytes",
                format!("{} exceeds max_ram_bytes {}", self.min_ram_bytes, self.max_ram_bytes),
            ));
        }
        if self.limit_cpu_use {
            match self.cpu_quota_percentage {
                Some(pct) if pct > 0.0 && pct <= 1.0 => {}
                Some(pct) => {
                    return Err(invalid("cpu_quota_percentage", format!("{pct} is outside (0, 1]")));
                }
                None => {
                    return Err(invalid(
                        "cpu_quota_percentage",
                        "required when limit_cpu_use is set".to_owned(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Role of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum InstanceType {
    /// Tenant workload.
    User,
    /// Virtual router appliance.
    DomainRouter,
    /// Console proxy appliance.
    ConsoleProxy,
    /// Secondary storage appliance.
    SecondaryStorageVm,
}

/// Guest CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Arch {
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "aarch64")]
    Aarch64,
}

impl Arch {
    /// The libvirt architecture string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Aarch64 => "aarch64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Firmware the guest boots with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootType {
    Bios,
    Uefi,
}

/// UEFI boot mode, read from the [`detail::UEFI_MODE`] detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootMode {
    Legacy,
    Secure,
}

impl FromStr for BootMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LEGACY" => Ok(Self::Legacy),
            "SECURE" => Ok(Self::Secure),
            _ => Err(CoreError::UnknownVariant { kind: "boot mode", value: s.to_owned() }),
        }
    }
}

/// VNC console credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VncCredentials {
    /// Console password; only the first 8 characters are honoured by VNC.
    pub password: String,
}

/// Role of a disk in the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskKind {
    Root,
    Data,
    /// Read-only installation or config-drive media.
    Iso,
}

/// Kind of storage pool backing a disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoragePoolType {
    /// Local directory.
    Filesystem,
    /// NFS mount managed by the agent host.
    NetworkFilesystem,
    /// Shared mount point managed outside the agent.
    SharedMountPoint,
    /// LVM volume group.
    Lvm,
    /// iSCSI LUN.
    Iscsi,
    /// Ceph RBD.
    Rbd,
    /// Gluster volume.
    Gluster,
}

/// A disk attached to an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpec {
    /// Position on its bus; determines the device label.
    pub device_id: u32,
    /// Role of the disk.
    pub kind: DiskKind,
    /// Storage pool type the volume lives in.
    pub pool_type: StoragePoolType,
    /// Storage pool identity.
    pub pool_uuid: String,
    /// Volume path relative to the pool.
    pub path: String,
}

/// Traffic a NIC carries; selects the VIF driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum TrafficType {
    Guest,
    Public,
    Management,
    Control,
    Storage,
}

impl fmt::Display for TrafficType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Guest => "guest",
            Self::Public => "public",
            Self::Management => "management",
            Self::Control => "control",
            Self::Storage => "storage",
        };
        f.write_str(s)
    }
}

/// A network interface attached to an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicSpec {
    /// Position in the guest's PCI order.
    pub device_id: u32,
    /// MAC address, `aa:bb:cc:dd:ee:ff`.
    pub mac: String,
    /// Traffic carried by this NIC.
    pub traffic_type: TrafficType,
    /// Isolation URI, e.g. `vlan://100`.
    pub broadcast_uri: Option<String>,
    /// MTU override.
    pub mtu: Option<u32>,
}

impl NicSpec {
    /// VLAN id parsed from a `vlan://N` broadcast URI.
    #[must_use]
    pub fn vlan(&self) -> Option<u16> {
        self.broadcast_uri
            .as_deref()?
            .strip_prefix("vlan://")?
            .parse()
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_max_cpus_never_below_boot_count() {
        let mut spec = InstanceSpec::new("i-1", 4, 1000, 1 << 30);
        assert_eq!(spec.effective_max_cpus(), 4);
        spec.max_cpus = Some(2);
        assert_eq!(spec.effective_max_cpus(), 4);
        spec.max_cpus = Some(8);
        assert_eq!(spec.effective_max_cpus(), 8);
    }

    #[test]
    fn validate_rejects_min_ram_above_max() {
        let mut spec = InstanceSpec::new("i-1", 1, 1000, 1 << 30);
        spec.min_ram_bytes = 2 << 30;
        assert!(matches!(
            spec.validate(),
            Err(CoreError::InvalidInstance { field, .. }) if field == "min_ram_bytes"
        ));
    }

    #[test]
    fn validate_requires_quota_when_limiting() {
        let mut spec = InstanceSpec::new("i-1", 1, 1000, 1 << 30);
        spec.limit_cpu_use = true;
        assert!(spec.validate().is_err());
        spec.cpu_quota_percentage = Some(1.5);
        assert!(spec.validate().is_err());
        spec.cpu_quota_percentage = Some(0.5);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn boot_mode_parses_case_insensitively() {
        assert_eq!("secure".parse::<BootMode>().ok(), Some(BootMode::Secure));
        assert_eq!("LEGACY".parse::<BootMode>().ok(), Some(BootMode::Legacy));
        assert!("fast".parse::<BootMode>().is_err());
    }

    #[test]
    fn nic_vlan_parses_broadcast_uri() {
        let nic = NicSpec {
            device_id: 0,
            mac: "02:00:00:00:00:01".to_owned(),
            traffic_type: TrafficType::Guest,
            broadcast_uri: Some("vlan://100".to_owned()),
            mtu: None,
        };
        assert_eq!(nic.vlan(), Some(100));

        let untagged = NicSpec { broadcast_uri: Some("vlan://untagged".to_owned()), ..nic };
        assert_eq!(untagged.vlan(), None);
    }

    #[test]
    fn detail_flag_is_case_insensitive() {
        let mut spec = InstanceSpec::new("i-1", 1, 1000, 1 << 30);
        spec.details.insert(detail::NO_MEM_BALLOON.to_owned(), "TRUE".to_owned());
        assert!(spec.detail_flag(detail::NO_MEM_BALLOON));
        assert!(!spec.detail_flag(detail::UEFI_MODE));
    }
}
