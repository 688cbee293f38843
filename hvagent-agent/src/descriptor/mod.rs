//! Guest domain descriptor.
//!
//! A plain struct tree describing everything libvirt needs to define a
//! domain. The tree carries no encoding logic; [`xml`] renders it.

pub mod xml;

use std::path::PathBuf;

use hvagent_core::Arch;
use uuid::Uuid;

use crate::storage::DiskFormat;

/// A complete domain definition, built fresh for every start request.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainDescriptor {
    pub header: Header,
    pub guest: GuestSection,
    pub resources: ResourceSection,
    pub cpu_tune: CpuTune,
    pub clock: ClockOffset,
    pub features: Features,
    pub devices: Devices,
}

impl DomainDescriptor {
    /// Render as libvirt domain XML.
    #[must_use]
    pub fn to_xml(&self) -> String {
        xml::render(self)
    }
}

/// Identity of the domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub uuid: Uuid,
    /// Guest OS description, kept for operators.
    pub description: String,
    /// Hypervisor domain type, e.g. `kvm`.
    pub hypervisor: &'static str,
}

/// Board, firmware and SMBIOS identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestSection {
    pub arch: Arch,
    pub machine: MachineType,
    pub firmware: Firmware,
    pub smbios: Smbios,
}

/// Emulated board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MachineType {
    /// i440FX with an IDE controller.
    Pc,
    /// Q35 with AHCI (SATA) and no IDE.
    Q35,
    /// Generic ARM board.
    Virt,
}

impl MachineType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pc => "pc",
            Self::Q35 => "q35",
            Self::Virt => "virt",
        }
    }

    /// Whether the board has a legacy IDE controller.
    #[must_use]
    pub fn has_ide(self) -> bool {
        self == Self::Pc
    }
}

/// Firmware the guest boots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Firmware {
    Bios,
    Uefi {
        secure: bool,
        loader: PathBuf,
        nvram: PathBuf,
    },
}

/// SMBIOS system identity presented to the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smbios {
    pub manufacturer: String,
    pub product: String,
    pub uuid: Uuid,
}

/// vCPU and memory sizing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSection {
    /// vCPUs online at boot; never above `max_vcpus`.
    pub current_vcpus: u32,
    pub max_vcpus: u32,
    pub max_memory_kib: u64,
    pub current_memory_kib: u64,
    pub numa: NumaCell,
}

/// The single guest NUMA cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumaCell {
    pub id: u32,
    pub first_cpu: u32,
    pub last_cpu: u32,
    pub memory_kib: u64,
}

impl NumaCell {
    /// The vCPU range in libvirt notation, e.g. `0-3`.
    #[must_use]
    pub fn cpu_range(&self) -> String {
        format!("{}-{}", self.first_cpu, self.last_cpu)
    }
}

/// CPU scheduler tunables. Zero quota and period mean unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CpuTune {
    pub shares: u64,
    pub quota: i64,
    pub period: u64,
}

impl CpuTune {
    /// Whether a hard cap is applied.
    #[must_use]
    pub fn is_limited(&self) -> bool {
        self.quota > 0 && self.period > 0
    }
}

/// Guest clock base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClockOffset {
    Utc,
    Localtime,
}

/// Hypervisor features exposed to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Features {
    pub acpi: bool,
    pub apic: bool,
    pub pae: bool,
    /// System management mode; required by secure boot firmware.
    pub smm: bool,
}

/// Everything under `<devices>`.
#[derive(Debug, Clone, PartialEq)]
pub struct Devices {
    pub emulator: Option<PathBuf>,
    pub disks: Vec<DiskDescriptor>,
    pub interfaces: Vec<InterfaceDescriptor>,
    pub controllers: Vec<Controller>,
    pub guest_agent_socket: PathBuf,
    pub graphics: Graphics,
    pub rng: Rng,
    pub tpm: Option<TpmVersion>,
    /// `None` renders an explicit `model='none'` so libvirt adds no default balloon.
    pub memballoon: Option<MemBalloon>,
}

/// A resolved disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskDescriptor {
    pub device: DiskDevice,
    pub disk_type: DiskType,
    /// Host path, or `pool/volume` name for network disks.
    pub source: PathBuf,
    /// Monitors or servers of a network disk.
    pub hosts: Vec<NetworkHost>,
    pub format: DiskFormat,
    pub bus: DiskBus,
    /// Target device, e.g. `vda`.
    pub label: String,
    pub discard: DiscardPolicy,
    pub io: IoDriver,
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiskDevice {
    Disk,
    Cdrom,
}

impl DiskDevice {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disk => "disk",
            Self::Cdrom => "cdrom",
        }
    }
}

/// How the hypervisor reaches the disk source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiskType {
    File,
    Block,
    Network(NetworkProtocol),
}

impl DiskType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Block => "block",
            Self::Network(_) => "network",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkProtocol {
    Rbd,
    Gluster,
}

impl NetworkProtocol {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rbd => "rbd",
            Self::Gluster => "gluster",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkHost {
    pub name: String,
    pub port: Option<u16>,
}

/// Bus a disk is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiskBus {
    Virtio,
    Scsi,
    Ide,
    Sata,
}

impl DiskBus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Virtio => "virtio",
            Self::Scsi => "scsi",
            Self::Ide => "ide",
            Self::Sata => "sata",
        }
    }

    /// Prefix of target device names on this bus.
    #[must_use]
    pub fn label_prefix(self) -> &'static str {
        match self {
            Self::Virtio => "vd",
            Self::Scsi | Self::Sata => "sd",
            Self::Ide => "hd",
        }
    }
}

impl std::str::FromStr for DiskBus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "virtio" => Ok(Self::Virtio),
            "scsi" | "virtio-scsi" => Ok(Self::Scsi),
            "ide" => Ok(Self::Ide),
            "sata" => Ok(Self::Sata),
            other => Err(format!("unknown disk controller '{other}'")),
        }
    }
}

/// Whether guest discard requests reach the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscardPolicy {
    Ignore,
    Unmap,
}

impl DiscardPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ignore => "ignore",
            Self::Unmap => "unmap",
        }
    }
}

/// Host I/O backend for a disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoDriver {
    /// Left to the hypervisor.
    Default,
    IoUring,
}

/// A plugged network interface, as produced by a VIF driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    /// Host bridge the interface is attached to.
    pub bridge: String,
    pub mac: String,
    pub model: NicModel,
    pub vlan: Option<u16>,
    pub mtu: Option<u32>,
    /// Host-side tap name, left to libvirt when `None`.
    pub target_dev: Option<String>,
}

/// Emulated NIC model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NicModel {
    Virtio,
    E1000,
    Rtl8139,
}

impl NicModel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Virtio => "virtio",
            Self::E1000 => "e1000",
            Self::Rtl8139 => "rtl8139",
        }
    }
}

impl std::str::FromStr for NicModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "virtio" => Ok(Self::Virtio),
            "e1000" => Ok(Self::E1000),
            "rtl8139" => Ok(Self::Rtl8139),
            other => Err(format!("unknown NIC model '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Controller {
    /// USB 3 controller hosting the tablet.
    UsbXhci,
    VirtioScsi,
}

/// VNC console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Graphics {
    pub listen: String,
    /// At most 8 characters.
    pub password: String,
    pub autoport: bool,
}

/// Entropy device backed by a host source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rng {
    pub source: PathBuf,
    pub rate_bytes: u32,
    pub rate_period_ms: u32,
}

/// Emulated TPM version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TpmVersion {
    V1_2,
    V2_0,
}

impl TpmVersion {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::V1_2 => "1.2",
            Self::V2_0 => "2.0",
        }
    }
}

impl std::str::FromStr for TpmVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1.2" => Ok(Self::V1_2),
            "2.0" => Ok(Self::V2_0),
            other => Err(format!("unsupported TPM version '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemBalloon {
    /// Seconds between guest memory statistics updates.
    pub stats_period_secs: u32,
}
