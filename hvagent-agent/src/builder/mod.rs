//! Domain descriptor builder.
//!
//! [`DomainBuilder::build`] translates an [`InstanceSpec`] and the host's
//! [`CapabilitySnapshot`] into a [`DomainDescriptor`]. Building never touches
//! the host: storage and network collaborators are only asked to describe
//! what already exists. Identical inputs yield identical descriptors.

pub mod disk;

use hvagent_core::instance::detail;
use hvagent_core::{Arch, BootMode, BootType, CapabilitySnapshot, InstanceSpec};

use crate::accounting::{self, BALLOON_STATS_PERIOD_SECS};
use crate::config::DomainDefaults;
use crate::descriptor::{
    ClockOffset, Controller, DiskBus, DomainDescriptor, Devices, Features, Firmware, Graphics,
    GuestSection, Header, MachineType, MemBalloon, NumaCell, ResourceSection, Rng, Smbios,
    TpmVersion,
};
use crate::error::AgentError;
use crate::guest_os::GuestOsFamily;
use crate::storage::StoragePoolResolver;
use crate::vif::VifRegistry;

/// Characters of the VNC password honoured by the protocol.
pub const VNC_PASSWORD_MAX: usize = 8;

/// Builds domain descriptors against a fixed set of host collaborators.
#[derive(Clone, Copy)]
pub struct DomainBuilder<'a> {
    defaults: &'a DomainDefaults,
    storage: &'a dyn StoragePoolResolver,
    vifs: &'a VifRegistry,
}

impl<'a> DomainBuilder<'a> {
    #[must_use]
    pub fn new(
        defaults: &'a DomainDefaults,
        storage: &'a dyn StoragePoolResolver,
        vifs: &'a VifRegistry,
    ) -> Self {
        Self { defaults, storage, vifs }
    }

    /// Build the descriptor for `spec` on a host with `caps`.
    ///
    /// # Errors
    /// - [`AgentError::Configuration`] for an invalid spec or boot/TPM detail,
    ///   reported before any device is resolved.
    /// - [`AgentError::StorageResolution`] if a disk cannot be resolved.
    /// - [`AgentError::Vif`] if a NIC has no driver or fails to plug.
    pub fn build(
        &self,
        spec: &InstanceSpec,
        caps: &CapabilitySnapshot,
    ) -> Result<DomainDescriptor, AgentError> {
        spec.validate()?;
        let firmware = self.firmware(spec)?;
        let tpm = tpm_version(spec)?;
        let machine = machine_type(spec.arch, &firmware);

        let memory = accounting::memory_plan(spec, self.defaults.memory_ballooning);
        let cpu_tune = accounting::cpu_tune(spec, caps);
        let max_vcpus = spec.effective_max_cpus();

        let disks = spec
            .disks
            .iter()
            .map(|d| disk::build_disk(self.storage, spec, machine, caps, d))
            .collect::<Result<Vec<_>, _>>()?;

        let interfaces = spec
            .nics
            .iter()
            .map(|nic| self.vifs.plug(nic, &spec.os, &spec.extra_config))
            .collect::<Result<Vec<_>, _>>()?;

        let mut controllers = vec![Controller::UsbXhci];
        if disks.iter().any(|d| d.bus == DiskBus::Scsi) {
            controllers.push(Controller::VirtioScsi);
        }

        let family = GuestOsFamily::classify(&spec.os);
        let secure = matches!(firmware, Firmware::Uefi { secure: true, .. });
        let x86 = spec.arch == Arch::X86_64;

        tracing::debug!(
            domain = %spec.name,
            machine = machine.as_str(),
            disks = disks.len(),
            nics = interfaces.len(),
            balloon = memory.balloon,
            "domain descriptor built"
        );

        Ok(DomainDescriptor {
            header: Header {
                name: spec.name.to_string(),
                uuid: spec.id.as_uuid(),
                description: spec.os.clone(),
                hypervisor: "kvm",
            },
            guest: GuestSection {
                arch: spec.arch,
                machine,
                firmware,
                smbios: Smbios {
                    manufacturer: self.defaults.smbios_manufacturer.clone(),
                    product: self.defaults.smbios_product.clone(),
                    uuid: spec.id.as_uuid(),
                },
            },
            resources: ResourceSection {
                current_vcpus: spec.cpus,
                max_vcpus,
                max_memory_kib: memory.max_kib,
                current_memory_kib: memory.current_kib,
                numa: NumaCell {
                    id: 0,
                    first_cpu: 0,
                    last_cpu: max_vcpus - 1,
                    memory_kib: spec.min_ram_bytes / 1024,
                },
            },
            cpu_tune,
            clock: if family == GuestOsFamily::Windows {
                ClockOffset::Localtime
            } else {
                ClockOffset::Utc
            },
            features: Features { acpi: true, apic: x86, pae: x86, smm: secure },
            devices: Devices {
                emulator: self.defaults.emulator_path.clone(),
                disks,
                interfaces,
                controllers,
                guest_agent_socket: self
                    .defaults
                    .channel_dir
                    .join(format!("{}.org.qemu.guest_agent.0", spec.name)),
                graphics: Graphics {
                    listen: self.defaults.vnc_listen.clone(),
                    password: spec.vnc.password.chars().take(VNC_PASSWORD_MAX).collect(),
                    autoport: true,
                },
                rng: Rng {
                    source: self.defaults.rng_source.clone(),
                    rate_bytes: self.defaults.rng_rate_bytes,
                    rate_period_ms: self.defaults.rng_rate_period_ms,
                },
                tpm,
                memballoon: memory
                    .balloon
                    .then_some(MemBalloon { stats_period_secs: BALLOON_STATS_PERIOD_SECS }),
            },
        })
    }

    fn firmware(&self, spec: &InstanceSpec) -> Result<Firmware, AgentError> {
        let mode = spec.detail(detail::UEFI_MODE);
        match spec.boot_type {
            BootType::Bios => {
                if spec.arch == Arch::Aarch64 {
                    return Err(AgentError::Configuration(format!(
                        "{} guests must boot with UEFI",
                        spec.arch
                    )));
                }
                if let Some(mode) = mode {
                    return Err(AgentError::Configuration(format!(
                        "UEFI mode '{mode}' requested for a BIOS-booted instance"
                    )));
                }
                Ok(Firmware::Bios)
            }
            BootType::Uefi => {
                let mode = mode.map(str::parse::<BootMode>).transpose()?.unwrap_or(BootMode::Legacy);
                let loader = match mode {
                    BootMode::Legacy => &self.defaults.uefi_loader_legacy,
                    BootMode::Secure => &self.defaults.uefi_loader_secure,
                };
                let loader = loader.clone().ok_or_else(|| {
                    AgentError::Configuration(format!("no UEFI loader configured for {mode:?} boot"))
                })?;
                Ok(Firmware::Uefi {
                    secure: mode == BootMode::Secure,
                    loader,
                    nvram: self.defaults.nvram_dir.join(format!("{}.fd", spec.id)),
                })
            }
        }
    }
}

impl std::fmt::Debug for DomainBuilder<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainBuilder")
            .field("defaults", self.defaults)
            .field("vifs", self.vifs)
            .finish_non_exhaustive()
    }
}

/// Board for an architecture and firmware.
#[must_use]
pub fn machine_type(arch: Arch, firmware: &Firmware) -> MachineType {
    match (arch, firmware) {
        (Arch::Aarch64, _) => MachineType::Virt,
        (Arch::X86_64, Firmware::Bios) => MachineType::Pc,
        (Arch::X86_64, Firmware::Uefi { .. }) => MachineType::Q35,
    }
}

fn tpm_version(spec: &InstanceSpec) -> Result<Option<TpmVersion>, AgentError> {
    spec.detail(detail::TPM_VERSION)
        .map(|raw| raw.parse::<TpmVersion>().map_err(AgentError::Configuration))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use crate::storage::DirectoryPoolResolver;
    use hvagent_core::CgroupVersion;

    fn build(spec: &InstanceSpec, defaults: &DomainDefaults) -> Result<DomainDescriptor, AgentError> {
        let storage = DirectoryPoolResolver::default();
        let vifs = VifRegistry::new();
        let caps = CapabilitySnapshot::new(None, None, CgroupVersion::V1, 4);
        DomainBuilder::new(defaults, &storage, &vifs).build(spec, &caps)
    }

    #[test]
    fn bare_bios_instance_builds_on_pc() {
        let spec = InstanceSpec::new("i-1", 2, 1000, 1 << 30);
        let d = match build(&spec, &DomainDefaults::default()) {
            Ok(d) => d,
            Err(e) => panic!("unexpected error: {e}"),
        };
        assert_eq!(d.guest.machine, MachineType::Pc);
        assert_eq!(d.guest.firmware, Firmware::Bios);
        assert_eq!(d.resources.numa.cpu_range(), "0-1");
        assert_eq!(d.devices.controllers, vec![Controller::UsbXhci]);
        assert_eq!(
            d.devices.guest_agent_socket,
            PathBuf::from("/var/lib/libvirt/qemu/i-1.org.qemu.guest_agent.0")
        );
    }

    #[test]
    fn secure_uefi_uses_q35_secure_loader_and_smm() {
        let mut spec = InstanceSpec::new("i-1", 1, 1000, 1 << 30);
        spec.boot_type = BootType::Uefi;
        spec.details.insert(detail::UEFI_MODE.to_owned(), "secure".to_owned());
        let d = match build(&spec, &DomainDefaults::default()) {
            Ok(d) => d,
            Err(e) => panic!("unexpected error: {e}"),
        };
        assert_eq!(d.guest.machine, MachineType::Q35);
        assert!(d.features.smm);
        match d.guest.firmware {
            Firmware::Uefi { secure, loader, .. } => {
                assert!(secure);
                assert_eq!(loader, PathBuf::from("/usr/share/OVMF/OVMF_CODE.secboot.fd"));
            }
            Firmware::Bios => panic!("expected UEFI firmware"),
        }
    }

    #[test]
    fn uefi_mode_on_bios_is_a_configuration_error() {
        let mut spec = InstanceSpec::new("i-1", 1, 1000, 1 << 30);
        spec.details.insert(detail::UEFI_MODE.to_owned(), "legacy".to_owned());
        assert!(matches!(
            build(&spec, &DomainDefaults::default()),
            Err(AgentError::Configuration(_))
        ));
    }

    #[test]
    fn uefi_without_loader_is_a_configuration_error() {
        let mut spec = InstanceSpec::new("i-1", 1, 1000, 1 << 30);
        spec.boot_type = BootType::Uefi;
        let defaults = DomainDefaults { uefi_loader_legacy: None, ..DomainDefaults::default() };
        assert!(matches!(build(&spec, &defaults), Err(AgentError::Configuration(_))));
    }

    #[test]
    fn aarch64_requires_uefi_and_uses_virt() {
        let mut spec = InstanceSpec::new("i-1", 1, 1000, 1 << 30);
        spec.arch = Arch::Aarch64;
        assert!(matches!(
            build(&spec, &DomainDefaults::default()),
            Err(AgentError::Configuration(_))
        ));

        spec.boot_type = BootType::Uefi;
        let d = match build(&spec, &DomainDefaults::default()) {
            Ok(d) => d,
            Err(e) => panic!("unexpected error: {e}"),
        };
        assert_eq!(d.guest.machine, MachineType::Virt);
        assert!(!d.features.apic);
    }

    #[test]
    fn tpm_detail_is_validated() {
        let mut spec = InstanceSpec::new("i-1", 1, 1000, 1 << 30);
        spec.details.insert(detail::TPM_VERSION.to_owned(), "2.0".to_owned());
        let d = match build(&spec, &DomainDefaults::default()) {
            Ok(d) => d,
            Err(e) => panic!("unexpected error: {e}"),
        };
        assert_eq!(d.devices.tpm, Some(TpmVersion::V2_0));

        spec.details.insert(detail::TPM_VERSION.to_owned(), "3.0".to_owned());
        assert!(matches!(
            build(&spec, &DomainDefaults::default()),
            Err(AgentError::Configuration(_))
        ));
    }

    #[test]
    fn windows_guest_keeps_local_clock() {
        let mut spec = InstanceSpec::new("i-1", 1, 1000, 1 << 30);
        spec.os = "Windows Server 2019 (64-bit)".to_owned();
        let d = match build(&spec, &DomainDefaults::default()) {
            Ok(d) => d,
            Err(e) => panic!("unexpected error: {e}"),
        };
        assert_eq!(d.clock, ClockOffset::Localtime);
    }

    #[test]
    fn vnc_password_is_truncated() {
        let mut spec = InstanceSpec::new("i-1", 1, 1000, 1 << 30);
        spec.vnc.password = "0123456789abcdef".to_owned();
        let d = match build(&spec, &DomainDefaults::default()) {
            Ok(d) => d,
            Err(e) => panic!("unexpected error: {e}"),
        };
        assert_eq!(d.devices.graphics.password, "01234567");
    }
}
