//! Disk bus, label, discard and I/O selection.

use hvagent_core::instance::detail;
use hvagent_core::{Arch, CapabilitySnapshot, DiskKind, DiskSpec, InstanceSpec, StoragePoolType};

use crate::descriptor::{
    DiscardPolicy, DiskBus, DiskDescriptor, DiskDevice, DiskType, IoDriver, MachineType,
    NetworkHost, NetworkProtocol,
};
use crate::error::AgentError;
use crate::guest_os::{self, GuestOsFamily};
use crate::storage::{DiskFormat, PoolHandle, StoragePoolResolver};

/// Resolve and describe one declared disk.
///
/// # Errors
/// Returns [`AgentError::StorageResolution`] if the pool or volume cannot be
/// resolved and [`AgentError::Configuration`] for an invalid bus override or
/// device position.
pub fn build_disk(
    storage: &dyn StoragePoolResolver,
    spec: &InstanceSpec,
    machine: MachineType,
    caps: &CapabilitySnapshot,
    disk: &DiskSpec,
) -> Result<DiskDescriptor, AgentError> {
    let bus = select_bus(spec, machine, disk)?;
    let label = device_label(bus, disk.device_id)?;

    let pool = storage.resolve_pool(disk.pool_type, &disk.pool_uuid)?;
    let handle = storage.physical_disk(&pool, &disk.path)?;

    let disk_type = disk_type(pool.pool_type);
    let hosts = match disk_type {
        DiskType::Network(_) => network_hosts(&pool),
        DiskType::File | DiskType::Block => Vec::new(),
    };
    let (device, read_only, format) = match disk.kind {
        DiskKind::Iso => (DiskDevice::Cdrom, true, DiskFormat::Iso),
        DiskKind::Root | DiskKind::Data => (DiskDevice::Disk, false, handle.format),
    };

    Ok(DiskDescriptor {
        device,
        disk_type,
        source: handle.path,
        hosts,
        format,
        bus,
        label,
        discard: discard_policy(bus, caps),
        io: io_driver(caps),
        read_only,
    })
}

/// The bus for `disk`: an explicit controller detail if present, otherwise
/// the default for the guest.
///
/// # Errors
/// Returns [`AgentError::Configuration`] if the override names an unknown bus.
pub fn select_bus(
    spec: &InstanceSpec,
    machine: MachineType,
    disk: &DiskSpec,
) -> Result<DiskBus, AgentError> {
    let key = match disk.kind {
        DiskKind::Root => Some(detail::ROOT_DISK_CONTROLLER),
        DiskKind::Data => Some(detail::DATA_DISK_CONTROLLER),
        DiskKind::Iso => None,
    };

    let Some(raw) = key.and_then(|k| spec.detail(k)) else {
        return Ok(default_bus(spec, machine, disk.kind));
    };

    let bus: DiskBus = raw.parse().map_err(AgentError::Configuration)?;
    if bus == DiskBus::Ide && !machine.has_ide() {
        tracing::debug!(
            domain = %spec.name,
            machine = machine.as_str(),
            "board has no IDE controller; attaching disk to SATA"
        );
        return Ok(DiskBus::Sata);
    }
    Ok(bus)
}

/// Default bus for a disk of `kind` in this guest.
#[must_use]
pub fn default_bus(spec: &InstanceSpec, machine: MachineType, kind: DiskKind) -> DiskBus {
    let legacy = if machine.has_ide() { DiskBus::Ide } else { DiskBus::Sata };

    if kind == DiskKind::Iso {
        return if spec.arch == Arch::Aarch64 { DiskBus::Scsi } else { legacy };
    }
    if spec.arch == Arch::Aarch64 || guest_os::wants_virtio_scsi(&spec.os) {
        return DiskBus::Scsi;
    }

    match GuestOsFamily::classify(&spec.os) {
        family if family.has_virtio_drivers() => DiskBus::Virtio,
        GuestOsFamily::Windows if machine == MachineType::Q35 => DiskBus::Sata,
        _ => legacy,
    }
}

/// Discard passthrough is unsafe on emulated IDE before the emulator fix.
#[must_use]
pub fn discard_policy(bus: DiskBus, caps: &CapabilitySnapshot) -> DiscardPolicy {
    if bus == DiskBus::Ide && !caps.features.ide_discard {
        DiscardPolicy::Ignore
    } else {
        DiscardPolicy::Unmap
    }
}

#[must_use]
pub fn io_driver(caps: &CapabilitySnapshot) -> IoDriver {
    if caps.features.io_uring {
        IoDriver::IoUring
    } else {
        IoDriver::Default
    }
}

/// Target device name, e.g. `vda` for the first virtio disk.
///
/// # Errors
/// Returns [`AgentError::Configuration`] if `device_id` is beyond `z`.
pub fn device_label(bus: DiskBus, device_id: u32) -> Result<String, AgentError> {
    let letter = u8::try_from(device_id)
        .ok()
        .filter(|id| *id < 26)
        .map(|id| char::from(b'a' + id))
        .ok_or_else(|| {
            AgentError::Configuration(format!("disk device id {device_id} is out of range"))
        })?;
    Ok(format!("{}{letter}", bus.label_prefix()))
}

/// How the hypervisor reaches volumes of a pool type.
#[must_use]
pub fn disk_type(pool_type: StoragePoolType) -> DiskType {
    match pool_type {
        StoragePoolType::Rbd => DiskType::Network(NetworkProtocol::Rbd),
        StoragePoolType::Gluster => DiskType::Network(NetworkProtocol::Gluster),
        StoragePoolType::Lvm | StoragePoolType::Iscsi => DiskType::Block,
        StoragePoolType::Filesystem
        | StoragePoolType::NetworkFilesystem
        | StoragePoolType::SharedMountPoint => DiskType::File,
    }
}

fn network_hosts(pool: &PoolHandle) -> Vec<NetworkHost> {
    pool.source_host
        .iter()
        .map(|name| NetworkHost { name: name.clone(), port: pool.source_port })
        .collect()
}
