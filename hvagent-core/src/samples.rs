//! Sample instance specs demonstrating the schema.
//!
//! The router and the tenant VM below share a guest network; the tenant VM
//! boots from a qcow2 root disk with one data disk and a config-drive ISO.

use uuid::Uuid;

use crate::id::InstanceId;
use crate::instance::{
    DiskKind, DiskSpec, InstanceSpec, InstanceType, NicSpec, StoragePoolType, TrafficType,
    VncCredentials,
};

/// Pool UUID used by every sample disk.
pub const SAMPLE_POOL_UUID: &str = "7b3a1c52-5c1e-4d7e-9a62-2f0c3e1d8a41";

const MIB: u64 = 1024 * 1024;

/// A 2-vCPU tenant VM with ballooning headroom (256 MiB guaranteed, 512 MiB max).
#[must_use]
pub fn sample_instance() -> InstanceSpec {
    let mut spec = InstanceSpec::new("i-2-17-VM", 2, 1000, 512 * MIB);
    spec.id = InstanceId(Uuid::from_u128(0x4f1c_2a9e_77b0_4e5a_9d3c_1b2a_6e8f_0c17));
    spec.min_ram_bytes = 256 * MIB;
    spec.min_speed_mhz = 500;
    spec.os = "Ubuntu 22.04 LTS (64-bit)".to_owned();
    spec.vnc = VncCredentials { password: "s3cr3tpassw0rd".to_owned() };
    spec.disks = vec![
        DiskSpec {
            device_id: 0,
            kind: DiskKind::Root,
            pool_type: StoragePoolType::NetworkFilesystem,
            pool_uuid: SAMPLE_POOL_UUID.to_owned(),
            path: "3f9e1a7c-root.qcow2".to_owned(),
        },
        DiskSpec {
            device_id: 1,
            kind: DiskKind::Data,
            pool_type: StoragePoolType::NetworkFilesystem,
            pool_uuid: SAMPLE_POOL_UUID.to_owned(),
            path: "8c2d4b10-data.qcow2".to_owned(),
        },
        DiskSpec {
            device_id: 3,
            kind: DiskKind::Iso,
            pool_type: StoragePoolType::NetworkFilesystem,
            pool_uuid: SAMPLE_POOL_UUID.to_owned(),
            path: "configdrive.iso".to_owned(),
        },
    ];
    spec.nics = vec![NicSpec {
        device_id: 0,
        mac: "02:00:4c:5e:00:11".to_owned(),
        traffic_type: TrafficType::Guest,
        broadcast_uri: Some("vlan://100".to_owned()),
        mtu: None,
    }];
    spec
}

/// A single-vCPU virtual router with guest, control and public NICs.
#[must_use]
pub fn sample_router() -> InstanceSpec {
    let mut spec = InstanceSpec::new("r-4-VM", 1, 500, 256 * MIB);
    spec.instance_type = InstanceType::DomainRouter;
    spec.os = "Debian GNU/Linux 12 (64-bit)".to_owned();
    spec.disks = vec![DiskSpec {
        device_id: 0,
        kind: DiskKind::Root,
        pool_type: StoragePoolType::Filesystem,
        pool_uuid: SAMPLE_POOL_UUID.to_owned(),
        path: "systemvm-root.qcow2".to_owned(),
    }];
    spec.nics = [TrafficType::Guest, TrafficType::Control, TrafficType::Public]
        .into_iter()
        .zip(0u32..)
        .map(|(traffic_type, device_id)| NicSpec {
            device_id,
            mac: format!("0e:00:a9:fe:00:{device_id:02x}"),
            traffic_type,
            broadcast_uri: None,
            mtu: None,
        })
        .collect();
    spec
}
