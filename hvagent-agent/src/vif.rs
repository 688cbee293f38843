//! Virtual interface drivers.
//!
//! A [`VifDriver`] turns a [`NicSpec`] into an [`InterfaceDescriptor`]. The
//! builder picks the driver registered for the NIC's traffic type in a
//! [`VifRegistry`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use hvagent_core::{NicSpec, TrafficType};

use crate::config::BridgeConfig;
use crate::descriptor::{InterfaceDescriptor, NicModel};
use crate::error::VifError;
use crate::guest_os::GuestOsFamily;

/// Extra-config key overriding the emulated NIC model.
pub const NIC_ADAPTER_KEY: &str = "nicAdapter";

/// Produces interface descriptors for one class of traffic.
pub trait VifDriver: Send + Sync {
    /// Describe how `nic` attaches to the host network.
    ///
    /// `platform_emulator` is the guest OS string; `extra` is the instance's
    /// extra configuration.
    ///
    /// # Errors
    /// Returns [`VifError::PlugFailed`] if the NIC cannot be attached.
    fn plug(
        &self,
        nic: &NicSpec,
        platform_emulator: &str,
        extra: &BTreeMap<String, String>,
    ) -> Result<InterfaceDescriptor, VifError>;
}

/// Drivers keyed by traffic type.
#[derive(Clone, Default)]
pub struct VifRegistry {
    drivers: HashMap<TrafficType, Arc<dyn VifDriver>>,
}

impl VifRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with one [`BridgeVifDriver`] per configured traffic type.
    #[must_use]
    pub fn with_bridges(bridges: &BridgeConfig) -> Self {
        let mut registry = Self::new();
        for traffic_type in [
            TrafficType::Guest,
            TrafficType::Public,
            TrafficType::Management,
            TrafficType::Control,
            TrafficType::Storage,
        ] {
            registry.register(
                traffic_type,
                Arc::new(BridgeVifDriver::new(bridges.bridge_for(traffic_type))),
            );
        }
        registry
    }

    /// Register or replace the driver for `traffic_type`.
    pub fn register(&mut self, traffic_type: TrafficType, driver: Arc<dyn VifDriver>) {
        self.drivers.insert(traffic_type, driver);
    }

    /// Plug `nic` with the driver for its traffic type.
    ///
    /// # Errors
    /// Returns [`VifError::NoDriver`] if no driver is registered, or the
    /// driver's own error.
    pub fn plug(
        &self,
        nic: &NicSpec,
        platform_emulator: &str,
        extra: &BTreeMap<String, String>,
    ) -> Result<InterfaceDescriptor, VifError> {
        let driver = self
            .drivers
            .get(&nic.traffic_type)
            .ok_or(VifError::NoDriver(nic.traffic_type))?;
        driver.plug(nic, platform_emulator, extra)
    }
}

impl std::fmt::Debug for VifRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.drivers.keys().collect();
        types.sort();
        f.debug_struct("VifRegistry").field("traffic_types", &types).finish()
    }
}

/// Attaches NICs to a Linux bridge, tagging the VLAN from the broadcast URI.
#[derive(Debug, Clone)]
pub struct BridgeVifDriver {
    bridge: String,
}

impl BridgeVifDriver {
    #[must_use]
    pub fn new(bridge: impl Into<String>) -> Self {
        Self { bridge: bridge.into() }
    }
}

impl VifDriver for BridgeVifDriver {
    fn plug(
        &self,
        nic: &NicSpec,
        platform_emulator: &str,
        extra: &BTreeMap<String, String>,
    ) -> Result<InterfaceDescriptor, VifError> {
        if !is_valid_mac(&nic.mac) {
            return Err(VifError::PlugFailed {
                mac: nic.mac.clone(),
                reason: "malformed MAC address".to_owned(),
            });
        }

        if let Some(uri) = nic.broadcast_uri.as_deref() {
            if uri.starts_with("vlan://") && nic.vlan().is_none() && uri != "vlan://untagged" {
                return Err(VifError::PlugFailed {
                    mac: nic.mac.clone(),
                    reason: format!("invalid VLAN in broadcast URI '{uri}'"),
                });
            }
        }

        let model = match extra.get(NIC_ADAPTER_KEY) {
            Some(raw) => raw
                .parse::<NicModel>()
                .map_err(|reason| VifError::PlugFailed { mac: nic.mac.clone(), reason })?,
            None if GuestOsFamily::classify(platform_emulator).has_virtio_drivers() => {
                NicModel::Virtio
            }
            None => NicModel::E1000,
        };

        Ok(InterfaceDescriptor {
            bridge: self.bridge.clone(),
            mac: nic.mac.to_ascii_lowercase(),
            model,
            vlan: nic.vlan(),
            mtu: nic.mtu,
            target_dev: None,
        })
    }
}

fn is_valid_mac(mac: &str) -> bool {
    let octets: Vec<&str> = mac.split(':').collect();
    octets.len() == 6
        && octets.iter().all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guest_nic() -> NicSpec {
        NicSpec {
            device_id: 0,
            mac: "02:00:4C:5E:00:11".to_owned(),
            traffic_type: TrafficType::Guest,
            broadcast_uri: Some("vlan://100".to_owned()),
            mtu: Some(1450),
        }
    }

    #[test]
    fn bridge_driver_tags_vlan_and_picks_virtio_for_linux() {
        let driver = BridgeVifDriver::new("cloudbr1");
        let iface = match driver.plug(&guest_nic(), "Ubuntu 22.04", &BTreeMap::new()) {
            Ok(i) => i,
            Err(e) => panic!("unexpected error: {e}"),
        };
        assert_eq!(iface.bridge, "cloudbr1");
        assert_eq!(iface.mac, "02:00:4c:5e:00:11");
        assert_eq!(iface.vlan, Some(100));
        assert_eq!(iface.mtu, Some(1450));
        assert_eq!(iface.model, NicModel::Virtio);
    }

    #[test]
    fn windows_guest_gets_e1000_unless_overridden() {
        let driver = BridgeVifDriver::new("cloudbr1");
        let plain = driver.plug(&guest_nic(), "Windows Server 2022", &BTreeMap::new());
        assert!(matches!(plain, Ok(ref i) if i.model == NicModel::E1000));

        let mut extra = BTreeMap::new();
        extra.insert(NIC_ADAPTER_KEY.to_owned(), "virtio".to_owned());
        let overridden = driver.plug(&guest_nic(), "Windows Server 2022", &extra);
        assert!(matches!(overridden, Ok(ref i) if i.model == NicModel::Virtio));
    }

    #[test]
    fn bad_mac_and_bad_vlan_fail() {
        let driver = BridgeVifDriver::new("cloudbr1");
        let bad_mac = NicSpec { mac: "not-a-mac".to_owned(), ..guest_nic() };
        assert!(driver.plug(&bad_mac, "Ubuntu", &BTreeMap::new()).is_err());

        let bad_vlan = NicSpec { broadcast_uri: Some("vlan://abc".to_owned()), ..guest_nic() };
        assert!(driver.plug(&bad_vlan, "Ubuntu", &BTreeMap::new()).is_err());
    }

    #[test]
    fn registry_without_driver_reports_traffic_type() {
        let registry = VifRegistry::new();
        match registry.plug(&guest_nic(), "Ubuntu", &BTreeMap::new()) {
            Err(VifError::NoDriver(TrafficType::Guest)) => {}
            other => panic!("expected NoDriver, got {other:?}"),
        }
    }

    #[test]
    fn registry_with_bridges_routes_by_traffic_type() {
        let registry = VifRegistry::with_bridges(&BridgeConfig::default());
        let control = NicSpec {
            traffic_type: TrafficType::Control,
            broadcast_uri: None,
            ..guest_nic()
        };
        let iface = match registry.plug(&control, "Debian", &BTreeMap::new()) {
            Ok(i) => i,
            Err(e) => panic!("unexpected error: {e}"),
        };
        assert_eq!(iface.bridge, "cloud0");
        assert_eq!(iface.vlan, None);
    }
}
