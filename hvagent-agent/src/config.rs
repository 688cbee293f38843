//! Agent configuration.
//!
//! Loaded from an optional TOML file, then overridden by `HVAGENT_*`
//! environment variables. Every field has a default so an empty file (or no
//! file) yields a working configuration for a stock libvirt/QEMU host.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hvagent_core::{StoragePoolType, TrafficType};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level agent configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct AgentConfig {
    /// Path or bare name of the `virsh` binary.
    pub virsh_path: PathBuf,

    /// Libvirt connection URI.
    pub connection_uri: String,

    /// Upper bound for a single hypervisor client call.
    pub native_call_timeout_secs: u64,

    /// Upper bound for each capability probe command.
    pub probe_timeout_secs: u64,

    /// Upper bound for permit acquisition and for block-job completion during a merge.
    pub merge_timeout_secs: u64,

    /// Spacing between block-job state reads while a merge waits for its outcome.
    pub merge_poll_interval_secs: u64,

    /// Block-commit bandwidth cap in MiB/s; `0` means unlimited.
    pub block_commit_bandwidth_mib: u64,

    /// Commands executed concurrently; further commands wait for a slot.
    pub max_concurrent_commands: usize,

    /// Defaults applied when building domain descriptors.
    pub domain: DomainDefaults,

    /// Storage pools known to the local resolver, keyed by pool UUID.
    pub pools: BTreeMap<String, PoolConfig>,

    /// Host bridges per traffic type.
    pub bridges: BridgeConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            virsh_path: PathBuf::from("virsh"),
            connection_uri: "qemu:///system".to_owned(),
            native_call_timeout_secs: 60,
            probe_timeout_secs: 10,
            merge_timeout_secs: 3600,
            merge_poll_interval_secs: 5,
            block_commit_bandwidth_mib: 0,
            max_concurrent_commands: 16,
            domain: DomainDefaults::default(),
            pools: BTreeMap::new(),
            bridges: BridgeConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load the configuration file, if any, and apply environment overrides.
    ///
    /// # Errors
    /// Returns [`ConfigError::Read`] or [`ConfigError::Toml`] for an unreadable
    /// or malformed file, and [`ConfigError::InvalidOverride`] for a bad
    /// environment value.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(std::env::vars())?;
        Ok(config)
    }

    /// Parse a TOML configuration file.
    ///
    /// # Errors
    /// Returns [`ConfigError::Read`] if the file cannot be read and
    /// [`ConfigError::Toml`] if it is not valid.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Ok(toml::from_str(&contents)?)
    }

    /// Apply `HVAGENT_*` overrides from `(key, value)` pairs.
    ///
    /// Unrelated keys are ignored.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidOverride`] if a numeric or boolean
    /// override does not parse.
    pub fn apply_overrides<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
            value.trim().parse().map_err(|_| ConfigError::InvalidOverride {
                key: key.to_owned(),
                value: value.to_owned(),
            })
        }

        for (key, value) in vars {
            match key.as_str() {
                "HVAGENT_VIRSH_PATH" => self.virsh_path = PathBuf::from(value),
                "HVAGENT_CONNECTION_URI" => self.connection_uri = value,
                "HVAGENT_MERGE_TIMEOUT_SECS" => self.merge_timeout_secs = parse(&key, &value)?,
                "HVAGENT_MERGE_POLL_INTERVAL_SECS" => {
                    self.merge_poll_interval_secs = parse(&key, &value)?;
                }
                "HVAGENT_MAX_CONCURRENT_COMMANDS" => {
                    self.max_concurrent_commands = parse(&key, &value)?;
                }
                "HVAGENT_MEMORY_BALLOONING" => {
                    self.domain.memory_ballooning = parse(&key, &value)?;
                }
                "HVAGENT_VNC_LISTEN" => self.domain.vnc_listen = value,
                _ => {}
            }
        }
        Ok(())
    }

    /// Timeout for a single hypervisor client call.
    #[must_use]
    pub fn native_call_timeout(&self) -> Duration {
        Duration::from_secs(self.native_call_timeout_secs)
    }

    /// Timeout for each capability probe command.
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Timeout for each blocking stage of a merge.
    #[must_use]
    pub fn merge_timeout(&self) -> Duration {
        Duration::from_secs(self.merge_timeout_secs)
    }

    /// Spacing between block-job state reads during a merge.
    #[must_use]
    pub fn merge_poll_interval(&self) -> Duration {
        Duration::from_secs(self.merge_poll_interval_secs)
    }
}

/// Host-side defaults used by the domain descriptor builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainDefaults {
    /// Directory holding per-domain guest agent sockets.
    pub channel_dir: PathBuf,
    /// Address the VNC server listens on.
    pub vnc_listen: String,
    /// SMBIOS system manufacturer.
    pub smbios_manufacturer: String,
    /// SMBIOS system product.
    pub smbios_product: String,
    /// Device emulator binary; libvirt picks one when unset.
    pub emulator_path: Option<PathBuf>,
    /// UEFI firmware for legacy (non-secure) boot.
    pub uefi_loader_legacy: Option<PathBuf>,
    /// UEFI firmware for secure boot.
    pub uefi_loader_secure: Option<PathBuf>,
    /// Directory for per-domain UEFI variable stores.
    pub nvram_dir: PathBuf,
    /// Attach a balloon device and boot with the guaranteed memory.
    pub memory_ballooning: bool,
    /// Host entropy source for the RNG device.
    pub rng_source: PathBuf,
    /// Bytes the guest may draw per rate period.
    pub rng_rate_bytes: u32,
    /// RNG rate period in milliseconds.
    pub rng_rate_period_ms: u32,
}

impl Default for DomainDefaults {
    fn default() -> Self {
        Self {
            channel_dir: PathBuf::from("/var/lib/libvirt/qemu"),
            vnc_listen: "0.0.0.0".to_owned(),
            smbios_manufacturer: "hvagent".to_owned(),
            smbios_product: "hvagent KVM guest".to_owned(),
            emulator_path: None,
            uefi_loader_legacy: Some(PathBuf::from("/usr/share/OVMF/OVMF_CODE.fd")),
            uefi_loader_secure: Some(PathBuf::from("/usr/share/OVMF/OVMF_CODE.secboot.fd")),
            nvram_dir: PathBuf::from("/var/lib/libvirt/qemu/nvram"),
            memory_ballooning: true,
            rng_source: PathBuf::from("/dev/random"),
            rng_rate_bytes: 2048,
            rng_rate_period_ms: 1000,
        }
    }
}

/// A storage pool served by the local directory resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Kind of pool.
    pub pool_type: StoragePoolType,
    /// Mount point, volume group device directory, or RBD pool name.
    pub path: PathBuf,
    /// Monitor or server address for network pools.
    #[serde(default)]
    pub source_host: Option<String>,
    /// Port of `source_host`.
    #[serde(default)]
    pub source_port: Option<u16>,
}

/// Host bridge names per traffic type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub guest: String,
    pub public: String,
    pub management: String,
    pub control: String,
    pub storage: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            guest: "cloudbr1".to_owned(),
            public: "cloudbr0".to_owned(),
            management: "cloudbr0".to_owned(),
            control: "cloud0".to_owned(),
            storage: "cloudbr0".to_owned(),
        }
    }
}

impl BridgeConfig {
    /// Bridge carrying the given traffic type.
    #[must_use]
    pub fn bridge_for(&self, traffic_type: TrafficType) -> &str {
        match traffic_type {
            TrafficType::Guest => &self.guest,
            TrafficType::Public => &self.public,
            TrafficType::Control => &self.control,
            TrafficType::Storage => &self.storage,
            _ => &self.management,
        }
    }
}
