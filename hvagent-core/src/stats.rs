use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw cumulative counters of one domain at one instant.
///
/// Counters are monotonically increasing while the domain runs; utilization
/// is only meaningful as the difference of two samples.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmStatsSample {
    /// When the counters were read.
    pub taken_at: DateTime<Utc>,
    /// Cumulative guest CPU time in nanoseconds.
    pub cpu_time_ns: u64,
    /// vCPUs online when sampled.
    pub vcpus: u32,
    /// Bytes received across all interfaces.
    pub rx_bytes: u64,
    /// Bytes transmitted across all interfaces.
    pub tx_bytes: u64,
    /// Read requests across all disks.
    pub disk_read_ops: u64,
    /// Write requests across all disks.
    pub disk_write_ops: u64,
    /// Bytes read across all disks.
    pub disk_read_bytes: u64,
    /// Bytes written across all disks.
    pub disk_write_bytes: u64,
    /// Balloon size as seen by the host, KiB.
    pub memory_actual_kib: u64,
    /// Memory the guest reports unused, KiB.
    pub memory_unused_kib: u64,
    /// Resident set size of the emulator process, KiB.
    pub memory_rss_kib: u64,
}

/// Rates derived from two consecutive [`VmStatsSample`]s.
///
/// All fields are zero when no earlier sample exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VmUtilization {
    /// Seconds between the two samples.
    pub interval_secs: f64,
    /// Guest CPU usage across all vCPUs, `0.0..=100.0`.
    pub cpu_utilization_pct: f64,
    /// KiB received during the interval.
    pub network_read_kib: f64,
    /// KiB transmitted during the interval.
    pub network_write_kib: f64,
    /// Read requests during the interval.
    pub disk_read_iops: u64,
    /// Write requests during the interval.
    pub disk_write_iops: u64,
    /// KiB read during the interval.
    pub disk_read_kib: f64,
    /// KiB written during the interval.
    pub disk_write_kib: f64,
}

/// Stats reported for one domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmStatsEntry {
    /// The counters just read.
    pub sample: VmStatsSample,
    /// Rates relative to the previous sample of the same domain.
    pub utilization: VmUtilization,
}
