//! Per-domain counters and utilization.

use std::collections::HashMap;

use chrono::Utc;
use hvagent_core::{DomainName, VmStatsEntry, VmStatsSample, VmUtilization};
use tokio::sync::Mutex;

use crate::descriptor::xml;
use crate::error::NativeError;
use crate::native::{Domain, XmlDescFlags};

/// Samples domains and remembers the previous sample of each.
///
/// Samples live only in memory; after a restart the first reading of every
/// domain reports zero utilization.
#[derive(Debug, Default)]
pub struct StatsCollector {
    previous: Mutex<HashMap<DomainName, VmStatsSample>>,
}

impl StatsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the domain's counters and derive utilization against the last
    /// sample taken for the same domain.
    ///
    /// # Errors
    /// Returns the native error if the domain info or XML cannot be read.
    /// Missing per-device or balloon counters are logged and read as zero.
    pub async fn collect(&self, domain: &dyn Domain) -> Result<VmStatsEntry, NativeError> {
        let sample = sample(domain).await?;
        let mut previous = self.previous.lock().await;
        let utilization = diff(previous.get(domain.name()), &sample);
        previous.insert(domain.name().clone(), sample.clone());
        Ok(VmStatsEntry { sample, utilization })
    }

    /// Drop the remembered sample of a domain that stopped.
    pub async fn forget(&self, name: &DomainName) {
        self.previous.lock().await.remove(name);
    }
}

/// Take one point-in-time sample.
///
/// # Errors
/// Returns the native error if the domain info or XML cannot be read.
pub async fn sample(domain: &dyn Domain) -> Result<VmStatsSample, NativeError> {
    let info = domain.info().await?;
    let devices = xml::target_devices(&domain.xml_desc(XmlDescFlags::empty()).await?);

    let mut sample = VmStatsSample {
        taken_at: Utc::now(),
        cpu_time_ns: info.cpu_time_ns,
        vcpus: info.vcpus,
        ..VmStatsSample::default()
    };

    for dev in &devices.interfaces {
        match domain.interface_stats(dev).await {
            Ok(s) => {
                sample.rx_bytes += s.rx_bytes;
                sample.tx_bytes += s.tx_bytes;
            }
            Err(e) => tracing::warn!(domain = %domain.name(), device = %dev, error = %e, "interface stats unavailable"),
        }
    }
    for dev in &devices.disks {
        match domain.block_stats(dev).await {
            Ok(s) => {
                sample.disk_read_ops += s.read_ops;
                sample.disk_write_ops += s.write_ops;
                sample.disk_read_bytes += s.read_bytes;
                sample.disk_write_bytes += s.write_bytes;
            }
            Err(e) => tracing::warn!(domain = %domain.name(), device = %dev, error = %e, "block stats unavailable"),
        }
    }
    match domain.memory_stats().await {
        Ok(m) => {
            sample.memory_actual_kib = m.actual_kib;
            sample.memory_unused_kib = m.unused_kib.unwrap_or(0);
            sample.memory_rss_kib = m.rss_kib;
        }
        Err(e) => tracing::debug!(domain = %domain.name(), error = %e, "balloon stats unavailable"),
    }

    Ok(sample)
}

/// Utilization between two samples. No previous sample, or one that is not
/// older than `current`, yields zeros.
///
/// Counters that went backwards (a domain restart between samples) count as
/// zero progress.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn diff(previous: Option<&VmStatsSample>, current: &VmStatsSample) -> VmUtilization {
    let Some(prev) = previous else {
        return VmUtilization::default();
    };
    let Some(elapsed_ns) = (current.taken_at - prev.taken_at)
        .num_nanoseconds()
        .and_then(|ns| u64::try_from(ns).ok())
        .filter(|ns| *ns > 0)
    else {
        return VmUtilization::default();
    };

    let cpu_ns = current.cpu_time_ns.saturating_sub(prev.cpu_time_ns);
    let vcpus = u64::from(current.vcpus.max(1));
    let cpu_pct = (cpu_ns as f64 / (elapsed_ns as f64 * vcpus as f64) * 100.0).clamp(0.0, 100.0);

    let kib = |now: u64, before: u64| now.saturating_sub(before) as f64 / 1024.0;

    VmUtilization {
        interval_secs: elapsed_ns as f64 / 1e9,
        cpu_utilization_pct: cpu_pct,
        network_read_kib: kib(current.rx_bytes, prev.rx_bytes),
        network_write_kib: kib(current.tx_bytes, prev.tx_bytes),
        disk_read_iops: current.disk_read_ops.saturating_sub(prev.disk_read_ops),
        disk_write_iops: current.disk_write_ops.saturating_sub(prev.disk_write_ops),
        disk_read_kib: kib(current.disk_read_bytes, prev.disk_read_bytes),
        disk_write_kib: kib(current.disk_write_bytes, prev.disk_write_bytes),
    }
}
