//! Classification of the free-form guest OS string.

/// Broad guest OS family, derived from the platform emulator string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuestOsFamily {
    Linux,
    Bsd,
    Windows,
    Other,
}

const LINUX_MARKERS: &[&str] = &[
    "linux", "ubuntu", "debian", "centos", "red hat", "rhel", "fedora", "suse", "rocky", "alma",
    "oracle", "coreos", "alpine",
];

impl GuestOsFamily {
    /// Classify a platform emulator string such as `"Ubuntu 22.04 (64-bit)"`.
    #[must_use]
    pub fn classify(os: &str) -> Self {
        let os = os.to_ascii_lowercase();
        if os.contains("windows") {
            Self::Windows
        } else if os.contains("bsd") {
            Self::Bsd
        } else if LINUX_MARKERS.iter().any(|m| os.contains(m)) {
            Self::Linux
        } else {
            Self::Other
        }
    }

    /// Whether the guest ships paravirtual (virtio) drivers out of the box.
    #[must_use]
    pub fn has_virtio_drivers(self) -> bool {
        matches!(self, Self::Linux | Self::Bsd)
    }
}

/// Whether the OS string explicitly asks for a virtio-scsi root disk.
#[must_use]
pub fn wants_virtio_scsi(os: &str) -> bool {
    os.to_ascii_lowercase().contains("virtio-scsi")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_common_platform_strings() {
        assert_eq!(GuestOsFamily::classify("Ubuntu 22.04 LTS (64-bit)"), GuestOsFamily::Linux);
        assert_eq!(GuestOsFamily::classify("Debian GNU/Linux 12 (64-bit)"), GuestOsFamily::Linux);
        assert_eq!(GuestOsFamily::classify("FreeBSD 13 (64-bit)"), GuestOsFamily::Bsd);
        assert_eq!(GuestOsFamily::classify("Windows Server 2022 (64-bit)"), GuestOsFamily::Windows);
        assert_eq!(GuestOsFamily::classify("Other (64-bit)"), GuestOsFamily::Other);
    }

    #[test]
    fn windows_never_gets_virtio_by_default() {
        assert!(!GuestOsFamily::Windows.has_virtio_drivers());
        assert!(GuestOsFamily::Linux.has_virtio_drivers());
    }

    #[test]
    fn virtio_scsi_marker_is_case_insensitive() {
        assert!(wants_virtio_scsi("Other PV Virtio-SCSI (64-bit)"));
        assert!(!wants_virtio_scsi("Ubuntu 22.04"));
    }
}
