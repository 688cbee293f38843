use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A host software version following the `major.minor.micro` scheme.
///
/// Libvirt and QEMU both report versions this way and libvirt additionally
/// exposes them as a single integer `major * 1_000_000 + minor * 1_000 + micro`.
/// Ordering compares the components lexicographically, which matches the
/// ordering of the encoded form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Major version.
    pub major: u32,
    /// Minor version, `0..1000`.
    pub minor: u32,
    /// Micro (patch) version, `0..1000`.
    pub micro: u32,
}

impl Version {
    /// Creates a new `Version`.
    #[must_use]
    pub const fn new(major: u32, minor: u32, micro: u32) -> Self {
        Self { major, minor, micro }
    }

    /// Decodes the libvirt integer form (`6003000` is `6.3.0`).
    #[must_use]
    pub const fn from_encoded(encoded: u64) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        Self {
            major: (encoded / 1_000_000) as u32,
            minor: ((encoded / 1_000) % 1_000) as u32,
            micro: (encoded % 1_000) as u32,
        }
    }

    /// Returns the libvirt integer form of this version.
    #[must_use]
    pub const fn encoded(&self) -> u64 {
        self.major as u64 * 1_000_000 + self.minor as u64 * 1_000 + self.micro as u64
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}

impl FromStr for Version {
    type Err = CoreError;

    /// Parses `"8.0.0"`, `"6.2"` or `"7"`; missing components default to zero.
    /// Trailing distribution suffixes such as `"6.2.0-1ubuntu2"` are ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| CoreError::InvalidVersion {
            raw: s.to_owned(),
            reason: reason.to_owned(),
        };

        let core = s
            .trim()
            .split(|c: char| !(c.is_ascii_digit() || c == '.'))
            .next()
            .unwrap_or_default();
        if core.is_empty() {
            return Err(invalid("no leading numeric component"));
        }

        let mut parts = [0u32; 3];
        for (i, part) in core.split('.').filter(|p| !p.is_empty()).enumerate() {
            if i >= parts.len() {
                return Err(invalid("more than three components"));
            }
            parts[i] = part.parse().map_err(|_| invalid("component is not a number"))?;
        }
        if parts[1] >= 1_000 || parts[2] >= 1_000 {
            return Err(invalid("minor and micro must be below 1000"));
        }

        Ok(Self::new(parts[0], parts[1], parts[2]))
    }
}
