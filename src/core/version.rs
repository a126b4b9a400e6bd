//! Product version tags exchanged during handshake.

use std::fmt;

/// Version reported by clients that predate version tagging.
pub const UNKNOWN_VERSION: &str = "UNKNOWN";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProductVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProductVersion {
    /// Parses `major.minor[.patch][-suffix]`.
    pub fn parse(raw: &str) -> Option<Self> {
        let core = raw.trim().split(['-', '+']).next()?;
        let mut parts = core.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = match parts.next() {
            Some(p) => p.parse().ok()?,
            None => 0,
        };
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            major,
            minor,
            patch,
        })
    }

    /// Clients and servers interoperate within one major.minor line.
    pub fn is_compatible_with(&self, other: &ProductVersion) -> bool {
        self.major == other.major && self.minor == other.minor
    }
}

impl fmt::Display for ProductVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
