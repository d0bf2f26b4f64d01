//! MongoDB version strings.

use std::fmt;
use std::str::FromStr;

use crate::error::OperatorError;

/// A parsed `major.minor.patch` MongoDB version; suffixes such as `-ent` are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MongoVersion {
    /// Major component.
    pub major: u32,
    /// Minor component.
    pub minor: u32,
    /// Patch component.
    pub patch: u32,
}

impl MongoVersion {
    /// Create a version from its components.
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Whether the server sizes its WiredTiger cache from container limits.
    ///
    /// Older servers read host memory instead, so the cache has to be set
    /// explicitly for `<3.6.13` and `>=4.0.0 <4.0.9`.
    #[must_use]
    pub fn self_tunes_wired_tiger_cache(self) -> bool {
        let before_3_6_13 = self < Self::new(3, 6, 13);
        let early_4_0 = self >= Self::new(4, 0, 0) && self < Self::new(4, 0, 9);
        !(before_3_6_13 || early_4_0)
    }

    /// Replica set protocol version supported by this server.
    #[must_use]
    pub fn replica_set_protocol_version(self) -> &'static str {
        if self >= Self::new(3, 2, 0) {
            "1"
        } else {
            "0"
        }
    }
}

impl FromStr for MongoVersion {
    type Err = OperatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || OperatorError::Validation(format!("invalid MongoDB version \"{s}\""));
        let core = s.split(['-', '+']).next().unwrap_or_default();
        let mut parts = core.split('.');
        let mut next = || -> Result<u32, OperatorError> {
            parts
                .next()
                .ok_or_else(invalid)?
                .parse::<u32>()
                .map_err(|_| invalid())
        };
        let version = Self::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(version)
    }
}

impl fmt::Display for MongoVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
