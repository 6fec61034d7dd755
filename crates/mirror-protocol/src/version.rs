//! Wire version of the Call Mirror event protocol.
//!
//! The version travels in two places: a client may announce it in the
//! handshake (`?v=1.0`), and every bus envelope carries the publisher's
//! major number in its `v` field. Only the major number decides whether two
//! parties understand each other; minor bumps add events or optional fields.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::codec::ProtocolError;

/// Version spoken by this build.
pub const PROTOCOL_VERSION: Version = Version::new(1, 0);

/// A `major.minor` event protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// The version implied by an envelope's `v` field.
    #[must_use]
    pub const fn from_major(major: u8) -> Self {
        Self::new(major, 0)
    }

    /// Same major number.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }

    /// Settle the version for a new connection from what the client
    /// announced in its handshake.
    ///
    /// No announcement means the current version. A compatible announcement
    /// yields the lower of the two, so neither side relies on events the
    /// other does not know.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnsupportedVersion`] if the announcement does
    /// not parse or names another major version.
    pub fn negotiate(announced: Option<&str>) -> Result<Version, ProtocolError> {
        let Some(announced) = announced else {
            return Ok(PROTOCOL_VERSION);
        };
        match announced.parse::<Version>() {
            Ok(client) if client.is_compatible_with(&PROTOCOL_VERSION) => {
                Ok(client.min(PROTOCOL_VERSION))
            }
            _ => Err(ProtocolError::UnsupportedVersion(announced.to_string())),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for Version {
    type Err = &'static str;

    /// Parse `"1"` or `"1.2"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s.split_once('.').unwrap_or((s, "0"));
        let major = major.trim().parse().map_err(|_| "Invalid major version")?;
        let minor = minor.trim().parse().map_err(|_| "Invalid minor version")?;
        Ok(Self::new(major, minor))
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}
