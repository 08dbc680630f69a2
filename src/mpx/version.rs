//! Protocol versions and negotiation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// `major.minor` protocol version. Ordered by major, then minor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ProtocolVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s
            .trim()
            .split_once('.')
            .ok_or_else(|| format!("version '{}' is not major.minor", s))?;
        let major = major
            .parse()
            .map_err(|_| format!("bad major version in '{}'", s))?;
        let minor = minor
            .parse()
            .map_err(|_| format!("bad minor version in '{}'", s))?;
        Ok(Self { major, minor })
    }
}

impl TryFrom<String> for ProtocolVersion {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ProtocolVersion> for String {
    fn from(v: ProtocolVersion) -> Self {
        v.to_string()
    }
}

/// What one side speaks and the least it accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionPolicy {
    pub version: ProtocolVersion,
    pub minimum: ProtocolVersion,
}

/// Record of a failed negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionMismatch {
    pub local_version: ProtocolVersion,
    pub remote_version: ProtocolVersion,
    pub local_minimum: ProtocolVersion,
    pub remote_minimum: ProtocolVersion,
}

impl fmt::Display for VersionMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "local {} (min {}) vs remote {} (min {})",
            self.local_version, self.local_minimum, self.remote_version, self.remote_minimum
        )
    }
}

/// Agree on a version: the lower of the two, provided it satisfies both
/// minimums.
pub fn negotiate(
    local: VersionPolicy,
    remote: VersionPolicy,
) -> Result<ProtocolVersion, VersionMismatch> {
    let effective = local.version.min(remote.version);
    if effective < local.minimum || effective < remote.minimum {
        return Err(VersionMismatch {
            local_version: local.version,
            remote_version: remote.version,
            local_minimum: local.minimum,
            remote_minimum: remote.minimum,
        });
    }
    Ok(effective)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(version: &str, minimum: &str) -> VersionPolicy {
        VersionPolicy {
            version: version.parse().unwrap(),
            minimum: minimum.parse().unwrap(),
        }
    }

    #[test]
    fn lower_version_wins() {
        let v = negotiate(policy("2.3", "2.0"), policy("2.1", "1.0")).unwrap();
        assert_eq!(v, ProtocolVersion::new(2, 1));
    }

    #[test]
    fn minimum_above_effective_fails_both_ways() {
        let client = policy("2.1", "2.0");
        let server = policy("2.0", "2.1");

        let from_client = negotiate(client, server).unwrap_err();
        assert_eq!(from_client.local_minimum, ProtocolVersion::new(2, 0));
        assert_eq!(from_client.remote_minimum, ProtocolVersion::new(2, 1));

        let from_server = negotiate(server, client).unwrap_err();
        assert_eq!(from_server.local_version, ProtocolVersion::new(2, 0));
        assert_eq!(from_server.remote_version, ProtocolVersion::new(2, 1));
    }

    #[test]
    fn parse_and_display() {
        let v: ProtocolVersion = "10.42".parse().unwrap();
        assert_eq!(v.to_string(), "10.42");
        assert!("2".parse::<ProtocolVersion>().is_err());
        assert!(ProtocolVersion::new(1, 9) < ProtocolVersion::new(2, 0));
    }
}
