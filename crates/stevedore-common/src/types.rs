//! Domain primitive types used across the Stevedore workspace.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Transport protocol of an exposed or published port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    /// TCP, the default when no protocol is declared.
    #[default]
    Tcp,
    /// UDP.
    Udp,
}

impl TransportProtocol {
    /// Returns the lowercase protocol name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl FromStr for TransportProtocol {
    type Err = String;

    /// Parses a declared protocol; the empty string means TCP.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(format!("protocol {other} not supported")),
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address family a published endpoint binds in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    /// Any address family (`:port` binds on every interface).
    #[default]
    Unspecified,
    /// IPv4 only.
    Ipv4,
    /// IPv6 only.
    Ipv6,
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unspecified => write!(f, "ip"),
            Self::Ipv4 => write!(f, "ip4"),
            Self::Ipv6 => write!(f, "ip6"),
        }
    }
}

/// How shared dependencies are materialized during graph resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionPolicy {
    /// One execution unit per distinct service name; a dependency shared by
    /// several services is built once and bound into each of them.
    #[default]
    Memoized,
    /// One execution unit per dependency edge; a shared dependency is built
    /// again for every service that depends on it.
    PerEdge,
}

/// What happens to sibling tasks when one launched task fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CancellationPolicy {
    /// The first failure cancels every sibling through one shared scope.
    #[default]
    Shared,
    /// Siblings run to completion; only the first error is reported.
    Independent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_protocol_is_tcp() {
        assert_eq!("".parse::<TransportProtocol>(), Ok(TransportProtocol::Tcp));
        assert_eq!("TCP".parse::<TransportProtocol>(), Ok(TransportProtocol::Tcp));
    }

    #[test]
    fn udp_protocol_parses() {
        assert_eq!("udp".parse::<TransportProtocol>(), Ok(TransportProtocol::Udp));
    }

    #[test]
    fn sctp_protocol_is_rejected() {
        let err = "sctp".parse::<TransportProtocol>().unwrap_err();
        assert!(err.contains("sctp"), "got: {err}");
    }

    #[test]
    fn policies_deserialize_from_kebab_case() {
        let policy: ResolutionPolicy = serde_json::from_str("\"per-edge\"").expect("policy");
        assert_eq!(policy, ResolutionPolicy::PerEdge);
        let policy: CancellationPolicy = serde_json::from_str("\"independent\"").expect("policy");
        assert_eq!(policy, CancellationPolicy::Independent);
    }
}
