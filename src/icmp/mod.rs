pub mod packet;
pub mod socket;

#[cfg(windows)]
pub mod winapi;

pub use packet::*;
pub use socket::*;

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Address family an engine or transport is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpVersion {
    #[serde(rename = "v4")]
    V4,
    #[serde(rename = "v6")]
    V6,
}

impl IpVersion {
    pub fn of(address: &IpAddr) -> Self {
        match address {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }

    pub fn matches(&self, address: &IpAddr) -> bool {
        IpVersion::of(address) == *self
    }

    pub fn is_ipv6(&self) -> bool {
        *self == IpVersion::V6
    }
}

impl std::fmt::Display for IpVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpVersion::V4 => write!(f, "IPv4"),
            IpVersion::V6 => write!(f, "IPv6"),
        }
    }
}

/// One echo request handed to a transport.
///
/// `token` is echoed back with the reply and is what the engine correlates on.
#[derive(Debug, Clone)]
pub struct EchoRequest {
    pub token: u64,
    pub address: IpAddr,
    /// `None` leaves the platform default hop limit in place.
    pub ttl: Option<u8>,
    pub payload: Vec<u8>,
    pub timeout: Duration,
}

/// Outcome of one echo request as seen by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EchoStatus {
    Reply,
    TtlExpired,
    TimedOut,
    Unreachable(u8),
    Failed(String),
}

impl std::fmt::Display for EchoStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EchoStatus::Reply => write!(f, "Echo reply"),
            EchoStatus::TtlExpired => write!(f, "TTL expired in transit"),
            EchoStatus::TimedOut => write!(f, "Request timed out"),
            EchoStatus::Unreachable(code) => write!(f, "Destination unreachable (code {})", code),
            EchoStatus::Failed(reason) => write!(f, "Transmit failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EchoReply {
    pub status: EchoStatus,
    pub responder: Option<IpAddr>,
    pub elapsed: Duration,
}

impl EchoReply {
    pub fn timed_out(elapsed: Duration) -> Self {
        Self {
            status: EchoStatus::TimedOut,
            responder: None,
            elapsed,
        }
    }

    pub fn failed(reason: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            status: EchoStatus::Failed(reason.into()),
            responder: None,
            elapsed,
        }
    }
}

/// Platform capability that can carry an echo request with a chosen TTL.
///
/// `round_trip` blocks until a reply for `request.token` arrives or
/// `request.timeout` passes. Engines run it on a blocking pool and feed the
/// reply back into their own correlation table, so a transport never needs
/// to know about pending requests.
pub trait Transport: Send + Sync {
    fn ip_version(&self) -> IpVersion;

    fn name(&self) -> &'static str;

    fn round_trip(&self, request: &EchoRequest) -> EchoReply;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_version_matching() {
        let v4: IpAddr = "192.0.2.1".parse().unwrap();
        let v6: IpAddr = "2001:db8::1".parse().unwrap();

        assert_eq!(IpVersion::of(&v4), IpVersion::V4);
        assert!(IpVersion::V6.matches(&v6));
        assert!(!IpVersion::V4.matches(&v6));
    }

    #[test]
    fn test_ip_version_serialization() {
        assert_eq!(serde_json::to_string(&IpVersion::V4).unwrap(), "\"v4\"");
        let parsed: IpVersion = serde_json::from_str("\"v6\"").unwrap();
        assert_eq!(parsed, IpVersion::V6);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(EchoStatus::TimedOut.to_string(), "Request timed out");
        assert!(EchoStatus::Unreachable(3).to_string().contains("code 3"));
    }
}
