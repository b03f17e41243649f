use std::net::IpAddr;

use crate::icmp::IpVersion;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// The transport behind an engine could not be constructed.
    TransportInit(String),
    AddressFamily { expected: IpVersion, address: IpAddr },
    /// Continuous probing and single-shot probing were requested at once.
    Busy,
    InvalidConfig(String),
    Unavailable(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::TransportInit(reason) => write!(f, "Failed to initialise transport: {}", reason),
            EngineError::AddressFamily { expected, address } => {
                write!(f, "{} is not an {} address", address, expected)
            }
            EngineError::Busy => write!(f, "Engine is busy with another probing mode"),
            EngineError::InvalidConfig(reason) => write!(f, "Invalid engine configuration: {}", reason),
            EngineError::Unavailable(id) => write!(f, "Ping engine '{}' is not available", id),
        }
    }
}

impl std::error::Error for EngineError {}
