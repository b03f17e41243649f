use parking_lot::Mutex;
use std::net::IpAddr;

use crate::engine::PingResult;

/// One (host, ttl) unit probed on every round of a running engine.
///
/// Targets are handed out as `Arc<PingTarget>` but belong to the engine that
/// created them; results only keep a weak reference back.
#[derive(Debug)]
pub struct PingTarget {
    id: u64,
    address: IpAddr,
    ttl: Option<u8>,
    last_result: Mutex<Option<PingResult>>,
}

impl PingTarget {
    pub(crate) fn new(id: u64, address: IpAddr, ttl: Option<u8>) -> Self {
        Self {
            id,
            address,
            ttl,
            last_result: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    /// `None` means the platform default, i.e. no hop restriction.
    pub fn ttl(&self) -> Option<u8> {
        self.ttl
    }

    pub fn last_result(&self) -> Option<PingResult> {
        self.last_result.lock().clone()
    }

    pub(crate) fn set_last_result(&self, result: PingResult) {
        *self.last_result.lock() = Some(result);
    }
}
