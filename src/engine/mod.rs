//! Ping engines: a target registry plus a transmitter bound to one transport.

mod config;
mod error;
pub mod factory;
mod pending;
mod result;
mod target;
mod transmitter;

pub use config::*;
pub use error::EngineError;
pub use factory::{EngineRegistry, EngineTracker, PingEngineFactory, RawSocketEngineFactory};
#[cfg(windows)]
pub use factory::IcmpApiEngineFactory;
pub use result::{PingEvent, PingResult, ResultCode};
pub use target::PingTarget;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;

use crate::icmp::{echo_payload, EchoRequest, IpVersion, Transport};
use transmitter::TransmitterHandle;

pub type EngineId = u64;

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

/// State reachable from both the engine handle and its transmitter thread.
pub(crate) struct EngineShared {
    pub id: EngineId,
    pub version: IpVersion,
    targets: RwLock<Vec<Arc<PingTarget>>>,
    config: RwLock<EngineConfig>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<PingEvent>>>,
    sequence: AtomicU64,
    next_target: AtomicU64,
}

impl EngineShared {
    pub fn targets(&self) -> Vec<Arc<PingTarget>> {
        self.targets.read().clone()
    }

    pub fn config(&self) -> EngineConfig {
        self.config.read().clone()
    }

    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Stores `result` on `target` and publishes it, unless `target` is no
    /// longer registered. The registry stays read-locked throughout, so once
    /// `remove_target` has returned nothing more reaches the target.
    pub fn deliver(&self, target: &Arc<PingTarget>, result: PingResult) -> bool {
        let targets = self.targets.read();
        if !targets.iter().any(|t| Arc::ptr_eq(t, target)) {
            return false;
        }

        target.set_last_result(result.clone());

        let event = PingEvent { engine: self.id, result };
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
        true
    }
}

enum Activity {
    Idle,
    Running(TransmitterHandle),
    /// A single-shot probe is in flight.
    Probing,
}

struct EngineInner {
    shared: Arc<EngineShared>,
    transport: Arc<dyn Transport>,
    activity: Mutex<Activity>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Activity::Running(handle) = std::mem::replace(self.activity.get_mut(), Activity::Idle) {
            log::debug!("Engine {} dropped while running, stopping it", self.shared.id);
            handle.halt();
        }
    }
}

/// Handle to a ping engine. Clones share the same engine; the transmitter is
/// stopped when the last handle goes away.
///
/// Continuous probing (`start`/`stop`) and `single_shot` are mutually
/// exclusive: while one is active the other is refused.
#[derive(Clone)]
pub struct PingEngine {
    inner: Arc<EngineInner>,
}

impl PingEngine {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let version = transport.ip_version();
        let shared = EngineShared {
            id: NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed),
            version,
            targets: RwLock::new(Vec::new()),
            config: RwLock::new(EngineConfig::new(version)),
            subscribers: Mutex::new(Vec::new()),
            sequence: AtomicU64::new(1),
            next_target: AtomicU64::new(1),
        };

        Self {
            inner: Arc::new(EngineInner {
                shared: Arc::new(shared),
                transport,
                activity: Mutex::new(Activity::Idle),
            }),
        }
    }

    pub fn id(&self) -> EngineId {
        self.inner.shared.id
    }

    pub fn ip_version(&self) -> IpVersion {
        self.inner.shared.version
    }

    pub fn transport_name(&self) -> &'static str {
        self.inner.transport.name()
    }

    pub fn add_target(&self, address: IpAddr) -> Result<Arc<PingTarget>, EngineError> {
        self.register(address, None)
    }

    pub fn add_target_with_ttl(&self, address: IpAddr, ttl: u8) -> Result<Arc<PingTarget>, EngineError> {
        check_ttl(ttl)?;
        self.register(address, Some(ttl))
    }

    fn register(&self, address: IpAddr, ttl: Option<u8>) -> Result<Arc<PingTarget>, EngineError> {
        let shared = &self.inner.shared;
        self.check_family(address)?;

        let target = Arc::new(PingTarget::new(
            shared.next_target.fetch_add(1, Ordering::Relaxed),
            address,
            ttl,
        ));
        shared.targets.write().push(Arc::clone(&target));

        log::debug!("Engine {} now tracking {} (ttl {:?})", shared.id, address, ttl);
        Ok(target)
    }

    /// Requests already in flight for `target` still complete, but their
    /// results are dropped.
    pub fn remove_target(&self, target: &Arc<PingTarget>) -> bool {
        let mut targets = self.inner.shared.targets.write();
        let before = targets.len();
        targets.retain(|t| !Arc::ptr_eq(t, target));
        targets.len() != before
    }

    pub fn targets(&self) -> Vec<Arc<PingTarget>> {
        self.inner.shared.targets()
    }

    /// Launches the transmitter on its own thread. Refused when already
    /// running or while a single-shot probe is in flight.
    pub fn start(&self) -> bool {
        let mut activity = self.inner.activity.lock();

        match *activity {
            Activity::Running(_) => {
                log::warn!("Engine {} is already running", self.id());
                return false;
            }
            Activity::Probing => {
                log::warn!("Engine {} cannot start during a single-shot probe", self.id());
                return false;
            }
            Activity::Idle => {}
        }

        match TransmitterHandle::launch(Arc::clone(&self.inner.shared), Arc::clone(&self.inner.transport)) {
            Ok(handle) => {
                *activity = Activity::Running(handle);
                log::info!("Engine {} started ({})", self.id(), self.transport_name());
                true
            }
            Err(e) => {
                log::error!("Engine {} failed to launch its transmitter: {}", self.id(), e);
                false
            }
        }
    }

    /// Stops the transmitter and waits for its thread to exit. No result is
    /// delivered once this returns.
    pub fn stop(&self) -> bool {
        let mut activity = self.inner.activity.lock();

        match std::mem::replace(&mut *activity, Activity::Idle) {
            Activity::Running(handle) => {
                handle.halt();
                log::info!("Engine {} stopped", self.id());
                true
            }
            other => {
                *activity = other;
                log::warn!("Engine {} is not running", self.id());
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.inner.activity.lock(), Activity::Running(_))
    }

    /// One blocking probe outside the target registry, used for hop discovery.
    pub fn single_shot(&self, address: IpAddr, ttl: u8, timeout: Duration) -> Result<PingResult, EngineError> {
        self.check_family(address)?;
        check_ttl(ttl)?;

        {
            let mut activity = self.inner.activity.lock();
            match *activity {
                Activity::Idle => *activity = Activity::Probing,
                _ => return Err(EngineError::Busy),
            }
        }
        let _probing = ProbeGuard(&self.inner.activity);

        let shared = &self.inner.shared;
        let request = EchoRequest {
            token: shared.next_sequence(),
            address,
            ttl: Some(ttl),
            payload: echo_payload(shared.config().payload_size),
            timeout,
        };

        let epoch = SystemTime::now();
        let reply = self.inner.transport.round_trip(&request);
        log::trace!("Single shot to {} at ttl {}: {}", address, ttl, reply.status);

        Ok(PingResult::from_reply(request.token, &reply, epoch, None, Some(ttl)))
    }

    /// Takes effect on the next transmission round.
    pub fn set_interval(&self, interval_ms: u64) -> bool {
        if interval_ms == 0 {
            return false;
        }
        self.inner.shared.config.write().interval = interval_ms;
        true
    }

    pub fn interval(&self) -> Duration {
        self.inner.shared.config.read().interval()
    }

    /// Takes effect on the next transmission round.
    pub fn set_timeout(&self, timeout_ms: u64) -> bool {
        if timeout_ms == 0 {
            return false;
        }
        self.inner.shared.config.write().timeout = timeout_ms;
        true
    }

    pub fn timeout(&self) -> Duration {
        self.inner.shared.config.read().timeout()
    }

    pub fn set_payload_size(&self, size: usize) -> bool {
        if size > 65500 {
            return false;
        }
        self.inner.shared.config.write().payload_size = size;
        true
    }

    pub fn payload_size(&self) -> usize {
        self.inner.shared.config.read().payload_size
    }

    /// New receiver for every result this engine publishes from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PingEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.shared.subscribers.lock().push(tx);
        rx
    }

    pub fn save_configuration(&self) -> Value {
        self.inner.shared.config.read().to_document()
    }

    pub fn load_configuration(&self, document: &Value) -> Result<(), EngineError> {
        let config = EngineConfig::from_document(document)?;

        if config.ip_version != self.ip_version() {
            return Err(EngineError::InvalidConfig(format!(
                "document is for {} but the engine is bound to {}",
                config.ip_version,
                self.ip_version()
            )));
        }

        *self.inner.shared.config.write() = config;
        Ok(())
    }

    pub(crate) fn same_as(&self, other: &PingEngine) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn check_family(&self, address: IpAddr) -> Result<(), EngineError> {
        let expected = self.ip_version();
        if expected.matches(&address) {
            Ok(())
        } else {
            Err(EngineError::AddressFamily { expected, address })
        }
    }
}

impl std::fmt::Debug for PingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PingEngine")
            .field("id", &self.id())
            .field("ip_version", &self.ip_version())
            .field("transport", &self.transport_name())
            .field("running", &self.is_running())
            .finish()
    }
}

fn check_ttl(ttl: u8) -> Result<(), EngineError> {
    if ttl == 0 {
        return Err(EngineError::InvalidConfig("TTL must be in the range 1-255".into()));
    }
    Ok(())
}

struct ProbeGuard<'a>(&'a Mutex<Activity>);

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        let mut activity = self.0.lock();
        if matches!(*activity, Activity::Probing) {
            *activity = Activity::Idle;
        }
    }
}
