//! Engine factories and the registry a selection policy picks them from.

use parking_lot::{Mutex, RwLock};
use std::net::IpAddr;
use std::sync::Arc;

use crate::engine::{EngineError, PingEngine};
use crate::icmp::{check_raw_socket_privileges, IpVersion, RawSocketTransport, Transport};

/// Creates and disposes engines bound to one kind of transport.
///
/// Implementors provide the metadata and `open_transport`; engine bookkeeping
/// comes from the provided methods and the factory's [`EngineTracker`].
pub trait PingEngineFactory: Send + Sync {
    fn id(&self) -> &str;

    fn description(&self) -> &str;

    /// 0 = lowest, 1 = highest.
    fn priority(&self) -> f64;

    /// Checked afresh on every call; transport access can be lost at any time.
    fn available(&self) -> bool;

    /// Whether an engine for `version` can be created right now.
    fn supports(&self, version: IpVersion) -> bool {
        let _ = version;
        true
    }

    fn open_transport(&self, version: IpVersion) -> Result<Arc<dyn Transport>, EngineError>;

    fn engines(&self) -> &EngineTracker;

    fn create_engine(&self, version: IpVersion) -> Result<PingEngine, EngineError> {
        if !self.supports(version) {
            return Err(EngineError::Unavailable(format!("{} for {}", self.id(), version)));
        }

        let transport = self.open_transport(version).inspect_err(|e| {
            log::error!("Factory '{}' could not create an {} engine: {}", self.id(), version, e);
        })?;

        let engine = PingEngine::new(transport);
        self.engines().track(engine.clone());
        log::debug!("Factory '{}' created engine {}", self.id(), engine.id());
        Ok(engine)
    }

    /// Stops the engine first if it is running. Returns false for engines
    /// this factory did not create or has already released.
    fn delete_engine(&self, engine: PingEngine) -> bool {
        self.engines().release(&engine)
    }

    fn dispose_all(&self) -> usize {
        self.engines().release_all()
    }
}

/// The engines a factory has handed out and not yet released.
#[derive(Default)]
pub struct EngineTracker {
    engines: Mutex<Vec<PingEngine>>,
}

impl EngineTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, engine: PingEngine) {
        self.engines.lock().push(engine);
    }

    pub fn release(&self, engine: &PingEngine) -> bool {
        let released = {
            let mut engines = self.engines.lock();
            match engines.iter().position(|e| e.same_as(engine)) {
                Some(index) => engines.swap_remove(index),
                None => return false,
            }
        };

        if released.is_running() {
            released.stop();
        }
        true
    }

    pub fn release_all(&self) -> usize {
        let released: Vec<PingEngine> = self.engines.lock().drain(..).collect();
        for engine in &released {
            if engine.is_running() {
                engine.stop();
            }
        }
        released.len()
    }

    pub fn len(&self) -> usize {
        self.engines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.lock().is_empty()
    }
}

/// Process-wide set of engine factories, created once at startup and passed
/// to whoever needs to pick an engine.
#[derive(Default)]
pub struct EngineRegistry {
    factories: RwLock<Vec<Arc<dyn PingEngineFactory>>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the factories this platform can offer.
    pub fn with_defaults() -> Self {
        Self::with_source_address(None)
    }

    /// Like [`with_defaults`](Self::with_defaults), with raw sockets bound to
    /// `source` when one is given.
    pub fn with_source_address(source: Option<IpAddr>) -> Self {
        let registry = Self::new();
        let raw_socket = match source {
            Some(source) => RawSocketEngineFactory::bound_to(source),
            None => RawSocketEngineFactory::new(),
        };
        registry.register(Arc::new(raw_socket));
        #[cfg(windows)]
        registry.register(Arc::new(IcmpApiEngineFactory::new()));
        registry
    }

    /// Refuses a second factory with an id that is already registered.
    pub fn register(&self, factory: Arc<dyn PingEngineFactory>) -> bool {
        let mut factories = self.factories.write();
        if factories.iter().any(|f| f.id() == factory.id()) {
            log::warn!("Ping engine factory '{}' is already registered", factory.id());
            return false;
        }

        log::debug!("Registered ping engine factory '{}'", factory.id());
        factories.push(factory);
        true
    }

    /// All factories, highest priority first.
    pub fn factories(&self) -> Vec<Arc<dyn PingEngineFactory>> {
        let mut factories = self.factories.read().clone();
        factories.sort_by(|a, b| {
            b.priority()
                .clamp(0.0, 1.0)
                .total_cmp(&a.priority().clamp(0.0, 1.0))
        });
        factories
    }

    pub fn find(&self, id: &str) -> Option<Arc<dyn PingEngineFactory>> {
        self.factories.read().iter().find(|f| f.id() == id).cloned()
    }

    /// Highest priority factory that is usable right now for `version`.
    pub fn select(&self, version: IpVersion) -> Option<Arc<dyn PingEngineFactory>> {
        self.factories()
            .into_iter()
            .find(|f| f.supports(version) && f.available())
    }

    /// Disposes every engine of every factory and empties the registry.
    pub fn shutdown(&self) -> usize {
        let factories: Vec<_> = self.factories.write().drain(..).collect();
        factories.iter().map(|f| f.dispose_all()).sum()
    }
}

pub struct RawSocketEngineFactory {
    engines: EngineTracker,
    source: Option<IpAddr>,
}

impl RawSocketEngineFactory {
    pub fn new() -> Self {
        Self {
            engines: EngineTracker::new(),
            source: None,
        }
    }

    /// Every socket this factory opens is bound to `source`, which also
    /// limits it to the address family of `source`.
    pub fn bound_to(source: IpAddr) -> Self {
        Self {
            engines: EngineTracker::new(),
            source: Some(source),
        }
    }

    pub fn source_address(&self) -> Option<IpAddr> {
        self.source
    }
}

impl Default for RawSocketEngineFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl PingEngineFactory for RawSocketEngineFactory {
    fn id(&self) -> &str {
        "raw-socket"
    }

    fn description(&self) -> &str {
        "ICMP echo over raw sockets"
    }

    fn priority(&self) -> f64 {
        1.0
    }

    fn available(&self) -> bool {
        self.supports(IpVersion::V4) || self.supports(IpVersion::V6)
    }

    fn supports(&self, version: IpVersion) -> bool {
        self.source.is_none_or(|source| version.matches(&source)) && check_raw_socket_privileges(version)
    }

    fn open_transport(&self, version: IpVersion) -> Result<Arc<dyn Transport>, EngineError> {
        let transport = RawSocketTransport::new(version).map_err(|e| EngineError::TransportInit(e.to_string()))?;

        match self.source {
            Some(source) if !version.matches(&source) => Err(EngineError::AddressFamily {
                expected: version,
                address: source,
            }),
            Some(source) => Ok(Arc::new(transport.with_source(source))),
            None => Ok(Arc::new(transport)),
        }
    }

    fn engines(&self) -> &EngineTracker {
        &self.engines
    }
}

#[cfg(windows)]
pub struct IcmpApiEngineFactory {
    engines: EngineTracker,
}

#[cfg(windows)]
impl IcmpApiEngineFactory {
    pub fn new() -> Self {
        Self {
            engines: EngineTracker::new(),
        }
    }
}

#[cfg(windows)]
impl PingEngineFactory for IcmpApiEngineFactory {
    fn id(&self) -> &str {
        "icmp-api"
    }

    fn description(&self) -> &str {
        "ICMP echo through the Windows ICMP helper API"
    }

    fn priority(&self) -> f64 {
        0.5
    }

    fn available(&self) -> bool {
        self.supports(IpVersion::V4) || self.supports(IpVersion::V6)
    }

    fn supports(&self, version: IpVersion) -> bool {
        crate::icmp::winapi::is_winapi_available(version)
    }

    fn open_transport(&self, version: IpVersion) -> Result<Arc<dyn Transport>, EngineError> {
        let transport = crate::icmp::winapi::IcmpApiTransport::new(version)
            .map_err(|e| EngineError::TransportInit(e.to_string()))?;
        Ok(Arc::new(transport))
    }

    fn engines(&self) -> &EngineTracker {
        &self.engines
    }
}
