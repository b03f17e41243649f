//! Scripted stand-ins for transports, factories and resolvers.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::dns::HostResolver;
use crate::engine::{EngineError, EngineTracker, PingEngineFactory};
use crate::icmp::{EchoReply, EchoRequest, EchoStatus, IpVersion, Transport};

/// Canned answer for one (address, ttl) pair.
#[derive(Debug, Clone)]
pub struct Script {
    status: EchoStatus,
    responder: Option<IpAddr>,
    delay: Duration,
}

impl Script {
    pub fn reply(responder: IpAddr) -> Self {
        Self {
            status: EchoStatus::Reply,
            responder: Some(responder),
            delay: Duration::ZERO,
        }
    }

    pub fn ttl_expired(responder: IpAddr) -> Self {
        Self {
            status: EchoStatus::TtlExpired,
            responder: Some(responder),
            delay: Duration::ZERO,
        }
    }

    pub fn timed_out() -> Self {
        Self {
            status: EchoStatus::TimedOut,
            responder: None,
            delay: Duration::ZERO,
        }
    }

    pub fn failed(reason: &str) -> Self {
        Self {
            status: EchoStatus::Failed(reason.to_string()),
            responder: None,
            delay: Duration::ZERO,
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Transport answering from a script. Requests with no matching entry time
/// out immediately.
pub struct ScriptedTransport {
    version: IpVersion,
    scripts: HashMap<(IpAddr, Option<u8>), Script>,
    calls: AtomicUsize,
    requests: Mutex<Vec<(IpAddr, Option<u8>)>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::for_version(IpVersion::V4)
    }

    pub fn for_version(version: IpVersion) -> Self {
        Self {
            version,
            scripts: HashMap::new(),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// `ttl` of `None` matches any TTL not scripted explicitly.
    pub fn on(mut self, address: IpAddr, ttl: Option<u8>, script: Script) -> Self {
        self.scripts.insert((address, ttl), script);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<(IpAddr, Option<u8>)> {
        self.requests.lock().clone()
    }
}

impl Transport for ScriptedTransport {
    fn ip_version(&self) -> IpVersion {
        self.version
    }

    fn name(&self) -> &'static str {
        "scripted"
    }

    fn round_trip(&self, request: &EchoRequest) -> EchoReply {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push((request.address, request.ttl));

        let script = self
            .scripts
            .get(&(request.address, request.ttl))
            .or_else(|| self.scripts.get(&(request.address, None)))
            .cloned()
            .unwrap_or_else(Script::timed_out);

        if !script.delay.is_zero() {
            std::thread::sleep(script.delay);
        }

        EchoReply {
            status: script.status,
            responder: script.responder,
            elapsed: script.delay,
        }
    }
}

/// Factory handing out engines over one shared scripted transport.
pub struct ScriptedFactory {
    id: String,
    transport: Arc<ScriptedTransport>,
    priority: f64,
    available: AtomicBool,
    fail_init: bool,
    only: Option<IpVersion>,
    engines: EngineTracker,
}

impl ScriptedFactory {
    pub fn new(id: &str, transport: ScriptedTransport) -> Self {
        Self {
            id: id.to_string(),
            transport: Arc::new(transport),
            priority: 0.5,
            available: AtomicBool::new(true),
            fail_init: false,
            only: None,
            engines: EngineTracker::new(),
        }
    }

    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_init = true;
        self
    }

    pub fn supporting(mut self, version: IpVersion) -> Self {
        self.only = Some(version);
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn transport(&self) -> &ScriptedTransport {
        &self.transport
    }
}

impl PingEngineFactory for ScriptedFactory {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        "Scripted replies"
    }

    fn priority(&self) -> f64 {
        self.priority
    }

    fn available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn supports(&self, version: IpVersion) -> bool {
        self.only.is_none_or(|only| only == version)
    }

    fn open_transport(&self, _version: IpVersion) -> Result<Arc<dyn Transport>, EngineError> {
        if self.fail_init {
            return Err(EngineError::TransportInit("network subsystem unavailable".into()));
        }
        Ok(self.transport.clone())
    }

    fn engines(&self) -> &EngineTracker {
        &self.engines
    }
}

/// Resolver with a fixed name table.
#[derive(Default)]
pub struct StaticResolver {
    names: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, host: &str, addresses: &[IpAddr]) -> Self {
        self.names.insert(host.to_string(), addresses.to_vec());
        self
    }
}

impl HostResolver for StaticResolver {
    fn resolve(&self, host: &str, version: IpVersion) -> Vec<IpAddr> {
        self.names
            .get(host)
            .map(|addresses| addresses.iter().copied().filter(|a| version.matches(a)).collect())
            .unwrap_or_default()
    }
}
