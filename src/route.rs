//! Hop-by-hop route discovery on top of single-shot probes.

use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::dns::{HostResolver, SystemResolver};
use crate::engine::{EngineError, PingEngineFactory, ResultCode};
use crate::icmp::IpVersion;

pub const MAX_ROUTE_HOPS: u8 = 64;
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct RouteHop {
    pub hop: u8,
    /// `None` when nothing answered at this TTL.
    pub address: Option<IpAddr>,
    pub code: ResultCode,
    pub round_trip: Duration,
}

/// Responders ordered by TTL, slot `i` holding hop `i + 1`.
///
/// Ends at the first hop that answered `Ok` or at [`MAX_ROUTE_HOPS`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Route {
    hops: Vec<RouteHop>,
}

impl Route {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, hop: RouteHop) {
        self.hops.push(hop);
    }

    pub fn hops(&self) -> &[RouteHop] {
        &self.hops
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn addresses(&self) -> Vec<Option<IpAddr>> {
        self.hops.iter().map(|hop| hop.address).collect()
    }

    pub fn reached_destination(&self) -> bool {
        self.hops.last().is_some_and(|hop| hop.code == ResultCode::Ok)
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for hop in &self.hops {
            match hop.address {
                Some(address) => writeln!(
                    f,
                    "{:>3}  {:>6}  {}",
                    hop.hop,
                    crate::utils::format_time(hop.round_trip),
                    address
                )?,
                None => writeln!(f, "{:>3}  {:>6}  Request timed out.", hop.hop, "*")?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    Idle,
    Resolving,
    Probing { hop: u8 },
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouteError {
    /// The host name did not resolve to any address of the wanted family.
    Resolution(String),
    Engine(EngineError),
}

impl std::fmt::Display for RouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteError::Resolution(host) => write!(f, "Failed to find address for {}", host),
            RouteError::Engine(e) => write!(f, "Ping engine unavailable: {}", e),
        }
    }
}

impl std::error::Error for RouteError {}

/// Final outcome of one discovery run.
#[derive(Debug, Clone)]
pub struct RouteEvent {
    pub host: String,
    pub destination: Option<IpAddr>,
    pub route: Route,
    pub error: Option<RouteError>,
}

/// Discovers the route to one host by probing TTL 1, 2, ... in turn.
///
/// A run publishes exactly one [`RouteEvent`], except when cancelled, in
/// which case it publishes nothing. The engine it borrows from the factory is
/// handed back on every way out.
pub struct RouteEngineWorker {
    host: String,
    version: IpVersion,
    factory: Arc<dyn PingEngineFactory>,
    resolver: Arc<dyn HostResolver>,
    events: mpsc::UnboundedSender<RouteEvent>,
    cancel: Arc<AtomicBool>,
    timeout: Duration,
    state: RouteState,
}

impl RouteEngineWorker {
    pub fn new(
        host: impl Into<String>,
        factory: Arc<dyn PingEngineFactory>,
        version: IpVersion,
        events: mpsc::UnboundedSender<RouteEvent>,
    ) -> Self {
        Self {
            host: host.into(),
            version,
            factory,
            resolver: Arc::new(SystemResolver),
            events,
            cancel: Arc::new(AtomicBool::new(false)),
            timeout: DEFAULT_DISCOVERY_TIMEOUT,
            state: RouteState::Idle,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Per-hop reply deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Setting the flag abandons the run before its next probe.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn state(&self) -> RouteState {
        self.state
    }

    fn transition(&mut self, next: RouteState) {
        log::debug!("Route to {}: {:?} -> {:?}", self.host, self.state, next);
        self.state = next;
    }

    fn publish(&self, destination: Option<IpAddr>, route: Route, error: Option<RouteError>) {
        let event = RouteEvent {
            host: self.host.clone(),
            destination,
            route,
            error,
        };

        if self.events.send(event).is_err() {
            log::debug!("Nobody is listening for the route to {}", self.host);
        }
    }

    /// Runs discovery to completion on the calling thread. A worker runs once;
    /// later calls return immediately.
    pub fn run(&mut self) {
        if self.state != RouteState::Idle {
            log::warn!("Route worker for {} has already run", self.host);
            return;
        }

        self.transition(RouteState::Resolving);

        let engine = match self.factory.create_engine(self.version) {
            Ok(engine) => engine,
            Err(e) => {
                log::error!("No {} engine for the route to {}: {}", self.version, self.host, e);
                self.transition(RouteState::Failed);
                self.publish(None, Route::new(), Some(RouteError::Engine(e)));
                return;
            }
        };

        let Some(destination) = self.resolver.resolve(&self.host, self.version).first().copied() else {
            log::error!("Failed to find address for {}.", self.host);
            self.factory.delete_engine(engine);
            self.transition(RouteState::Failed);
            self.publish(None, Route::new(), Some(RouteError::Resolution(self.host.clone())));
            return;
        };

        let mut route = Route::new();

        for hop in 1..=MAX_ROUTE_HOPS {
            if self.cancel.load(Ordering::SeqCst) {
                log::debug!("Route to {} cancelled before hop {}", self.host, hop);
                self.factory.delete_engine(engine);
                self.transition(RouteState::Cancelled);
                return;
            }

            self.transition(RouteState::Probing { hop });

            let (address, code, round_trip) = match engine.single_shot(destination, hop, self.timeout) {
                Ok(result) => {
                    let address = match result.code() {
                        ResultCode::Ok | ResultCode::TimeExceeded => result.responder(),
                        ResultCode::NoReply | ResultCode::Error => None,
                    };
                    (address, result.code(), result.round_trip())
                }
                Err(e) => {
                    log::warn!("Probe of hop {} towards {} failed: {}", hop, destination, e);
                    (None, ResultCode::Error, Duration::ZERO)
                }
            };

            route.push(RouteHop {
                hop,
                address,
                code,
                round_trip,
            });

            if code == ResultCode::Ok {
                break;
            }
        }

        log::info!(
            "Route to {} ({}) completed, total of {} hops.",
            self.host,
            destination,
            route.len()
        );

        self.factory.delete_engine(engine);
        self.transition(RouteState::Completed);
        self.publish(Some(destination), route, None);
    }

    /// Runs the worker on its own thread.
    pub fn spawn(mut self) -> io::Result<RouteWorkerHandle> {
        let cancel = self.cancel_flag();
        let thread = thread::Builder::new()
            .name(format!("route-{}", self.host))
            .spawn(move || self.run())?;

        Ok(RouteWorkerHandle {
            cancel,
            thread: Some(thread),
        })
    }
}

/// Owner of a spawned route worker. Dropping it cancels the run and waits for
/// the thread.
pub struct RouteWorkerHandle {
    cancel: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl RouteWorkerHandle {
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|thread| thread.is_finished())
    }

    /// Waits for the run to end. False if the worker panicked.
    pub fn join(mut self) -> bool {
        match self.thread.take() {
            Some(thread) => thread.join().is_ok(),
            None => true,
        }
    }
}

impl Drop for RouteWorkerHandle {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.cancel();
            if thread.join().is_err() {
                log::error!("Route worker thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Script, ScriptedFactory, ScriptedTransport, StaticResolver};

    fn address(text: &str) -> IpAddr {
        text.parse().unwrap()
    }

    fn worker(
        host: &str,
        factory: &Arc<ScriptedFactory>,
        resolver: StaticResolver,
    ) -> (RouteEngineWorker, mpsc::UnboundedReceiver<RouteEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = RouteEngineWorker::new(host, factory.clone(), IpVersion::V4, tx)
            .with_resolver(Arc::new(resolver))
            .with_timeout(Duration::from_millis(50));
        (worker, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<RouteEvent>) -> Vec<RouteEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_unresolvable_host() {
        let factory = Arc::new(ScriptedFactory::new("scripted", ScriptedTransport::new()));
        let (mut worker, mut rx) = worker("unreachable.invalid", &factory, StaticResolver::new());

        worker.run();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(events[0].route.is_empty());
        assert_eq!(events[0].destination, None);
        assert_eq!(
            events[0].error,
            Some(RouteError::Resolution("unreachable.invalid".to_string()))
        );
        assert_eq!(worker.state(), RouteState::Failed);
        assert!(factory.engines().is_empty());
        assert_eq!(factory.transport().calls(), 0);
    }

    #[test]
    fn test_single_hop_route() {
        let host_a = address("192.0.2.10");
        let transport = ScriptedTransport::new().on(host_a, Some(1), Script::reply(host_a));
        let factory = Arc::new(ScriptedFactory::new("scripted", transport));
        let (mut worker, mut rx) = worker("host-a", &factory, StaticResolver::new().with("host-a", &[host_a]));

        worker.run();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].destination, Some(host_a));
        assert_eq!(events[0].route.addresses(), vec![Some(host_a)]);
        assert!(events[0].route.reached_destination());
        assert!(events[0].error.is_none());
        assert_eq!(worker.state(), RouteState::Completed);
        assert!(factory.engines().is_empty());
    }

    #[test]
    fn test_three_hop_route() {
        let destination = address("198.51.100.20");
        let first = address("10.0.0.1");
        let second = address("10.0.1.1");
        let transport = ScriptedTransport::new()
            .on(destination, Some(1), Script::ttl_expired(first))
            .on(destination, Some(2), Script::ttl_expired(second))
            .on(destination, Some(3), Script::reply(destination));
        let factory = Arc::new(ScriptedFactory::new("scripted", transport));
        let (mut worker, mut rx) = worker(
            "example.test",
            &factory,
            StaticResolver::new().with("example.test", &[destination]),
        );

        worker.run();

        let event = drain(&mut rx).pop().unwrap();
        assert_eq!(
            event.route.addresses(),
            vec![Some(first), Some(second), Some(destination)]
        );
        let hops: Vec<u8> = event.route.hops().iter().map(|h| h.hop).collect();
        assert_eq!(hops, vec![1, 2, 3]);
        assert_eq!(
            factory.transport().requests(),
            vec![(destination, Some(1)), (destination, Some(2)), (destination, Some(3))]
        );
    }

    #[test]
    fn test_silent_hop_keeps_its_slot() {
        let destination = address("198.51.100.30");
        let first = address("10.0.0.1");
        let transport = ScriptedTransport::new()
            .on(destination, Some(1), Script::ttl_expired(first))
            .on(destination, Some(2), Script::timed_out())
            .on(destination, Some(3), Script::reply(destination));
        let factory = Arc::new(ScriptedFactory::new("scripted", transport));
        let (mut worker, mut rx) = worker(
            "gap.test",
            &factory,
            StaticResolver::new().with("gap.test", &[destination]),
        );

        worker.run();

        let event = drain(&mut rx).pop().unwrap();
        assert_eq!(event.route.len(), 3);
        assert_eq!(event.route.addresses(), vec![Some(first), None, Some(destination)]);
        assert_eq!(event.route.hops()[1].code, ResultCode::NoReply);
    }

    #[test]
    fn test_transport_error_does_not_abort() {
        let destination = address("198.51.100.40");
        let transport = ScriptedTransport::new()
            .on(destination, Some(1), Script::failed("send failed"))
            .on(destination, Some(2), Script::reply(destination));
        let factory = Arc::new(ScriptedFactory::new("scripted", transport));
        let (mut worker, mut rx) = worker(
            "flaky.test",
            &factory,
            StaticResolver::new().with("flaky.test", &[destination]),
        );

        worker.run();

        let event = drain(&mut rx).pop().unwrap();
        assert_eq!(event.route.addresses(), vec![None, Some(destination)]);
        assert_eq!(event.route.hops()[0].code, ResultCode::Error);
    }

    #[test]
    fn test_hop_limit_without_destination() {
        let destination = address("203.0.113.99");
        let factory = Arc::new(ScriptedFactory::new("scripted", ScriptedTransport::new()));
        let (mut worker, mut rx) = worker(
            "far.test",
            &factory,
            StaticResolver::new().with("far.test", &[destination]),
        );

        worker.run();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        let route = &events[0].route;
        assert_eq!(route.len(), usize::from(MAX_ROUTE_HOPS));
        assert!(route.addresses().iter().all(Option::is_none));
        assert!(!route.reached_destination());
        assert!(events[0].error.is_none());
        assert_eq!(events[0].destination, Some(destination));
    }

    #[test]
    fn test_ok_is_always_last() {
        let destination = address("198.51.100.50");
        let mut transport = ScriptedTransport::new();
        for ttl in 1..=4u8 {
            transport = transport.on(destination, Some(ttl), Script::ttl_expired(IpAddr::from([10, 0, ttl, 1])));
        }
        transport = transport
            .on(destination, Some(5), Script::reply(destination))
            .on(destination, Some(6), Script::reply(destination));
        let factory = Arc::new(ScriptedFactory::new("scripted", transport));
        let (mut worker, mut rx) = worker(
            "five.test",
            &factory,
            StaticResolver::new().with("five.test", &[destination]),
        );

        worker.run();

        let route = drain(&mut rx).pop().unwrap().route;
        assert!(route.len() <= usize::from(MAX_ROUTE_HOPS));
        let ok_positions: Vec<usize> = route
            .hops()
            .iter()
            .enumerate()
            .filter(|(_, hop)| hop.code == ResultCode::Ok)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(ok_positions, vec![route.len() - 1]);
        assert_eq!(route.len(), 5);
    }

    #[test]
    fn test_cancelled_run_publishes_nothing() {
        let destination = address("198.51.100.60");
        let factory = Arc::new(ScriptedFactory::new("scripted", ScriptedTransport::new()));
        let (mut worker, mut rx) = worker(
            "cancel.test",
            &factory,
            StaticResolver::new().with("cancel.test", &[destination]),
        );

        worker.cancel_flag().store(true, Ordering::SeqCst);
        worker.run();

        assert!(drain(&mut rx).is_empty());
        assert_eq!(worker.state(), RouteState::Cancelled);
        assert!(factory.engines().is_empty());
        assert_eq!(factory.transport().calls(), 0);
    }

    #[test]
    fn test_runs_only_once() {
        let host_a = address("192.0.2.10");
        let transport = ScriptedTransport::new().on(host_a, Some(1), Script::reply(host_a));
        let factory = Arc::new(ScriptedFactory::new("scripted", transport));
        let (mut worker, mut rx) = worker("host-a", &factory, StaticResolver::new().with("host-a", &[host_a]));

        worker.run();
        worker.run();

        assert_eq!(drain(&mut rx).len(), 1);
        assert_eq!(factory.transport().calls(), 1);
    }

    #[test]
    fn test_engine_failure_is_reported() {
        let factory = Arc::new(ScriptedFactory::new("broken", ScriptedTransport::new()).failing());
        let (mut worker, mut rx) = worker(
            "host-a",
            &factory,
            StaticResolver::new().with("host-a", &[address("192.0.2.10")]),
        );

        worker.run();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].error, Some(RouteError::Engine(EngineError::TransportInit(_)))));
        assert_eq!(worker.state(), RouteState::Failed);
    }

    #[test]
    fn test_spawned_worker_cancelled_between_hops() {
        let destination = address("198.51.100.70");
        let mut transport = ScriptedTransport::new();
        for ttl in 1..=MAX_ROUTE_HOPS {
            transport = transport.on(
                destination,
                Some(ttl),
                Script::timed_out().after(Duration::from_millis(40)),
            );
        }
        let factory = Arc::new(ScriptedFactory::new("scripted", transport));
        let (worker, mut rx) = worker(
            "slow.test",
            &factory,
            StaticResolver::new().with("slow.test", &[destination]),
        );

        let handle = worker.spawn().unwrap();
        thread::sleep(Duration::from_millis(100));
        handle.cancel();
        assert!(handle.join());

        assert!(drain(&mut rx).is_empty());
        assert!(factory.engines().is_empty());
        let probed = factory.transport().calls();
        assert!(probed >= 1 && probed < usize::from(MAX_ROUTE_HOPS));
    }

    #[test]
    fn test_spawned_worker_completes() {
        let host_a = address("192.0.2.10");
        let transport = ScriptedTransport::new().on(host_a, Some(1), Script::reply(host_a));
        let factory = Arc::new(ScriptedFactory::new("scripted", transport));
        let (worker, mut rx) = worker("host-a", &factory, StaticResolver::new().with("host-a", &[host_a]));

        let handle = worker.spawn().unwrap();
        let event = rx.blocking_recv().unwrap();
        assert!(handle.join());

        assert_eq!(event.route.addresses(), vec![Some(host_a)]);
        assert!(factory.engines().is_empty());
    }

    #[test]
    fn test_route_display() {
        let mut route = Route::new();
        route.push(RouteHop {
            hop: 1,
            address: Some(address("10.0.0.1")),
            code: ResultCode::TimeExceeded,
            round_trip: Duration::from_millis(3),
        });
        route.push(RouteHop {
            hop: 2,
            address: None,
            code: ResultCode::NoReply,
            round_trip: Duration::from_secs(1),
        });

        let rendered = route.to_string();
        assert!(rendered.contains("10.0.0.1"));
        assert!(rendered.contains("3ms"));
        assert!(rendered.contains("Request timed out."));
    }
}
