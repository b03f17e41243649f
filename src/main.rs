use routeping::cli::{self, PingArgs};
use routeping::config::Settings;
use routeping::dns;
use routeping::engine::{EngineRegistry, PingEngineFactory};
use routeping::icmp::IpVersion;
use routeping::route::{RouteEngineWorker, MAX_ROUTE_HOPS};
use routeping::stats::PingStatistics;
use routeping::utils;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() {
    // Enable debug logging if RUST_LOG is set
    if std::env::var("RUST_LOG").is_ok() {
        env_logger::init();
    }

    let args = match cli::parse_args() {
        Ok(args) => args,
        Err(e) => {
            utils::exit_with_error(&format!("Invalid arguments: {}", e), 1);
        }
    };

    if let Err(e) = utils::validate_ping_params(args.size, args.count, args.timeout, args.ttl) {
        utils::exit_with_error(&e.to_string(), 1);
    }

    let settings_path = args.config.clone().or_else(Settings::default_path);
    let mut settings = match &settings_path {
        Some(path) => match Settings::load_from_file(path) {
            Ok(settings) => settings,
            Err(e) => utils::exit_with_error(&format!("{:#}", e), 1),
        },
        None => Settings::default(),
    };

    let registry = EngineRegistry::with_source_address(args.source_address);

    if args.list_engines {
        list_engines(&registry);
        return;
    }

    let Some(target) = args.target.clone().or_else(|| settings.default_host.clone()) else {
        utils::exit_with_error("No target host given and no default host saved", 1);
    };

    let version = args.ip_version().unwrap_or_else(|| {
        match (target.parse::<IpAddr>(), args.source_address) {
            (Ok(address), _) => IpVersion::of(&address),
            (Err(_), Some(source)) => IpVersion::of(&source),
            (Err(_), None) => settings.default_ip_version,
        }
    });

    let factory = match select_factory(&registry, &args, &settings, version) {
        Ok(factory) => factory,
        Err(e) => utils::exit_with_error(&e.to_string(), 1),
    };
    log::info!("Using ping engine '{}' for {}", factory.id(), version);

    if args.trace {
        trace(&target, &factory, version, &args).await;
    } else {
        ping(&target, &factory, version, &args, &mut settings).await;
    }

    if args.save_config {
        settings.default_host = Some(target);
        settings.default_ping_engine = Some(factory.id().to_string());
        settings.default_ip_version = version;
        if let Some(interval) = args.interval {
            settings.default_ping_interval = interval as f64 / 1000.0;
        }
        save_settings(&settings, settings_path);
    }

    let disposed = registry.shutdown();
    log::debug!("Disposed {} engines on exit", disposed);
}

fn list_engines(registry: &EngineRegistry) {
    println!("{:<12} {:>8}  {:<10} Description", "Engine", "Priority", "Available");
    for factory in registry.factories() {
        println!(
            "{:<12} {:>8.2}  {:<10} {}",
            factory.id(),
            factory.priority().clamp(0.0, 1.0),
            if factory.available() { "yes" } else { "no" },
            factory.description()
        );
    }
}

/// Explicit `--engine` first, then the saved default, then the registry's pick.
fn select_factory(
    registry: &EngineRegistry,
    args: &PingArgs,
    settings: &Settings,
    version: IpVersion,
) -> anyhow::Result<Arc<dyn PingEngineFactory>> {
    if let Some(id) = &args.engine {
        let factory = registry
            .find(id)
            .ok_or_else(|| anyhow::anyhow!("Unknown ping engine '{}'", id))?;
        if !factory.supports(version) || !factory.available() {
            return Err(anyhow::anyhow!("Ping engine '{}' is not available for {}", id, version));
        }
        return Ok(factory);
    }

    if let Some(id) = &settings.default_ping_engine {
        match registry.find(id) {
            Some(factory) if factory.supports(version) && factory.available() => return Ok(factory),
            _ => utils::print_warning(&format!("Saved ping engine '{}' is not available, choosing another", id)),
        }
    }

    registry.select(version).ok_or_else(|| {
        anyhow::anyhow!(
            "No ping engine is available for {}. Raw sockets usually need root or CAP_NET_RAW.",
            version
        )
    })
}

async fn trace(target: &str, factory: &Arc<dyn PingEngineFactory>, version: IpVersion, args: &PingArgs) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut worker = RouteEngineWorker::new(target, Arc::clone(factory), version, tx);
    if let Some(timeout) = args.timeout {
        worker = worker.with_timeout(Duration::from_millis(u64::from(timeout)));
    }

    println!("Tracing route to {} over a maximum of {} hops:\n", target, MAX_ROUTE_HOPS);

    let handle = match worker.spawn() {
        Ok(handle) => handle,
        Err(e) => utils::exit_with_error(&format!("Failed to start route discovery: {}", e), 1),
    };

    let mut shutdown_signal = utils::setup_signal_handler();

    tokio::select! {
        event = rx.recv() => match event {
            Some(event) => match event.error {
                Some(error) => eprintln!("{}", error),
                None => {
                    print!("{}", event.route);
                    if event.route.reached_destination() {
                        println!("\nTrace complete.");
                    } else {
                        println!("\nDestination not reached within {} hops.", MAX_ROUTE_HOPS);
                    }
                }
            },
            None => log::warn!("Route worker ended without a result"),
        },
        Ok(()) = &mut shutdown_signal => {
            handle.cancel();
            println!("Trace cancelled.");
        }
    }

    if let Err(e) = tokio::task::spawn_blocking(move || handle.join()).await {
        log::error!("Failed to join route worker: {}", e);
    }
}

async fn ping(
    target: &str,
    factory: &Arc<dyn PingEngineFactory>,
    version: IpVersion,
    args: &PingArgs,
    settings: &mut Settings,
) {
    let target_ip = match dns::resolve_hostname(target, version).await {
        Ok(ip) => ip,
        Err(e) => utils::exit_with_error(&format!("Cannot resolve host '{}': {}", target, e), 1),
    };

    let engine = match factory.create_engine(version) {
        Ok(engine) => engine,
        Err(e) => utils::exit_with_error(&format!("Cannot create ping engine: {}", e), 1),
    };

    match settings.engine_document(factory.id()) {
        Some(document) => {
            if let Err(e) = engine.load_configuration(document) {
                utils::print_warning(&format!("Ignoring saved engine configuration: {}", e));
            }
        }
        None => {
            engine.set_interval(settings.interval_ms());
        }
    }

    if let Some(interval) = args.interval {
        engine.set_interval(interval);
    }
    if let Some(timeout) = args.timeout {
        engine.set_timeout(u64::from(timeout));
    }
    if let Some(size) = args.size {
        engine.set_payload_size(size as usize);
    }

    let registered = match args.ttl {
        Some(ttl) => engine.add_target_with_ttl(target_ip, ttl as u8),
        None => engine.add_target(target_ip),
    };
    if let Err(e) = registered {
        utils::exit_with_error(&e.to_string(), 1);
    }

    let mut stats = PingStatistics::new();
    let mut events = engine.subscribe();
    let payload_size = engine.payload_size();

    println!("{}", stats.format_header(target, &target_ip.to_string(), payload_size));

    let mut shutdown_signal = utils::setup_signal_handler();

    if !engine.start() {
        utils::exit_with_error("Failed to start the ping engine", 1);
    }

    loop {
        tokio::select! {
            Ok(()) = &mut shutdown_signal => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                let result = event.result;
                stats.record(&result);

                // Reverse lookup if requested
                let resolved_name = match (args.resolve_addresses, result.responder()) {
                    (true, Some(source)) => dns::reverse_lookup(source).await,
                    _ => None,
                };

                println!("{}", stats.format_response(&result, payload_size, resolved_name.as_deref()));

                if args.count.is_some_and(|count| stats.packets_sent >= count) {
                    break;
                }
            }
        }
    }

    // Stopping joins the transmitter thread.
    let stopper = engine.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || stopper.stop()).await {
        log::error!("Failed to stop ping engine: {}", e);
    }

    if args.save_config {
        settings.store_engine_document(factory.id(), engine.save_configuration());
    }
    factory.delete_engine(engine);

    println!("{}", stats.format_summary(target));
}

fn save_settings(settings: &Settings, path: Option<PathBuf>) {
    let Some(path) = path else {
        utils::print_warning("No configuration directory, settings not saved");
        return;
    };

    match settings.save_to_file(&path) {
        Ok(()) => println!("Settings saved to {}", path.display()),
        Err(e) => utils::print_warning(&format!("{:#}", e)),
    }
}
