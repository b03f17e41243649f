use std::process;
use std::time::Duration;

/// Generate a random identifier for ICMP packets
pub fn generate_identifier() -> u16 {
    use rand::Rng;
    rand::thread_rng().gen_range(1..=u16::MAX)
}

/// Print error message and exit with error code
pub fn exit_with_error(message: &str, code: i32) -> ! {
    eprintln!("routeping: {}", message);
    process::exit(code);
}

/// Print warning message
pub fn print_warning(message: &str) {
    eprintln!("warning: {}", message);
}

/// Validate ping parameters
pub fn validate_ping_params(
    size: Option<u32>,
    count: Option<u32>,
    timeout: Option<u32>,
    ttl: Option<u32>,
) -> anyhow::Result<()> {
    if let Some(size) = size {
        if size > 65500 {
            return Err(anyhow::anyhow!("Packet size too large, the maximum is 65500 bytes"));
        }
    }

    if let Some(0) = count {
        return Err(anyhow::anyhow!("Count must be greater than 0"));
    }

    if let Some(0) = timeout {
        return Err(anyhow::anyhow!("Timeout must be greater than 0"));
    }

    if let Some(ttl) = ttl {
        if ttl == 0 || ttl > 255 {
            return Err(anyhow::anyhow!("TTL must be in the range 1-255"));
        }
    }

    Ok(())
}

/// Format a round trip time for display
pub fn format_time(elapsed: Duration) -> String {
    let ms = elapsed.as_secs_f64() * 1000.0;
    if ms < 1.0 {
        "<1ms".to_string()
    } else {
        format!("{:.0}ms", ms)
    }
}

/// Handle Ctrl+C signal for graceful shutdown
pub fn setup_signal_handler() -> tokio::sync::oneshot::Receiver<()> {
    let (tx, rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = tx.send(());
            }
            Err(e) => log::warn!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    rx
}
