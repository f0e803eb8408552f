mod accounting;
mod app;
mod collector;
mod data;
mod exporter;
#[cfg(test)]
mod fake;
mod identity;
mod monitor;

use clap::Parser;
use collector::{Collector, CollectorConfig};
use identity::{ProcFs, ProcessNameResolver};
use monitor::NvmlMonitor;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Prometheus exporter for NVIDIA GPUs and the pods using them.
#[derive(Parser, Debug)]
#[command(name = "rgm-exporter", version, about)]
struct Args {
    /// Address to listen on for web interface and telemetry.
    #[arg(long = "web.listen-address", default_value = ":9445")]
    listen_address: String,

    /// Path under which to expose metrics.
    #[arg(long = "web.telemetry-path", default_value = "/metrics", value_parser = parse_telemetry_path)]
    telemetry_path: String,

    /// Read fan speed until a device reports it as unsupported.
    #[arg(long = "collector.fan-speed", default_value_t = true, action = clap::ArgAction::Set)]
    fan_speed: bool,

    /// Collect per-process GPU usage and attribute it to pods.
    #[arg(long = "collector.processes", default_value_t = true, action = clap::ArgAction::Set)]
    processes: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors.
    #[arg(short, long)]
    quiet: bool,
}

fn parse_telemetry_path(s: &str) -> Result<String, String> {
    if !s.starts_with('/') {
        return Err(format!("telemetry path '{}' must start with '/'", s));
    }
    if s == "/" || s == "/snapshot" {
        return Err(format!("telemetry path '{}' is reserved", s));
    }
    Ok(s.to_string())
}

/// `:9445` means all interfaces, as is customary for exporters.
fn normalize_listen_address(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    info!("rgm-exporter {} starting", env!("CARGO_PKG_VERSION"));

    let monitor = match NvmlMonitor::init() {
        Ok(monitor) => monitor,
        Err(err) => {
            error!(
                "Couldn't initialize NVML: {}. Make sure NVML is in the shared library search path.",
                err
            );
            return Err(err.into());
        }
    };
    match monitor.driver_version() {
        Ok(version) => info!("Driver version: {}", version),
        Err(err) => error!("Driver version unavailable: {}", err),
    }

    let config = CollectorConfig {
        fan_speed: args.fan_speed,
        processes: args.processes,
    };
    info!(
        "Collectors: fan_speed={}, processes={}",
        config.fan_speed, config.processes
    );

    let collector = Arc::new(Collector::new(
        Box::new(monitor),
        Box::new(ProcessNameResolver::new(ProcFs::default())),
        config,
    ));
    let router = app::router(collector, &args.telemetry_path)?;

    // NVML is shut down when the collector, and with it the monitor, is dropped
    app::serve(&normalize_listen_address(&args.listen_address), router).await?;
    info!("Stopped");
    Ok(())
}
