use anyhow::{Context, Result};
use clap::Parser;
use lib_sensornet::bus::{BusEndpoint, DEFAULT_MQTT_PORT};
use lib_sensornet::loggers::setup_logging;
use lib_sensornet::monitors::{LivenessProber, ProbeConfig};
use std::path::PathBuf;
use std::time::Duration;

/// Watches the MQTT broker and logs when it goes down and comes back.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Broker host
    #[clap(long, env = "SENSORNET_BROKER_HOST", default_value = "broker.emqx.io")]
    host: String,

    /// Broker port
    #[clap(long, env = "SENSORNET_BROKER_PORT", default_value_t = DEFAULT_MQTT_PORT)]
    port: u16,

    /// Seconds between probes
    #[clap(short, long, default_value_t = 10)]
    interval_secs: u64,

    /// Probe timeout in milliseconds
    #[clap(long, default_value_t = 2000)]
    timeout_ms: u64,

    /// Directory for log files
    #[clap(long, default_value = "./logs")]
    log_dir: PathBuf,

    /// Logging level
    #[clap(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_dir, &args.log_level, "monitor_bus").context("Failed to initialize logging")?;

    let mut config = ProbeConfig::new(BusEndpoint::new(args.host, args.port), "monitor_bus");
    config.timeout = Duration::from_millis(args.timeout_ms);
    let prober = LivenessProber::new(config);
    let every = Duration::from_secs(args.interval_secs.max(1));

    log::info!("Monitoring {} every {:?}...", prober.endpoint(), every);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = async {
                prober.tick().await;
                tokio::time::sleep(every).await;
            } => {}
        }
    }

    let report = prober.report();
    log::info!(
        "Stopped after {} probes. Last state: {}",
        report.probes,
        report.status.map(|s| s.to_string()).unwrap_or_else(|| "unknown".to_string())
    );
    Ok(())
}
