//! # Sensor Simulator
//!
//! Stands in for an air-quality node so the dashboard pipeline can be
//! exercised without hardware. Publishes a CO/CO2 reading every interval on
//! the shared sensor network topic.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use lib_sensornet::bus::DEFAULT_MQTT_PORT;
use lib_sensornet::loggers::setup_logging;
use lib_sensornet::utils::day_of_year_stamp;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Simulated air-quality sensor node", long_about = None)]
struct Args {
    /// Broker host
    #[clap(long, env = "SENSORNET_BROKER_HOST", default_value = "broker.emqx.io")]
    host: String,

    /// Broker port
    #[clap(long, env = "SENSORNET_BROKER_PORT", default_value_t = DEFAULT_MQTT_PORT)]
    port: u16,

    /// Topic to publish on
    #[clap(long, env = "SENSORNET_TOPIC", default_value = "Enviromental Sensors Network")]
    topic: String,

    /// Origin id of the simulated node
    #[clap(long, default_value = "B2")]
    id: String,

    /// Location reported by the node
    #[clap(long, default_value = "Laboratorio Bio-Regenerativo")]
    location: String,

    /// Seconds between readings
    #[clap(short, long, default_value_t = 2)]
    interval_secs: u64,

    /// Stop after this many readings (0 = run until Ctrl-C)
    #[clap(long, default_value_t = 0)]
    count: u64,

    /// Directory for log files
    #[clap(long, default_value = "./logs")]
    log_dir: PathBuf,

    /// Logging level
    #[clap(long, default_value = "info")]
    log_level: String,
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// CO in ppm (0-5, 3 decimals) and CO2 in ppm (400-850, 2 decimals). One
/// reading in twenty gets a +200 ppm CO2 spike, as when a room fills up.
fn simulated_reading<R: Rng>(rng: &mut R) -> (f64, f64) {
    let co2: f64 = rng.random_range(400.0..850.0);
    let co: f64 = rng.random_range(0.0..5.0);
    let spike = if rng.random_bool(0.05) { 200.0 } else { 0.0 };
    (round_to(co, 3), round_to(co2 + spike, 2))
}

fn build_payload(id: &str, location: &str, now: DateTime<Utc>, co: f64, co2: f64) -> Value {
    json!({
        "ID": id,
        "Location": location,
        "Tiempo_UTC": day_of_year_stamp(now),
        "CO_ppm": co,
        "CO2_ppm": co2,
        "Status": "OK",
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_dir, &args.log_level, "sensor_sim").context("Failed to initialize logging")?;

    let client_id = format!("sensor_sim-{}-{}", args.id, std::process::id());
    let mut options = MqttOptions::new(client_id, args.host.clone(), args.port);
    options.set_keep_alive(Duration::from_secs(60));
    let (client, mut eventloop) = AsyncClient::new(options, 10);

    // The event loop must be polled for publishes to leave the process.
    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                log::warn!("MQTT connection error: {}. Retrying in 1s", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    log::info!("--- Simulating sensor {} ---", args.id);
    log::info!("Publishing to {}:{} -> '{}'", args.host, args.port, args.topic);

    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval_secs.max(1)));
    let mut sent = 0u64;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Simulation stopped.");
                break;
            }
            _ = ticker.tick() => {
                let (co, co2) = simulated_reading(&mut rand::rng());
                let payload = build_payload(&args.id, &args.location, Utc::now(), co, co2);

                match client.publish(args.topic.as_str(), QoS::AtMostOnce, false, payload.to_string()).await {
                    Ok(()) => log::info!("Sent [{}]: CO2={}ppm | CO={}ppm", args.id, co2, co),
                    Err(e) => log::error!("Failed to queue publish: {}", e),
                }

                sent += 1;
                if args.count > 0 && sent >= args.count {
                    // Give the event loop a moment to flush the last publish.
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    break;
                }
            }
        }
    }

    let _ = client.disconnect().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn readings_stay_in_range_and_precision() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1_000 {
            let (co, co2) = simulated_reading(&mut rng);
            assert!((0.0..=5.0).contains(&co));
            assert!((400.0..=1050.0).contains(&co2));
            assert_eq!(round_to(co, 3), co);
            assert_eq!(round_to(co2, 2), co2);
        }
    }

    #[test]
    fn payload_matches_the_wire_format() {
        let now = Utc.with_ymd_and_hms(2025, 2, 11, 13, 7, 55).unwrap();
        let payload = build_payload("B2", "Lab", now, 1.234, 612.5);
        assert_eq!(payload["ID"], "B2");
        assert_eq!(payload["Tiempo_UTC"], "2025-042-13:07:55");
        assert_eq!(payload["CO2_ppm"], 612.5);
        assert_eq!(payload["Status"], "OK");
    }
}
