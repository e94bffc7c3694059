use clap::Parser;
use lib_sensornet::bus::{BusEndpoint, DEFAULT_MQTT_PORT};
use lib_sensornet::core::{Bounds, Metric, PlausibilityBounds};
use lib_sensornet::ingestors::SubscriptionConfig;
use lib_sensornet::monitors::ProbeConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "server_sensornet.conf";
pub const DEFAULT_TOPIC: &str = "Enviromental Sensors Network";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Environmental sensor network dashboard backend", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "SENSORNET_PORT", help = "HTTP port for the dashboard API.")]
    pub port: Option<u16>,

    #[clap(long, env = "SENSORNET_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "SENSORNET_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "SENSORNET_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "SENSORNET_BROKER_HOST", help = "MQTT broker host.")]
    pub broker_host: Option<String>,

    #[clap(long, env = "SENSORNET_BROKER_PORT", help = "MQTT broker port.")]
    pub broker_port: Option<u16>,

    #[clap(long, env = "SENSORNET_TOPIC", help = "Topic the sensor nodes publish on.")]
    pub topic: Option<String>,

    #[clap(long, env = "SENSORNET_CLIENT_ID", help = "MQTT client id of the long-lived subscription.")]
    pub client_id: Option<String>,

    #[clap(long, env = "SENSORNET_KEEP_ALIVE_SECONDS", help = "MQTT keep-alive of the subscription, in seconds.")]
    pub keep_alive_seconds: Option<u64>,

    #[clap(long, env = "SENSORNET_RECONNECT_BASE_DELAY_MS", help = "Base delay in milliseconds for subscription reconnect attempts.")]
    pub reconnect_base_delay_ms: Option<u64>,

    #[clap(long, env = "SENSORNET_RECONNECT_MAX_DELAY_MS", help = "Maximum delay in milliseconds for subscription reconnect attempts.")]
    pub reconnect_max_delay_ms: Option<u64>,

    #[clap(long, env = "SENSORNET_TARGET_ID", help = "Origin id of the home sensor shown on the charts.")]
    pub target_id: Option<String>,

    #[clap(long, env = "SENSORNET_GRAPH_CAPACITY", help = "Records kept for the home sensor charts.")]
    pub graph_capacity: Option<usize>,

    #[clap(long, env = "SENSORNET_LOG_CAPACITY", help = "Records kept in the network traffic log.")]
    pub log_capacity: Option<usize>,

    #[clap(long, env = "SENSORNET_TEMP_MAX_C", help = "Temperatures at or above this are dropped from the charts.")]
    pub temp_max_c: Option<f64>,

    #[clap(long, env = "SENSORNET_PROBE_TIMEOUT_MS", help = "Timeout in milliseconds for one liveness probe.")]
    pub probe_timeout_ms: Option<u64>,

    #[clap(long, env = "SENSORNET_PROBE_INTERVAL_SECONDS", help = "Interval in seconds between liveness probes.")]
    pub probe_interval_seconds: Option<u64>,

    #[clap(long, env = "SENSORNET_EXPORT_FILE_NAME", help = "File name offered for the CSV export.")]
    pub export_file_name: Option<String>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            broker_host: other.broker_host.or(self.broker_host),
            broker_port: other.broker_port.or(self.broker_port),
            topic: other.topic.or(self.topic),
            client_id: other.client_id.or(self.client_id),
            keep_alive_seconds: other.keep_alive_seconds.or(self.keep_alive_seconds),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
            target_id: other.target_id.or(self.target_id),
            graph_capacity: other.graph_capacity.or(self.graph_capacity),
            log_capacity: other.log_capacity.or(self.log_capacity),
            temp_max_c: other.temp_max_c.or(self.temp_max_c),
            probe_timeout_ms: other.probe_timeout_ms.or(self.probe_timeout_ms),
            probe_interval_seconds: other.probe_interval_seconds.or(self.probe_interval_seconds),
            export_file_name: other.export_file_name.or(self.export_file_name),
        }
    }

    fn defaults() -> Config {
        Config {
            port: Some(9003),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            broker_host: Some("broker.emqx.io".to_string()),
            broker_port: Some(DEFAULT_MQTT_PORT),
            topic: Some(DEFAULT_TOPIC.to_string()),
            client_id: Some("sensornet-dashboard".to_string()),
            keep_alive_seconds: Some(60),
            reconnect_base_delay_ms: Some(1000),
            reconnect_max_delay_ms: Some(60000),
            target_id: Some("A1".to_string()),
            graph_capacity: Some(100),
            log_capacity: Some(50),
            temp_max_c: Some(150.0),
            probe_timeout_ms: Some(2000),
            probe_interval_seconds: Some(5),
            export_file_name: Some("mis_datos_sensor.csv".to_string()),
            ..Default::default()
        }
    }
}

/// `./server_sensornet.conf`, or the per-user config directory copy when the
/// working directory has none.
fn default_config_path() -> PathBuf {
    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
    if local.exists() {
        return local;
    }
    match dirs::config_dir() {
        Some(dir) => {
            let user = dir.join("sensornet").join(DEFAULT_CONFIG_FILE);
            if user.exists() { user } else { local }
        }
        None => local,
    }
}

/// Layers defaults, the JSON file and CLI/env values (lowest to highest).
pub fn layer_config(cli_args: Config) -> Config {
    let config_file_path = cli_args.config_path.clone().unwrap_or_else(default_config_path);

    let mut current_config = Config::defaults();

    if config_file_path.exists() {
        match fs::read_to_string(&config_file_path) {
            Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
                Ok(file_config) => current_config = current_config.merge(file_config),
                Err(e) => log::warn!(
                    "Failed to parse config file {}: {}. Falling back to other sources.",
                    config_file_path.display(),
                    e
                ),
            },
            Err(e) => log::warn!(
                "Failed to read config file {}: {}. Falling back to other sources.",
                config_file_path.display(),
                e
            ),
        }
    } else {
        log::info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            config_file_path.display()
        );
    }

    current_config.merge(cli_args)
}

/// Reads `.env`, parses CLI/env and layers everything into `Settings`.
pub fn load_settings() -> Result<Settings, ConfigError> {
    let _ = dotenvy::dotenv();
    Settings::resolve(layer_config(Config::parse()))
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("missing configuration value `{0}`")]
    Missing(&'static str),
    #[error("invalid `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Fully resolved configuration. Nothing optional is left.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub endpoint: BusEndpoint,
    pub topic: String,
    pub client_id: String,
    pub keep_alive: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub target_id: String,
    pub graph_capacity: usize,
    pub log_capacity: usize,
    pub plausibility: PlausibilityBounds,
    pub probe_timeout: Duration,
    pub probe_interval: Duration,
    pub export_file_name: String,
}

fn required<T>(value: Option<T>, field: &'static str) -> Result<T, ConfigError> {
    value.ok_or(ConfigError::Missing(field))
}

fn non_empty(value: String, field: &'static str) -> Result<String, ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::Invalid {
            field,
            reason: "must not be empty".to_string(),
        });
    }
    Ok(trimmed.to_string())
}

impl Settings {
    pub fn resolve(config: Config) -> Result<Settings, ConfigError> {
        let keep_alive_seconds = required(config.keep_alive_seconds, "keepAliveSeconds")?;
        if keep_alive_seconds < 5 {
            return Err(ConfigError::Invalid {
                field: "keepAliveSeconds",
                reason: format!("{} is below the 5 second minimum", keep_alive_seconds),
            });
        }

        let temp_max_c = required(config.temp_max_c, "tempMaxC")?;
        if !temp_max_c.is_finite() {
            return Err(ConfigError::Invalid {
                field: "tempMaxC",
                reason: "must be a finite number".to_string(),
            });
        }

        let probe_interval_seconds = required(config.probe_interval_seconds, "probeIntervalSeconds")?;
        if probe_interval_seconds == 0 {
            return Err(ConfigError::Invalid {
                field: "probeIntervalSeconds",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Settings {
            port: required(config.port, "port")?,
            log_dir: required(config.log_dir, "logDir")?,
            log_level: required(config.log_level, "logLevel")?,
            endpoint: BusEndpoint::new(
                non_empty(required(config.broker_host, "brokerHost")?, "brokerHost")?,
                required(config.broker_port, "brokerPort")?,
            ),
            topic: non_empty(required(config.topic, "topic")?, "topic")?,
            client_id: non_empty(required(config.client_id, "clientId")?, "clientId")?,
            keep_alive: Duration::from_secs(keep_alive_seconds),
            reconnect_base: Duration::from_millis(required(config.reconnect_base_delay_ms, "reconnectBaseDelayMs")?),
            reconnect_max: Duration::from_millis(required(config.reconnect_max_delay_ms, "reconnectMaxDelayMs")?),
            target_id: non_empty(required(config.target_id, "targetId")?, "targetId")?,
            graph_capacity: required(config.graph_capacity, "graphCapacity")?,
            log_capacity: required(config.log_capacity, "logCapacity")?,
            plausibility: PlausibilityBounds::new().with(Metric::TempC, Bounds::below(temp_max_c)),
            probe_timeout: Duration::from_millis(required(config.probe_timeout_ms, "probeTimeoutMs")?),
            probe_interval: Duration::from_secs(probe_interval_seconds),
            export_file_name: non_empty(required(config.export_file_name, "exportFileName")?, "exportFileName")?,
        })
    }

    pub fn subscription(&self) -> SubscriptionConfig {
        let mut config = SubscriptionConfig::new(self.endpoint.clone(), self.topic.clone(), self.client_id.clone());
        config.keep_alive = self.keep_alive;
        config.reconnect_base = self.reconnect_base;
        config.reconnect_max = self.reconnect_max;
        config
    }

    pub fn probe(&self) -> ProbeConfig {
        let mut config = ProbeConfig::new(self.endpoint.clone(), self.client_id.clone());
        config.timeout = self.probe_timeout;
        config
    }
}
