use anyhow::{anyhow, Context, Result};
use chrono::Duration as ChronoDuration;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::accumulator::MeterSettings;

const MIN_SAMPLE_INTERVAL_SECONDS: u64 = 5;
const MAX_SAMPLE_INTERVAL_SECONDS: u64 = 300;

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
    pub client_id: String,
}

impl MqttConfig {
    fn from_url(raw: &str, topic_prefix: String, client_id: String) -> Result<Self> {
        let url = Url::parse(raw).context("invalid ENERGY_MQTT_URL")?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("ENERGY_MQTT_URL missing host"))?
            .to_string();
        let port = url.port().unwrap_or(1883);
        let username = env_optional("ENERGY_MQTT_USERNAME")
            .or_else(|| Some(url.username().to_string()).filter(|u| !u.is_empty()));
        let password =
            env_optional("ENERGY_MQTT_PASSWORD").or_else(|| url.password().map(str::to_string));
        Ok(Self {
            host,
            port,
            username,
            password,
            topic_prefix: topic_prefix.trim_end_matches('/').to_string(),
            client_id,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub storage_path: PathBuf,
    pub options_path: Option<PathBuf>,
    pub http_bind: String,
    pub mqtt: Option<MqttConfig>,
    pub timezone: Tz,
    pub history_retention: ChronoDuration,
    pub recorder_enabled: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let storage_path = PathBuf::from(env_string(
            "ENERGY_STORAGE_PATH",
            Some("./energy_sensor_generator.json".to_string()),
        )?);
        let options_path = env_optional("ENERGY_OPTIONS_PATH").map(PathBuf::from);
        let http_bind = env_string("ENERGY_HTTP_BIND", Some("127.0.0.1:9102".to_string()))?;

        let mqtt = match env_optional("ENERGY_MQTT_URL") {
            Some(raw) => {
                let topic_prefix =
                    env_string("ENERGY_MQTT_TOPIC_PREFIX", Some("homeassistant".to_string()))?;
                let client_id = env_string(
                    "ENERGY_MQTT_CLIENT_ID",
                    Some(format!("energy-accumulator-{}", std::process::id())),
                )?;
                Some(MqttConfig::from_url(&raw, topic_prefix, client_id)?)
            }
            None => None,
        };

        let timezone = resolve_timezone(env_optional("ENERGY_TIMEZONE").as_deref())?;
        let retention_hours = env_u64("ENERGY_HISTORY_RETENTION_HOURS", Some(24))?.max(1);
        let recorder_enabled = env_bool("ENERGY_RECORDER_ENABLED", true)?;

        Ok(Self {
            storage_path,
            options_path,
            http_bind,
            mqtt,
            timezone,
            history_retention: ChronoDuration::hours(retention_hours as i64),
            recorder_enabled,
        })
    }
}

/// Explicit IANA name, else the host zone, else UTC.
pub fn resolve_timezone(explicit: Option<&str>) -> Result<Tz> {
    if let Some(raw) = explicit {
        return raw
            .trim()
            .parse::<Tz>()
            .map_err(|err| anyhow!("invalid ENERGY_TIMEZONE {raw:?}: {err}"));
    }
    Ok(iana_time_zone::get_timezone()
        .ok()
        .and_then(|name| name.parse::<Tz>().ok())
        .unwrap_or(Tz::UTC))
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match env_optional(key) {
        Some(raw) => parse_bool(&raw).ok_or_else(|| anyhow!("invalid {key}: {raw:?}")),
        None => Ok(default),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// User-facing options document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccumulatorOptions {
    #[serde(default)]
    pub power_sensors: Vec<String>,
    #[serde(default = "default_sample_interval_seconds", alias = "sample_interval")]
    pub sample_interval_seconds: u64,
    #[serde(default = "default_true")]
    pub use_statistical_calculation: bool,
    #[serde(default = "default_true")]
    pub allow_point_sampling_fallback: bool,
    #[serde(default)]
    pub enable_point_sampling_backup: bool,
    #[serde(default = "default_true")]
    pub create_daily_sensors: bool,
    #[serde(default = "default_true")]
    pub create_monthly_sensors: bool,
    #[serde(default)]
    pub debug_logging: bool,
    #[serde(default = "default_max_plausible_power_watts")]
    pub max_plausible_power_watts: f64,
}

fn default_true() -> bool {
    true
}

fn default_sample_interval_seconds() -> u64 {
    60
}

fn default_max_plausible_power_watts() -> f64 {
    3000.0
}

impl Default for AccumulatorOptions {
    fn default() -> Self {
        Self {
            power_sensors: Vec::new(),
            sample_interval_seconds: default_sample_interval_seconds(),
            use_statistical_calculation: true,
            allow_point_sampling_fallback: true,
            enable_point_sampling_backup: false,
            create_daily_sensors: true,
            create_monthly_sensors: true,
            debug_logging: false,
            max_plausible_power_watts: default_max_plausible_power_watts(),
        }
    }
}

impl AccumulatorOptions {
    /// Reads the options document. Problems are returned as warnings because logging is not up
    /// yet when this runs; the affected values fall back to defaults.
    pub fn load(path: Option<&Path>) -> (Self, Vec<String>) {
        let mut warnings = Vec::new();
        let options = match path {
            None => Self::default(),
            Some(path) => match std::fs::read_to_string(path) {
                Ok(contents) => match serde_json::from_str::<Self>(&contents) {
                    Ok(options) => options,
                    Err(err) => {
                        warnings.push(format!(
                            "failed to parse options {}: {err}; using defaults",
                            path.display()
                        ));
                        Self::default()
                    }
                },
                Err(err) => {
                    warnings.push(format!(
                        "failed to read options {}: {err}; using defaults",
                        path.display()
                    ));
                    Self::default()
                }
            },
        };
        let options = options.normalized(&mut warnings);
        (options, warnings)
    }

    pub fn normalized(mut self, warnings: &mut Vec<String>) -> Self {
        let clamped = self
            .sample_interval_seconds
            .clamp(MIN_SAMPLE_INTERVAL_SECONDS, MAX_SAMPLE_INTERVAL_SECONDS);
        if clamped != self.sample_interval_seconds {
            warnings.push(format!(
                "sample_interval_seconds {} outside [{MIN_SAMPLE_INTERVAL_SECONDS}, {MAX_SAMPLE_INTERVAL_SECONDS}]; using {clamped}",
                self.sample_interval_seconds
            ));
            self.sample_interval_seconds = clamped;
        }
        if !(self.max_plausible_power_watts.is_finite() && self.max_plausible_power_watts > 0.0) {
            warnings.push(format!(
                "max_plausible_power_watts {} must be positive; using {}",
                self.max_plausible_power_watts,
                default_max_plausible_power_watts()
            ));
            self.max_plausible_power_watts = default_max_plausible_power_watts();
        }
        let mut seen = std::collections::HashSet::new();
        self.power_sensors = self
            .power_sensors
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty() && seen.insert(s.clone()))
            .collect();
        self
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_seconds)
    }

    pub fn meter_settings(&self) -> MeterSettings {
        MeterSettings {
            use_statistical: self.use_statistical_calculation,
            allow_point_sampling_fallback: self.allow_point_sampling_fallback,
            enable_point_sampling_backup: self.enable_point_sampling_backup,
            max_plausible_power_watts: self.max_plausible_power_watts,
            ..MeterSettings::default()
        }
    }

    /// Default `RUST_LOG` filter for this run.
    pub fn log_filter(&self) -> &'static str {
        if self.debug_logging {
            "info,energy_accumulator=debug"
        } else {
            "info,energy_accumulator=info"
        }
    }
}
