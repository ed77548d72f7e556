//! Runtime configuration: loaded once at startup, immutable afterwards.
//!
//! The daemon reads a TOML file (default `~/.config/twilightd.toml`) and
//! exits non-zero when it is missing or invalid. Nothing here is reloadable
//! at runtime; the deployment model is edit-and-restart.

use std::fmt;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::Deserialize;
use thiserror::Error;

use crate::schedule::parse_hms;

/// Configuration load/validation errors. All of these are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config file is not valid TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("latitude {0} out of range -90..=90")]
    LatitudeRange(f64),
    #[error("longitude {0} out of range -180..=180")]
    LongitudeRange(f64),
    #[error("unknown timezone '{0}', expected an IANA zone name (e.g. America/New_York)")]
    Timezone(String),
    #[error("cycle_time_of_day '{0}' is not HH:MM:SS")]
    CycleTime(String),
    #[error("no cameras configured")]
    NoCameras,
    #[error("camera '{0}': neither mac nor serial is set")]
    CameraIdentity(String),
    #[error("camera '{0}': mac '{1}' is not a valid AA:BB:CC:DD:EE:FF address")]
    CameraMac(String, String),
    #[error("duplicate camera id '{0}'")]
    DuplicateCamera(String),
}

/// One camera entry from the `[[cameras]]` table array.
#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// Stable identifier used in logs and for applied-state tracking.
    pub id: String,
    /// MAC address as announced on the LAN. Either this or `serial` must be set.
    #[serde(default)]
    pub mac: Option<String>,
    /// Device serial number, an alternative identity for fleets where the
    /// MAC is not known up front.
    #[serde(default)]
    pub serial: Option<String>,
    /// Address used when discovery has not seen the camera within its
    /// deadline. The cycle proceeds in degraded mode against this address.
    pub fallback_ip: Ipv4Addr,
    /// HTTP port of the camera's CGI surface.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    pub username: String,
    pub password: String,
}

fn default_http_port() -> u16 {
    80
}

impl CameraConfig {
    /// Normalized MAC (uppercase), if configured.
    pub fn mac_normalized(&self) -> Option<String> {
        self.mac.as_deref().map(normalize_mac)
    }
}

/// Uppercase a MAC string without reformatting separators.
pub fn normalize_mac(mac: &str) -> String {
    mac.to_ascii_uppercase()
}

fn valid_mac(mac: &str) -> bool {
    let octets: Vec<&str> = mac.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Raw file shape. Defaults are folded in before validation.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    latitude: f64,
    longitude: f64,
    timezone: String,
    cameras: Vec<CameraConfig>,
    #[serde(default)]
    listen_interfaces: Vec<Ipv4Addr>,
    #[serde(default = "default_sntp_refresh")]
    sntp_refresh_interval: u64,
    #[serde(default = "default_cycle_time")]
    cycle_time_of_day: String,
    #[serde(default = "default_log_level")]
    log_level: String,
}

fn default_sntp_refresh() -> u64 {
    6 * 3600
}

fn default_cycle_time() -> String {
    "00:30:00".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Validated, immutable runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub latitude: f64,
    pub longitude: f64,
    pub timezone: Tz,
    pub cameras: Vec<CameraConfig>,
    /// Empty means one wildcard socket on 0.0.0.0.
    pub listen_interfaces: Vec<Ipv4Addr>,
    pub sntp_refresh_interval: Duration,
    pub cycle_time_of_day: NaiveTime,
    pub log_level: String,
}

impl Config {
    /// Default config file location, `$XDG_CONFIG_HOME/twilightd.toml`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("twilightd.toml")
    }

    /// Read and validate a config file.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parse and validate config text.
    pub fn parse(text: &str) -> Result<Config, ConfigError> {
        let raw: ConfigFile = toml::from_str(text)?;

        if !(-90.0..=90.0).contains(&raw.latitude) {
            return Err(ConfigError::LatitudeRange(raw.latitude));
        }
        if !(-180.0..=180.0).contains(&raw.longitude) {
            return Err(ConfigError::LongitudeRange(raw.longitude));
        }
        let timezone: Tz = raw
            .timezone
            .parse()
            .map_err(|_| ConfigError::Timezone(raw.timezone.clone()))?;
        let cycle_time_of_day = parse_hms(&raw.cycle_time_of_day)
            .ok_or_else(|| ConfigError::CycleTime(raw.cycle_time_of_day.clone()))?;

        if raw.cameras.is_empty() {
            return Err(ConfigError::NoCameras);
        }
        let mut seen_ids = Vec::new();
        for cam in &raw.cameras {
            if cam.mac.is_none() && cam.serial.is_none() {
                return Err(ConfigError::CameraIdentity(cam.id.clone()));
            }
            if let Some(ref mac) = cam.mac {
                if !valid_mac(mac) {
                    return Err(ConfigError::CameraMac(cam.id.clone(), mac.clone()));
                }
            }
            if seen_ids.contains(&cam.id) {
                return Err(ConfigError::DuplicateCamera(cam.id.clone()));
            }
            seen_ids.push(cam.id.clone());
        }

        Ok(Config {
            latitude: raw.latitude,
            longitude: raw.longitude,
            timezone,
            cameras: raw.cameras,
            listen_interfaces: raw.listen_interfaces,
            sntp_refresh_interval: Duration::from_secs(raw.sntp_refresh_interval),
            cycle_time_of_day,
            log_level: raw.log_level,
        })
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "location {:.4},{:.4} ({}), cycle at {}, sntp refresh {}s",
            self.latitude,
            self.longitude,
            self.timezone,
            self.cycle_time_of_day,
            self.sntp_refresh_interval.as_secs()
        )?;
        for cam in &self.cameras {
            writeln!(
                f,
                "camera '{}': identity {}, fallback {}",
                cam.id,
                cam.mac
                    .as_deref()
                    .or(cam.serial.as_deref())
                    .unwrap_or("<none>"),
                cam.fallback_ip
            )?;
        }
        Ok(())
    }
}
