//! Typed client for the narrow slice of the Dahua CGI surface this daemon
//! touches: the `VideoInMode` image-profile group on `configManager.cgi`.
//!
//! Every write is bracketed by reads. The pre-read suppresses no-op writes
//! (cameras log and sometimes blip exposure on redundant config pushes);
//! the post-read catches firmware that answers OK and then quietly keeps
//! the old values.

mod digest;

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::NaiveTime;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info};

use crate::schedule::{format_hms, CameraTarget, FullProfile, ProfileMode};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(10);
const TOTAL_TIMEOUT: Duration = Duration::from_secs(20);

/// Configuration group holding the day/night profile schedule.
const PROFILE_GROUP: &str = "VideoInMode";

#[derive(Debug, Error)]
pub enum DahuaError {
    #[error("camera unreachable: {0}")]
    Unreachable(String),
    #[error("authentication failed (401 after digest challenge)")]
    AuthFailed,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("write rejected: readback of {key} returned '{actual}', wanted '{expected}'")]
    Rejected {
        key: String,
        expected: String,
        actual: String,
    },
    #[error("camera busy: {0}")]
    Busy(String),
}

impl DahuaError {
    /// Everything except a bad credential is worth retrying with backoff.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, DahuaError::AuthFailed)
    }
}

/// Outcome of an apply operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Values were written and confirmed by readback.
    Written,
    /// The camera already carried the target; no write was issued.
    AlreadyCurrent,
}

/// Blocking HTTP client for one camera. Cheap to clone; the orchestrator
/// guarantees requests to one camera never overlap.
#[derive(Clone)]
pub struct CameraClient {
    base: String,
    username: String,
    password: String,
    agent: ureq::Agent,
}

impl CameraClient {
    pub fn new(ip: Ipv4Addr, port: u16, username: &str, password: &str) -> CameraClient {
        Self::with_base(format!("http://{}:{}", ip, port), username, password)
    }

    /// Explicit base URL, used by tests to reach a fake camera on an
    /// ephemeral port.
    pub fn with_base(base: String, username: &str, password: &str) -> CameraClient {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(READ_TIMEOUT)
            .timeout(TOTAL_TIMEOUT)
            .build();
        CameraClient {
            base,
            username: username.to_string(),
            password: password.to_string(),
            agent,
        }
    }

    /// Read a configuration group as a flat key → value map, keys given
    /// without the `table.` prefix.
    pub fn get_config(&self, group: &str) -> Result<BTreeMap<String, String>, DahuaError> {
        let path = format!(
            "/cgi-bin/configManager.cgi?action=getConfig&name={}",
            group
        );
        let body = self.request(&path)?;
        let map = parse_config_lines(&body);
        if map.is_empty() {
            return Err(DahuaError::Protocol(format!(
                "no table lines in getConfig response for {}",
                group
            )));
        }
        Ok(map)
    }

    /// Place the camera in schedule mode with the given day window.
    pub fn set_schedule(
        &self,
        day_start: NaiveTime,
        day_end: NaiveTime,
    ) -> Result<Applied, DahuaError> {
        self.write_profile_group(&[
            (format!("{}[0].Mode", PROFILE_GROUP), "0".to_string()),
            (
                format!("{}[0].TimeSection[0][0]", PROFILE_GROUP),
                format!("1 {}-{}", format_hms(day_start), format_hms(day_end)),
            ),
        ])
    }

    /// Pin a single profile full-time.
    pub fn set_full_profile(&self, profile: FullProfile) -> Result<Applied, DahuaError> {
        let config = match profile {
            FullProfile::Day => "0",
            FullProfile::Night => "1",
        };
        self.write_profile_group(&[
            (format!("{}[0].Mode", PROFILE_GROUP), "1".to_string()),
            (format!("{}[0].Config[0]", PROFILE_GROUP), config.to_string()),
        ])
    }

    /// Apply a computed target.
    pub fn apply(&self, target: &CameraTarget) -> Result<Applied, DahuaError> {
        match target.mode {
            ProfileMode::Schedule { day_start, day_end } => self.set_schedule(day_start, day_end),
            ProfileMode::FullTime(profile) => self.set_full_profile(profile),
        }
    }

    fn write_profile_group(&self, desired: &[(String, String)]) -> Result<Applied, DahuaError> {
        let current = self.get_config(PROFILE_GROUP)?;
        if values_match(&current, desired) {
            debug!(base = %self.base, "profile group already current, skipping write");
            return Ok(Applied::AlreadyCurrent);
        }

        let mut path = String::from("/cgi-bin/configManager.cgi?action=setConfig");
        for (key, value) in desired {
            path.push('&');
            path.push_str(key);
            path.push('=');
            path.push_str(&encode_query_value(value));
        }
        let body = self.request(&path)?;
        if body.trim().to_ascii_lowercase().starts_with("error") {
            return Err(DahuaError::Busy(body.trim().to_string()));
        }

        // Some firmware answers OK and keeps the old values; trust only
        // the readback.
        let readback = self.get_config(PROFILE_GROUP)?;
        for (key, expected) in desired {
            let actual = readback.get(key).cloned().unwrap_or_default();
            if !value_matches(key, expected, &actual) {
                return Err(DahuaError::Rejected {
                    key: key.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        info!(base = %self.base, "profile group written and confirmed");
        Ok(Applied::Written)
    }

    /// One GET with at most one digest challenge round.
    fn request(&self, path: &str) -> Result<String, DahuaError> {
        let url = format!("{}{}", self.base, path);
        match self.agent.get(&url).call() {
            Ok(response) => read_body(response),
            Err(ureq::Error::Status(401, response)) => {
                let header = response
                    .header("WWW-Authenticate")
                    .ok_or_else(|| DahuaError::Protocol("401 without challenge".to_string()))?;
                let challenge = digest::parse_challenge(header).ok_or_else(|| {
                    DahuaError::Protocol(format!("unparseable challenge: {}", header))
                })?;

                let mut rng = rand::thread_rng();
                let cnonce = format!("{:08x}{:08x}", rng.gen::<u32>(), rng.gen::<u32>());
                let auth = digest::authorization(
                    &challenge,
                    &self.username,
                    &self.password,
                    "GET",
                    path,
                    &cnonce,
                );
                match self.agent.get(&url).set("Authorization", &auth).call() {
                    Ok(response) => read_body(response),
                    Err(ureq::Error::Status(401, _)) => Err(DahuaError::AuthFailed),
                    Err(error) => Err(map_ureq_error(error)),
                }
            }
            Err(error) => Err(map_ureq_error(error)),
        }
    }
}

fn read_body(response: ureq::Response) -> Result<String, DahuaError> {
    response
        .into_string()
        .map_err(|e| DahuaError::Protocol(format!("unreadable body: {}", e)))
}

fn map_ureq_error(error: ureq::Error) -> DahuaError {
    match error {
        ureq::Error::Status(code, _) if (500..600).contains(&code) => {
            DahuaError::Busy(format!("HTTP {}", code))
        }
        ureq::Error::Status(code, _) => DahuaError::Protocol(format!("unexpected HTTP {}", code)),
        ureq::Error::Transport(transport) => DahuaError::Unreachable(transport.to_string()),
    }
}

/// Parse `table.Group[0].Key=value` response lines into a map keyed
/// without the `table.` prefix. Anything that is not such a line is noise
/// and skipped.
fn parse_config_lines(body: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for line in body.lines() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix("table.") else {
            continue;
        };
        let Some((key, value)) = rest.split_once('=') else {
            continue;
        };
        map.insert(key.to_string(), value.to_string());
    }
    map
}

fn values_match(current: &BTreeMap<String, String>, desired: &[(String, String)]) -> bool {
    desired
        .iter()
        .all(|(key, expected)| match current.get(key) {
            Some(actual) => value_matches(key, expected, actual),
            None => false,
        })
}

/// Times compare byte-exact; enum-ish fields tolerate firmware case drift.
fn value_matches(key: &str, expected: &str, actual: &str) -> bool {
    if key.contains("TimeSection") {
        expected == actual
    } else {
        expected.eq_ignore_ascii_case(actual)
    }
}

/// The only byte needing escape in the values we send is the space inside
/// a TimeSection row.
fn encode_query_value(value: &str) -> String {
    value.replace(' ', "%20")
}
