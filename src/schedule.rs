//! Mapping from sun events to per-camera profile targets.
//!
//! Cameras switch profiles on their own once the schedule is written; the
//! daemon only decides, once per civil date, which mode each camera should
//! carry and what the day window is.

use chrono::NaiveTime;
use serde::Serialize;

use crate::solar::{SunEvents, SunVerdict};

/// Which full-time profile to pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FullProfile {
    Day,
    Night,
}

impl std::fmt::Display for FullProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FullProfile::Day => write!(f, "day"),
            FullProfile::Night => write!(f, "night"),
        }
    }
}

/// The profile mode a camera should be placed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProfileMode {
    /// Day profile between `day_start` and `day_end`, Night outside.
    Schedule {
        day_start: NaiveTime,
        day_end: NaiveTime,
    },
    /// One profile pinned at all times.
    FullTime(FullProfile),
}

/// The per-camera application target for one civil date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CameraTarget {
    pub mode: ProfileMode,
}

impl CameraTarget {
    /// Derive the target from the day's sun events.
    pub fn from_sun_events(events: &SunEvents) -> CameraTarget {
        let mode = match events.verdict {
            SunVerdict::Normal => ProfileMode::Schedule {
                // Normal verdict carries both times.
                day_start: events.sunrise.expect("normal verdict has sunrise"),
                day_end: events.sunset.expect("normal verdict has sunset"),
            },
            SunVerdict::PolarDay => ProfileMode::FullTime(FullProfile::Day),
            SunVerdict::PolarNight => ProfileMode::FullTime(FullProfile::Night),
        };
        CameraTarget { mode }
    }
}

impl std::fmt::Display for CameraTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.mode {
            ProfileMode::Schedule { day_start, day_end } => {
                write!(f, "schedule {}-{}", format_hms(day_start), format_hms(day_end))
            }
            ProfileMode::FullTime(profile) => write!(f, "full-time {}", profile),
        }
    }
}

/// Format a time-of-day as the cameras expect it: `HH:MM:SS`.
pub fn format_hms(time: NaiveTime) -> String {
    time.format("%H:%M:%S").to_string()
}

/// Parse `HH:MM:SS` back into a time-of-day.
pub fn parse_hms(text: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(text, "%H:%M:%S").ok()
}
