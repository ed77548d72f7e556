//! Twilight-tracking daemon for Dahua camera fleets.
//!
//! Four subsystems under one control loop: passive discovery of LAN peers,
//! SNTP-anchored corrected time, a pure sun-event calculator, and a
//! per-camera HTTP applier that writes day/night profile schedules.

pub mod clock;
pub mod config;
pub mod dahua;
pub mod discovery;
pub mod orchestrator;
pub mod retry;
pub mod schedule;
pub mod solar;
