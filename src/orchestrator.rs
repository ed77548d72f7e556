//! The daily reconcile loop.
//!
//! Readiness is gated in order: an NVR must be discovered before SNTP can
//! run, and the clock must be valid before any civil-date reasoning or
//! camera HTTP happens. After that the orchestrator runs one cycle per
//! civil date, fanning out one worker task per camera, and sleeps until
//! shortly after the next local midnight. All sleeps are monotonic; only
//! the wake instant is computed in corrected time.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, LocalResult, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{self, SharedClock, SNTP_PORT};
use crate::config::{CameraConfig, Config};
use crate::dahua::{Applied, CameraClient, DahuaError};
use crate::discovery::{Discovery, Peer, PeerKind};
use crate::retry::{retry, BackoffPolicy, RetryError};
use crate::schedule::CameraTarget;
use crate::solar::{self, SunVerdict};

/// How long a cycle waits for a camera to show up in discovery before
/// falling back to its configured address.
const CAMERA_DISCOVERY_DEADLINE: Duration = Duration::from_secs(300);

/// Readiness polls back off exponentially up to this cap.
const READINESS_BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Consecutive-failure counts that get a prominent log line.
fn is_failure_threshold(count: u32) -> bool {
    matches!(count, 3 | 10 | 100)
}

/// How the last attempt for a camera ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Applied,
    AlreadyCurrent,
    AuthFailed,
    Failed,
}

/// Per-camera bookkeeping, in memory only.
#[derive(Debug, Clone, Default)]
pub struct AppliedState {
    pub last_applied: Option<CameraTarget>,
    pub last_attempt: Option<Instant>,
    pub last_outcome: Option<CycleOutcome>,
    pub consecutive_failures: u32,
}

/// Single-writer controller over the whole daemon.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<Config>,
    discovery: Discovery,
    clock: SharedClock,
    cancel: CancellationToken,
    trigger: Arc<Notify>,
    applied: Arc<Mutex<HashMap<String, AppliedState>>>,
    apply_policy: BackoffPolicy,
    camera_deadline: Duration,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        discovery: Discovery,
        clock: SharedClock,
        cancel: CancellationToken,
    ) -> Orchestrator {
        Orchestrator {
            config,
            discovery,
            clock,
            cancel,
            trigger: Arc::new(Notify::new()),
            applied: Arc::new(Mutex::new(HashMap::new())),
            apply_policy: BackoffPolicy::default(),
            camera_deadline: CAMERA_DISCOVERY_DEADLINE,
        }
    }

    /// Handle that wakes the sleeping main loop early (wired to SIGHUP).
    pub fn manual_trigger(&self) -> Arc<Notify> {
        self.trigger.clone()
    }

    /// Shrink the per-camera apply backoff. Used by tests and `--once` runs
    /// that should not sit in ten-minute backoffs.
    pub fn with_apply_policy(mut self, policy: BackoffPolicy) -> Orchestrator {
        self.apply_policy = policy;
        self
    }

    pub fn with_camera_deadline(mut self, deadline: Duration) -> Orchestrator {
        self.camera_deadline = deadline;
        self
    }

    /// Bookkeeping snapshot for one camera.
    pub fn applied_state(&self, camera_id: &str) -> Option<AppliedState> {
        self.applied
            .lock()
            .expect("applied lock")
            .get(camera_id)
            .cloned()
    }

    /// Full lifecycle: gate readiness, then cycle until cancelled (or once).
    pub async fn run(&self, once: bool) {
        if self.wait_for_nvr().await.is_none() {
            return;
        }
        if !self.initial_clock_sync().await {
            return;
        }
        tokio::spawn(clock::run_refresher(
            self.clock.clone(),
            self.discovery.clone(),
            self.config.sntp_refresh_interval,
            self.cancel.clone(),
        ));

        loop {
            self.run_cycle().await;
            if once || !self.sleep_until_next_cycle().await {
                return;
            }
        }
    }

    /// Block until discovery knows at least one NVR. One log line per
    /// backoff tick so a dead LAN is visible without being noisy.
    async fn wait_for_nvr(&self) -> Option<Peer> {
        let mut delay = Duration::from_secs(1);
        loop {
            if let Some(nvr) = self.discovery.snapshot(PeerKind::Nvr).into_iter().next() {
                info!(ip = %nvr.ip, mac = %nvr.mac, "NVR present");
                return Some(nvr);
            }
            info!(retry_in_s = delay.as_secs(), "waiting for an NVR announcement");
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(READINESS_BACKOFF_CAP);
        }
    }

    /// Synchronize the clock against the discovered NVR, backing off until
    /// it works. Returns false only on cancellation.
    async fn initial_clock_sync(&self) -> bool {
        let mut delay = Duration::from_secs(1);
        loop {
            if let Some(nvr) = self.discovery.snapshot(PeerKind::Nvr).into_iter().next() {
                let server = SocketAddr::from((nvr.ip, SNTP_PORT));
                match self.clock.synchronize(server).await {
                    Ok(()) => return true,
                    Err(error) => {
                        warn!(%error, %server, retry_in_s = delay.as_secs(), "initial clock sync failed")
                    }
                }
            } else {
                warn!("NVR vanished before clock sync, waiting for re-announcement");
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(READINESS_BACKOFF_CAP);
        }
    }

    /// One reconcile pass over every configured camera.
    pub async fn run_cycle(&self) {
        self.refresh_clock_best_effort().await;

        let tz = self.config.timezone;
        let today = self.clock.now().with_timezone(&tz).date_naive();
        let events = match solar::sun_events(today, self.config.latitude, self.config.longitude, tz)
        {
            Ok(events) => events,
            Err(error) => {
                // Only unrepresentable coordinates land here, and those are
                // validated at startup.
                error!(%error, "sun event computation failed, skipping cycle");
                return;
            }
        };
        match events.verdict {
            SunVerdict::Normal => info!(
                date = %today,
                sunrise = %events.sunrise.expect("normal").format("%H:%M:%S"),
                sunset = %events.sunset.expect("normal").format("%H:%M:%S"),
                "sun events computed"
            ),
            verdict => info!(date = %today, %verdict, "no horizon crossing today"),
        }
        let target = CameraTarget::from_sun_events(&events);

        let mut workers = JoinSet::new();
        for camera in self.config.cameras.clone() {
            let orchestrator = self.clone();
            workers.spawn(async move { orchestrator.reconcile_camera(camera, target).await });
        }
        while workers.join_next().await.is_some() {}
        info!(date = %today, "cycle complete");
    }

    /// A stale offset right before civil-date math is the one thing worth
    /// an extra exchange; failure just keeps the prior anchor.
    async fn refresh_clock_best_effort(&self) {
        let Some(nvr) = self.discovery.snapshot(PeerKind::Nvr).into_iter().next() else {
            warn!("pre-cycle sntp refresh skipped, no NVR in inventory");
            return;
        };
        let server = SocketAddr::from((nvr.ip, SNTP_PORT));
        if let Err(error) = self.clock.synchronize(server).await {
            warn!(%error, %server, "pre-cycle sntp refresh failed, keeping prior offset");
        }
    }

    async fn reconcile_camera(&self, camera: CameraConfig, target: CameraTarget) {
        let peer = self
            .discovery
            .wait_for(
                PeerKind::Camera,
                |p| camera_matches(&camera, p),
                self.camera_deadline,
            )
            .await;
        if self.cancel.is_cancelled() {
            return;
        }
        let (ip, degraded) = match peer {
            Some(peer) => (peer.ip, false),
            None => {
                warn!(
                    camera = %camera.id,
                    fallback = %camera.fallback_ip,
                    "camera not discovered within deadline, using configured address"
                );
                (camera.fallback_ip, true)
            }
        };

        let client = CameraClient::new(ip, camera.http_port, &camera.username, &camera.password);
        let camera_id = camera.id.clone();
        let result = retry(
            |attempt| {
                let client = client.clone();
                let camera_id = camera_id.clone();
                async move {
                    debug!(camera = %camera_id, attempt, "applying target");
                    tokio::task::spawn_blocking(move || client.apply(&target))
                        .await
                        .expect("apply task panicked")
                }
            },
            DahuaError::is_retriable,
            &self.apply_policy,
            |delay| tokio::time::sleep(delay),
            &self.cancel,
        )
        .await;

        match result {
            Ok(applied) => {
                let outcome = match applied {
                    Applied::Written => CycleOutcome::Applied,
                    Applied::AlreadyCurrent => CycleOutcome::AlreadyCurrent,
                };
                info!(camera = %camera.id, %target, degraded, ?applied, "camera reconciled");
                self.record_success(&camera.id, target, outcome);
            }
            Err(RetryError::Permanent(error)) => {
                error!(camera = %camera.id, %error, "credentials rejected, skipping until next cycle");
                self.record_failure(&camera.id, CycleOutcome::AuthFailed, &error);
            }
            Err(RetryError::Exhausted(error)) => {
                self.record_failure(&camera.id, CycleOutcome::Failed, &error);
            }
            Err(RetryError::Cancelled) => {
                debug!(camera = %camera.id, "apply cancelled");
            }
        }
    }

    fn record_success(&self, camera_id: &str, target: CameraTarget, outcome: CycleOutcome) {
        let mut applied = self.applied.lock().expect("applied lock");
        let state = applied.entry(camera_id.to_string()).or_default();
        if state.consecutive_failures > 0 {
            info!(
                camera = camera_id,
                after_failures = state.consecutive_failures,
                "camera recovered"
            );
        }
        state.last_applied = Some(target);
        state.last_attempt = Some(Instant::now());
        state.last_outcome = Some(outcome);
        state.consecutive_failures = 0;
    }

    fn record_failure(&self, camera_id: &str, outcome: CycleOutcome, error: &DahuaError) {
        let mut applied = self.applied.lock().expect("applied lock");
        let state = applied.entry(camera_id.to_string()).or_default();
        state.last_attempt = Some(Instant::now());
        state.last_outcome = Some(outcome);
        state.consecutive_failures += 1;
        if is_failure_threshold(state.consecutive_failures) {
            warn!(
                camera = camera_id,
                consecutive = state.consecutive_failures,
                %error,
                "camera keeps failing"
            );
        } else {
            debug!(
                camera = camera_id,
                consecutive = state.consecutive_failures,
                %error,
                "camera apply failed"
            );
        }
    }

    /// Sleep until the configured wake time on the next civil date, as a
    /// monotonic duration computed from corrected time. Returns false on
    /// cancellation; manual triggers end the sleep early.
    async fn sleep_until_next_cycle(&self) -> bool {
        let now = self.clock.now();
        let wake = next_cycle_utc(now, self.config.timezone, self.config.cycle_time_of_day);
        let wait = (wake - now).to_std().unwrap_or(Duration::ZERO);
        info!(
            wake = %wake.with_timezone(&self.config.timezone).format("%Y-%m-%d %H:%M:%S %Z"),
            "sleeping until next cycle"
        );
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(wait) => true,
            _ = self.trigger.notified() => {
                info!("manual trigger, waking early");
                true
            }
        }
    }
}

/// Does a discovered peer carry this camera's configured identity?
fn camera_matches(camera: &CameraConfig, peer: &Peer) -> bool {
    if let Some(mac) = camera.mac_normalized() {
        if peer.mac == mac {
            return true;
        }
    }
    if let Some(ref serial) = camera.serial {
        if !serial.is_empty() && peer.serial.eq_ignore_ascii_case(serial) {
            return true;
        }
    }
    false
}

/// The corrected-time instant of `time_of_day` on the civil date after the
/// one containing `now`. A wake time erased by a DST gap slides forward an
/// hour until it exists.
fn next_cycle_utc(now: DateTime<Utc>, tz: Tz, time_of_day: NaiveTime) -> DateTime<Utc> {
    let next_date = now.with_timezone(&tz).date_naive() + chrono::Duration::days(1);
    let mut candidate = next_date.and_time(time_of_day);
    loop {
        match tz.from_local_datetime(&candidate) {
            LocalResult::Single(dt) => return dt.with_timezone(&Utc),
            LocalResult::Ambiguous(first, _) => return first.with_timezone(&Utc),
            LocalResult::None => candidate += chrono::Duration::hours(1),
        }
    }
}
