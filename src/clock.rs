//! Corrected time, bootstrapped from the NVR over SNTPv4.
//!
//! The host's wall clock is untrusted (no RTC battery, no internet NTP),
//! so wall-clock reasoning runs on an anchor pair: the corrected UTC
//! instant learned from one SNTP exchange plus the monotonic instant at
//! which it was learned. `now()` extrapolates from the anchor with the
//! monotonic clock, which drifts far less than the VM-grade system clock
//! between six-hourly refreshes.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::discovery::{Discovery, PeerKind};

/// SNTP server port on the NVR.
pub const SNTP_PORT: u16 = 123;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: i64 = 2_208_988_800;

const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Responses slower than this are useless for offset estimation.
const MAX_ROUND_TRIP: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ClockError {
    #[error("sntp socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sntp exchange timed out")]
    Timeout,
    #[error("sntp response rejected: {0}")]
    SanityReject(&'static str),
}

impl ClockError {
    /// Every clock error is retriable; the prior anchor stays in effect.
    pub fn is_retriable(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy)]
struct Anchor {
    utc: DateTime<Utc>,
    mono: Instant,
    round_trip: Duration,
}

/// Cloneable handle to the process-wide corrected clock.
#[derive(Clone, Default)]
pub struct SharedClock {
    anchor: Arc<Mutex<Option<Anchor>>>,
}

impl SharedClock {
    pub fn new() -> SharedClock {
        SharedClock::default()
    }

    /// True once the first SNTP exchange has succeeded. Never reverts.
    pub fn is_valid(&self) -> bool {
        self.anchor.lock().expect("clock lock").is_some()
    }

    /// Corrected UTC now. Callers must have gated on `is_valid`.
    pub fn now(&self) -> DateTime<Utc> {
        self.try_now().expect("clock read before first synchronization")
    }

    /// Corrected UTC now, or `None` before the first synchronization.
    pub fn try_now(&self) -> Option<DateTime<Utc>> {
        let anchor = (*self.anchor.lock().expect("clock lock"))?;
        let elapsed = Instant::now().saturating_duration_since(anchor.mono);
        Some(anchor.utc + chrono::Duration::from_std(elapsed).expect("uptime fits"))
    }

    /// Round-trip of the exchange behind the current anchor.
    pub fn round_trip(&self) -> Option<Duration> {
        self.anchor.lock().expect("clock lock").map(|a| a.round_trip)
    }

    /// Anchor the clock without an exchange. Test scaffolding only.
    #[cfg(test)]
    pub(crate) fn force_anchor(&self, utc: DateTime<Utc>) {
        *self.anchor.lock().expect("clock lock") = Some(Anchor {
            utc,
            mono: Instant::now(),
            round_trip: Duration::ZERO,
        });
    }

    /// One SNTPv4 exchange against `server`. On success the anchor is
    /// replaced; on any failure the prior anchor is retained untouched.
    pub async fn synchronize(&self, server: SocketAddr) -> Result<(), ClockError> {
        self.synchronize_with_timeout(server, DEFAULT_EXCHANGE_TIMEOUT)
            .await
    }

    pub async fn synchronize_with_timeout(
        &self,
        server: SocketAddr,
        timeout: Duration,
    ) -> Result<(), ClockError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(server).await?;

        let t1 = Utc::now();
        let request = build_request(t1);
        socket.send(&request).await?;

        let mut buf = [0u8; 128];
        let len = tokio::time::timeout(timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| ClockError::Timeout)??;

        let t4 = Utc::now();
        let t4_mono = Instant::now();
        let (offset, round_trip) = evaluate_response(&request, &buf[..len], t4)?;

        let anchor = Anchor {
            utc: t4 + offset,
            mono: t4_mono,
            round_trip,
        };
        *self.anchor.lock().expect("clock lock") = Some(anchor);
        info!(
            offset_ms = offset.num_milliseconds(),
            round_trip_ms = round_trip.as_millis() as u64,
            %server,
            "clock synchronized"
        );
        Ok(())
    }
}

/// Periodic refresh against whichever NVR discovery currently knows.
/// A failed refresh logs and keeps the prior anchor.
pub async fn run_refresher(
    clock: SharedClock,
    discovery: Discovery,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(interval);
    tick.tick().await; // the startup sync already happened
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tick.tick() => {
                let Some(nvr) = discovery.snapshot(PeerKind::Nvr).into_iter().next() else {
                    warn!("sntp refresh skipped, no NVR in inventory");
                    continue;
                };
                let server = SocketAddr::from((nvr.ip, SNTP_PORT));
                match clock.synchronize(server).await {
                    Ok(()) => {}
                    Err(error) => warn!(%error, %server, "sntp refresh failed, keeping prior offset"),
                }
            }
        }
    }
}

/// 48-byte SNTPv4 client request: LI=0, VN=4, Mode=3, transmit timestamp
/// set to `t1` so the server's originate echo can be verified.
fn build_request(t1: DateTime<Utc>) -> [u8; 48] {
    let mut buf = [0u8; 48];
    buf[0] = 0x23; // LI 0 | VN 4 | Mode 3 (client)
    buf[40..48].copy_from_slice(&to_ntp_timestamp(t1));
    buf
}

/// Validate a response against its request and compute
/// `offset = ((T2-T1)+(T3-T4))/2` and the round trip.
fn evaluate_response(
    request: &[u8; 48],
    response: &[u8],
    t4: DateTime<Utc>,
) -> Result<(chrono::Duration, Duration), ClockError> {
    if response.len() < 48 {
        return Err(ClockError::SanityReject("short packet"));
    }
    if response[0] & 0x07 != 4 {
        return Err(ClockError::SanityReject("mode is not server"));
    }
    if response[1] == 0 {
        return Err(ClockError::SanityReject("kiss-of-death stratum 0"));
    }
    if response[24..32] != request[40..48] {
        return Err(ClockError::SanityReject("originate timestamp mismatch"));
    }

    let t1 = from_ntp_timestamp(&request[40..48])
        .ok_or(ClockError::SanityReject("zero transmit timestamp"))?;
    let t2 = from_ntp_timestamp(&response[32..40])
        .ok_or(ClockError::SanityReject("zero receive timestamp"))?;
    let t3 = from_ntp_timestamp(&response[40..48])
        .ok_or(ClockError::SanityReject("zero transmit timestamp"))?;

    let round_trip = (t4 - t1) - (t3 - t2);
    let round_trip = round_trip
        .to_std()
        .map_err(|_| ClockError::SanityReject("negative round trip"))?;
    if round_trip > MAX_ROUND_TRIP {
        return Err(ClockError::SanityReject("round trip over limit"));
    }

    let offset = ((t2 - t1) + (t3 - t4)) / 2;
    debug!(
        offset_ms = offset.num_milliseconds(),
        round_trip_ms = round_trip.as_millis() as u64,
        "sntp exchange evaluated"
    );
    Ok((offset, round_trip))
}

fn to_ntp_timestamp(dt: DateTime<Utc>) -> [u8; 8] {
    let secs = (dt.timestamp() + NTP_UNIX_OFFSET) as u64;
    let frac = (u64::from(dt.timestamp_subsec_nanos()) << 32) / 1_000_000_000;
    let mut out = [0u8; 8];
    out[0..4].copy_from_slice(&(secs as u32).to_be_bytes());
    out[4..8].copy_from_slice(&(frac as u32).to_be_bytes());
    out
}

fn from_ntp_timestamp(buf: &[u8]) -> Option<DateTime<Utc>> {
    let secs = u32::from_be_bytes(buf[0..4].try_into().ok()?);
    let frac = u32::from_be_bytes(buf[4..8].try_into().ok()?);
    if secs == 0 && frac == 0 {
        return None;
    }
    let unix = i64::from(secs) - NTP_UNIX_OFFSET;
    let nanos = (u64::from(frac) * 1_000_000_000) >> 32;
    Utc.timestamp_opt(unix, nanos as u32).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn utc(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    /// Craft a server response to `request` with the server's clock ahead
    /// of ours by `server_offset` and `processing` spent inside the server.
    fn server_response(
        request: &[u8; 48],
        t1: DateTime<Utc>,
        server_offset: ChronoDuration,
        one_way: ChronoDuration,
        processing: ChronoDuration,
    ) -> [u8; 48] {
        let t2 = t1 + one_way + server_offset;
        let t3 = t2 + processing;
        let mut buf = [0u8; 48];
        buf[0] = 0x24; // LI 0 | VN 4 | Mode 4 (server)
        buf[1] = 2; // stratum
        buf[24..32].copy_from_slice(&request[40..48]);
        buf[32..40].copy_from_slice(&to_ntp_timestamp(t2));
        buf[40..48].copy_from_slice(&to_ntp_timestamp(t3));
        buf
    }

    #[test]
    fn ntp_timestamp_round_trip() {
        let dt = Utc.timestamp_opt(1_718_928_000, 250_000_000).single().unwrap();
        let restored = from_ntp_timestamp(&to_ntp_timestamp(dt)).unwrap();
        let delta = (restored - dt).num_nanoseconds().unwrap().abs();
        assert!(delta < 2, "lost more than rounding: {}ns", delta);
    }

    #[test]
    fn offset_recovers_server_skew() {
        let t1 = utc(1_700_000_000);
        let request = build_request(t1);
        let skew = ChronoDuration::seconds(5);
        let one_way = ChronoDuration::milliseconds(10);
        let response = server_response(&request, t1, skew, one_way, ChronoDuration::milliseconds(1));
        // Symmetric path: T4 lands one_way after T3 minus the skew.
        let t4 = t1 + one_way + ChronoDuration::milliseconds(1) + one_way;

        let (offset, round_trip) = evaluate_response(&request, &response, t4).unwrap();
        assert!((offset - skew).num_milliseconds().abs() <= 1, "offset {:?}", offset);
        assert!(round_trip <= Duration::from_millis(25));
    }

    #[test]
    fn client_mode_response_is_rejected() {
        let t1 = utc(1_700_000_000);
        let request = build_request(t1);
        let mut response =
            server_response(&request, t1, ChronoDuration::zero(), ChronoDuration::milliseconds(5), ChronoDuration::zero());
        response[0] = 0x23; // mode 3
        let err = evaluate_response(&request, &response, t1 + ChronoDuration::milliseconds(10)).unwrap_err();
        assert!(matches!(err, ClockError::SanityReject("mode is not server")));
    }

    #[test]
    fn stratum_zero_is_rejected() {
        let t1 = utc(1_700_000_000);
        let request = build_request(t1);
        let mut response =
            server_response(&request, t1, ChronoDuration::zero(), ChronoDuration::milliseconds(5), ChronoDuration::zero());
        response[1] = 0;
        let err = evaluate_response(&request, &response, t1 + ChronoDuration::milliseconds(10)).unwrap_err();
        assert!(matches!(err, ClockError::SanityReject("kiss-of-death stratum 0")));
    }

    #[test]
    fn originate_mismatch_is_rejected() {
        let t1 = utc(1_700_000_000);
        let request = build_request(t1);
        let mut response =
            server_response(&request, t1, ChronoDuration::zero(), ChronoDuration::milliseconds(5), ChronoDuration::zero());
        response[31] ^= 0x01;
        let err = evaluate_response(&request, &response, t1 + ChronoDuration::milliseconds(10)).unwrap_err();
        assert!(matches!(err, ClockError::SanityReject("originate timestamp mismatch")));
    }

    #[test]
    fn excessive_round_trip_is_rejected() {
        let t1 = utc(1_700_000_000);
        let request = build_request(t1);
        let response =
            server_response(&request, t1, ChronoDuration::zero(), ChronoDuration::milliseconds(5), ChronoDuration::zero());
        // Response observed three seconds after transmit.
        let err = evaluate_response(&request, &response, t1 + ChronoDuration::seconds(3)).unwrap_err();
        assert!(matches!(err, ClockError::SanityReject("round trip over limit")));
    }

    #[test]
    fn short_packet_is_rejected() {
        let t1 = utc(1_700_000_000);
        let request = build_request(t1);
        let err = evaluate_response(&request, &[0u8; 20], t1).unwrap_err();
        assert!(matches!(err, ClockError::SanityReject("short packet")));
    }

    async fn spawn_fake_nvr(server_offset: ChronoDuration) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 128];
            loop {
                let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                if len < 48 {
                    continue;
                }
                let now = Utc::now() + server_offset;
                let mut response = [0u8; 48];
                response[0] = 0x24;
                response[1] = 2;
                response[24..32].copy_from_slice(&buf[40..48]);
                response[32..40].copy_from_slice(&to_ntp_timestamp(now));
                response[40..48].copy_from_slice(&to_ntp_timestamp(now));
                let _ = socket.send_to(&response, from).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn synchronize_anchors_corrected_time_within_round_trip_bound() {
        let skew = ChronoDuration::seconds(7);
        let server = spawn_fake_nvr(skew).await;

        let clock = SharedClock::new();
        assert!(!clock.is_valid());
        assert!(clock.try_now().is_none());

        clock.synchronize(server).await.unwrap();
        assert!(clock.is_valid());

        // Corrected time must track the server's clock to within half the
        // measured round trip, plus an allowance for the drift accrued
        // between the exchange and this read.
        let corrected = clock.now();
        let true_time = Utc::now() + skew;
        let round_trip = clock.round_trip().expect("anchored clock has a round trip");
        let drift_allowance = Duration::from_millis(100);
        let bound = round_trip / 2 + drift_allowance;
        let delta = (corrected - true_time).num_milliseconds().unsigned_abs();
        assert!(
            u128::from(delta) <= bound.as_millis(),
            "corrected time off by {}ms, bound {}ms",
            delta,
            bound.as_millis()
        );
    }

    #[tokio::test]
    async fn failed_refresh_keeps_prior_anchor() {
        let server = spawn_fake_nvr(ChronoDuration::seconds(3)).await;
        let clock = SharedClock::new();
        clock.synchronize(server).await.unwrap();
        let before = clock.now();

        // A server that never answers: bind and immediately drop the port.
        let dead = {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            socket.local_addr().unwrap()
        };
        let err = clock
            .synchronize_with_timeout(dead, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_retriable());
        assert!(clock.is_valid());
        let after = clock.now();
        assert!(after >= before, "anchor must survive a failed refresh");
    }
}
