//! Dahua discovery frame codec.
//!
//! Announcements arrive on UDP:5050 as a 32-byte binary header followed by
//! a JSON body. The header carries a fixed magic prefix and the payload
//! length twice; frames that fail any structural check are dropped without
//! comment, since the LAN also carries TLV-generation firmware chatter and
//! assorted broadcast noise this daemon has no business crashing on.

use std::net::Ipv4Addr;

use serde::Deserialize;

use crate::config::normalize_mac;

/// Total header size preceding the JSON payload.
pub const HEADER_LEN: usize = 32;

/// First header byte of the JSON-generation discovery framing.
const MAGIC: u8 = 0x20;

/// Protocol tag at header offset 4.
const TAG: &[u8; 4] = b"DHIP";

/// Offsets of the two (redundant) little-endian payload length fields.
const LEN_OFFSET_A: usize = 16;
const LEN_OFFSET_B: usize = 24;

/// Peer classification derived from the announced device type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    Nvr,
    Camera,
}

impl std::fmt::Display for PeerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerKind::Nvr => write!(f, "nvr"),
            PeerKind::Camera => write!(f, "camera"),
        }
    }
}

/// One parsed device announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub kind: PeerKind,
    pub device_type: String,
    pub mac: String,
    pub ip: Ipv4Addr,
    pub hostname: String,
    pub serial: String,
    pub version: String,
}

#[derive(Debug, Deserialize)]
struct Body {
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Params>,
}

#[derive(Debug, Deserialize)]
struct Params {
    #[serde(rename = "deviceInfo")]
    device_info: Option<DeviceInfo>,
}

#[derive(Debug, Deserialize)]
struct DeviceInfo {
    #[serde(rename = "DeviceType", default)]
    device_type: Option<String>,
    #[serde(rename = "MAC", default)]
    mac: Option<String>,
    #[serde(rename = "HostName", default)]
    host_name: Option<String>,
    #[serde(rename = "SerialNo", default)]
    serial_no: Option<String>,
    #[serde(rename = "Version", default)]
    version: Option<String>,
    #[serde(rename = "IPv4Address", default)]
    ipv4: Option<Ipv4Block>,
}

#[derive(Debug, Deserialize)]
struct Ipv4Block {
    #[serde(rename = "IP", default)]
    ip: Option<String>,
}

/// Parse one datagram. Returns `None` for anything that is not a complete,
/// well-formed JSON-generation announcement carrying at least MAC and IP.
pub fn parse_announcement(buf: &[u8]) -> Option<Announcement> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    if buf[0] != MAGIC || &buf[4..8] != TAG {
        return None;
    }
    let len_a = u32::from_le_bytes(buf[LEN_OFFSET_A..LEN_OFFSET_A + 4].try_into().ok()?) as usize;
    let len_b = u32::from_le_bytes(buf[LEN_OFFSET_B..LEN_OFFSET_B + 4].try_into().ok()?) as usize;
    if len_a != len_b || buf.len() != HEADER_LEN + len_a {
        return None;
    }

    let body: Body = serde_json::from_slice(&buf[HEADER_LEN..]).ok()?;
    if let Some(method) = body.method {
        if method != "client.notifyDevInfo" {
            return None;
        }
    }
    let info = body.params?.device_info?;

    let mac = normalize_mac(&info.mac?);
    let ip: Ipv4Addr = info.ipv4?.ip?.parse().ok()?;

    let device_type = info.device_type.unwrap_or_default();
    // NVRs say so explicitly; anything else on this LAN that announces
    // camera-only attributes is treated as a camera.
    let kind = if device_type.to_ascii_uppercase().contains("NVR") {
        PeerKind::Nvr
    } else {
        PeerKind::Camera
    };

    Some(Announcement {
        kind,
        device_type,
        mac,
        ip,
        hostname: info.host_name.unwrap_or_default(),
        serial: info.serial_no.unwrap_or_default(),
        version: info.version.unwrap_or_default(),
    })
}

/// Encode an announcement into the wire framing. The daemon never sends
/// these; this is the counterpart used by tests and by anyone replaying
/// captured traffic.
pub fn encode_announcement(ann: &Announcement) -> Vec<u8> {
    let body = serde_json::json!({
        "method": "client.notifyDevInfo",
        "params": {
            "deviceInfo": {
                "DeviceType": ann.device_type,
                "MAC": ann.mac,
                "HostName": ann.hostname,
                "SerialNo": ann.serial,
                "Version": ann.version,
                "IPv4Address": { "IP": ann.ip.to_string() },
            }
        }
    });
    let payload = serde_json::to_vec(&body).expect("announcement body serializes");

    let mut frame = vec![0u8; HEADER_LEN];
    frame[0] = MAGIC;
    frame[4..8].copy_from_slice(TAG);
    let len = (payload.len() as u32).to_le_bytes();
    frame[LEN_OFFSET_A..LEN_OFFSET_A + 4].copy_from_slice(&len);
    frame[LEN_OFFSET_B..LEN_OFFSET_B + 4].copy_from_slice(&len);
    frame.extend_from_slice(&payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nvr_announcement() -> Announcement {
        Announcement {
            kind: PeerKind::Nvr,
            device_type: "DHI-NVR5216-4KS2".to_string(),
            mac: "AA:BB:CC:DD:EE:01".to_string(),
            ip: Ipv4Addr::new(192, 168, 1, 2),
            hostname: "nvr".to_string(),
            serial: "9F03A7DPAG00011".to_string(),
            version: "4.001.0000000.1".to_string(),
        }
    }

    #[test]
    fn encode_parse_round_trip() {
        let ann = nvr_announcement();
        let frame = encode_announcement(&ann);
        let parsed = parse_announcement(&frame).unwrap();
        assert_eq!(parsed, ann);
    }

    #[test]
    fn camera_kind_from_device_type() {
        let mut ann = nvr_announcement();
        ann.kind = PeerKind::Camera;
        ann.device_type = "IPC-HDW2431T-AS".to_string();
        let parsed = parse_announcement(&encode_announcement(&ann)).unwrap();
        assert_eq!(parsed.kind, PeerKind::Camera);
    }

    #[test]
    fn missing_device_type_defaults_to_camera() {
        let body = serde_json::json!({
            "method": "client.notifyDevInfo",
            "params": { "deviceInfo": {
                "MAC": "aa:bb:cc:dd:ee:02",
                "IPv4Address": { "IP": "192.168.1.30" },
            }}
        });
        let frame = frame_with_body(&serde_json::to_vec(&body).unwrap());
        let parsed = parse_announcement(&frame).unwrap();
        assert_eq!(parsed.kind, PeerKind::Camera);
        assert_eq!(parsed.mac, "AA:BB:CC:DD:EE:02");
    }

    #[test]
    fn random_bytes_are_dropped() {
        assert_eq!(parse_announcement(&[]), None);
        assert_eq!(parse_announcement(&[0u8; 16]), None);
        assert_eq!(parse_announcement(&[0xffu8; 64]), None);
    }

    #[test]
    fn wrong_magic_is_dropped() {
        let mut frame = encode_announcement(&nvr_announcement());
        frame[0] = 0x21;
        assert_eq!(parse_announcement(&frame), None);
    }

    #[test]
    fn tlv_generation_tag_is_dropped() {
        let mut frame = encode_announcement(&nvr_announcement());
        frame[4..8].copy_from_slice(b"DHTV");
        assert_eq!(parse_announcement(&frame), None);
    }

    #[test]
    fn disagreeing_length_fields_are_dropped() {
        let mut frame = encode_announcement(&nvr_announcement());
        frame[LEN_OFFSET_B] ^= 0x01;
        assert_eq!(parse_announcement(&frame), None);
    }

    #[test]
    fn truncated_payload_is_dropped() {
        let mut frame = encode_announcement(&nvr_announcement());
        frame.truncate(frame.len() - 5);
        assert_eq!(parse_announcement(&frame), None);
    }

    #[test]
    fn malformed_json_is_dropped() {
        let frame = frame_with_body(b"{not json");
        assert_eq!(parse_announcement(&frame), None);
    }

    #[test]
    fn announcement_without_mac_is_dropped() {
        let body = serde_json::json!({
            "method": "client.notifyDevInfo",
            "params": { "deviceInfo": {
                "DeviceType": "IPC-HDW2431T-AS",
                "IPv4Address": { "IP": "192.168.1.30" },
            }}
        });
        let frame = frame_with_body(&serde_json::to_vec(&body).unwrap());
        assert_eq!(parse_announcement(&frame), None);
    }

    #[test]
    fn foreign_method_is_dropped() {
        let body = serde_json::json!({
            "method": "client.notifyLogUpload",
            "params": { "deviceInfo": {
                "MAC": "aa:bb:cc:dd:ee:03",
                "IPv4Address": { "IP": "192.168.1.31" },
            }}
        });
        let frame = frame_with_body(&serde_json::to_vec(&body).unwrap());
        assert_eq!(parse_announcement(&frame), None);
    }

    #[test]
    fn unknown_payload_fields_are_ignored() {
        let body = serde_json::json!({
            "method": "client.notifyDevInfo",
            "params": { "deviceInfo": {
                "DeviceType": "IPC-HDW2431T-AS",
                "MAC": "aa:bb:cc:dd:ee:04",
                "IPv4Address": { "IP": "192.168.1.32", "SubnetMask": "255.255.255.0" },
                "Vendor": "Dahua",
                "HttpPort": 80,
            }}
        });
        let frame = frame_with_body(&serde_json::to_vec(&body).unwrap());
        assert!(parse_announcement(&frame).is_some());
    }

    fn frame_with_body(payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; HEADER_LEN];
        frame[0] = MAGIC;
        frame[4..8].copy_from_slice(TAG);
        let len = (payload.len() as u32).to_le_bytes();
        frame[LEN_OFFSET_A..LEN_OFFSET_A + 4].copy_from_slice(&len);
        frame[LEN_OFFSET_B..LEN_OFFSET_B + 4].copy_from_slice(&len);
        frame.extend_from_slice(payload);
        frame
    }
}
