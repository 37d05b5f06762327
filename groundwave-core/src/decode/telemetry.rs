//! Telemetry parsing with protocol hinting, plus the static
//! callsign-to-satellite lookup used to identify transmitters.

use serde_json::{json, Value};

use crate::config::SatelliteInfo;

use super::ax25;

/// Result of a telemetry parse attempt. `frame` describes the link
/// layer, `data` whatever payload fields were recovered.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryResult {
    pub success: bool,
    pub parser: Option<String>,
    pub frame: Value,
    pub data: Value,
}

impl TelemetryResult {
    fn failed() -> Self {
        Self {
            success: false,
            parser: None,
            frame: Value::Null,
            data: Value::Null,
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "success": self.success,
            "parser": self.parser,
            "frame": self.frame,
            "data": self.data,
        })
    }
}

/// Parse packet bytes with a protocol hint derived from the framing
/// tag. Unknown or unparseable payloads fail soft: the packet is still
/// persisted and published, just without telemetry.
pub fn parse(packet: &[u8], protocol_hint: &str, sat_hint: Option<&str>) -> TelemetryResult {
    match protocol_hint {
        "ax25" => parse_ax25(packet, sat_hint),
        "csp" => parse_csp(packet),
        "ccsds" => parse_ccsds(packet),
        "proprietary" => parse_proprietary(packet),
        _ => parse_ax25(packet, sat_hint),
    }
}

fn parse_ax25(packet: &[u8], sat_hint: Option<&str>) -> TelemetryResult {
    match ax25::parse(packet) {
        Ok(frame) => {
            let info = String::from_utf8_lossy(&frame.payload).to_string();
            TelemetryResult {
                success: true,
                parser: Some("ax25".to_string()),
                frame: json!({
                    "source": frame.source,
                    "destination": frame.destination,
                    "control": frame.control,
                    "pid": frame.pid,
                }),
                data: json!({
                    "payload_hex": hex_string(&frame.payload),
                    "payload_length": frame.payload.len(),
                    "info": info,
                    "satellite_hint": sat_hint,
                }),
            }
        }
        Err(_) => TelemetryResult::failed(),
    }
}

/// CSP v1 header: 32 bits of priority/source/destination/ports/flags.
fn parse_csp(packet: &[u8]) -> TelemetryResult {
    if packet.len() < 4 {
        return TelemetryResult::failed();
    }
    let header = u32::from_be_bytes([packet[0], packet[1], packet[2], packet[3]]);
    let priority = (header >> 30) & 0x03;
    let source = (header >> 25) & 0x1F;
    let destination = (header >> 20) & 0x1F;
    let dest_port = (header >> 14) & 0x3F;
    let source_port = (header >> 8) & 0x3F;
    let flags = header & 0xFF;
    TelemetryResult {
        success: true,
        parser: Some("csp".to_string()),
        frame: json!({
            "priority": priority,
            "source": source,
            "destination": destination,
            "destination_port": dest_port,
            "source_port": source_port,
            "flags": flags,
        }),
        data: json!({
            "payload_hex": hex_string(&packet[4..]),
            "payload_length": packet.len() - 4,
        }),
    }
}

/// CCSDS space packet primary header, 6 bytes.
fn parse_ccsds(packet: &[u8]) -> TelemetryResult {
    if packet.len() < 6 {
        return TelemetryResult::failed();
    }
    let version = (packet[0] >> 5) & 0x07;
    let packet_type = (packet[0] >> 4) & 0x01;
    let apid = (((packet[0] & 0x07) as u16) << 8) | packet[1] as u16;
    let sequence_flags = (packet[2] >> 6) & 0x03;
    let sequence_count = (((packet[2] & 0x3F) as u16) << 8) | packet[3] as u16;
    let data_length = u16::from_be_bytes([packet[4], packet[5]]);
    TelemetryResult {
        success: true,
        parser: Some("ccsds".to_string()),
        frame: json!({
            "version": version,
            "type": packet_type,
            "apid": apid,
            "sequence_flags": sequence_flags,
            "sequence_count": sequence_count,
            "data_length": data_length,
        }),
        data: json!({
            "payload_hex": hex_string(&packet[6..]),
            "payload_length": packet.len() - 6,
        }),
    }
}

fn parse_proprietary(packet: &[u8]) -> TelemetryResult {
    TelemetryResult {
        success: !packet.is_empty(),
        parser: if packet.is_empty() {
            None
        } else {
            Some("raw".to_string())
        },
        frame: Value::Null,
        data: json!({
            "payload_hex": hex_string(packet),
            "payload_length": packet.len(),
        }),
    }
}

pub fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Seed table mapping AX.25 callsigns to satellites. Extended at
/// deploy time from the observation database.
const CALLSIGN_TABLE: &[(&str, u32, &str)] = &[
    ("LUSAT", 20442, "LUSAT (LO-19)"),
    ("DP0BEE", 35933, "BEESAT-1"),
    ("ON01FR", 42761, "UCLSat"),
    ("XW2A", 40903, "XW-2A (CAS-3A)"),
    ("CUBEBEL", 43666, "BSUSat-1"),
    ("EU1XX", 43666, "BSUSat-1"),
    ("US1GOD", 44909, "UzhNU-1"),
    ("DIWATA", 43678, "Diwata-2B"),
    ("SONATE", 59112, "SONATE-2"),
    ("GREENCUBE", 53106, "GreenCube (IO-117)"),
];

/// Look up the emitting satellite from a source callsign. Falls back
/// to stripping a single-digit `-N` SSID suffix and retrying.
pub fn identify_satellite(from_callsign: &str) -> Option<(SatelliteInfo, String)> {
    let exact = CALLSIGN_TABLE
        .iter()
        .find(|(call, _, _)| *call == from_callsign);
    if let Some(&(call, norad, name)) = exact {
        return Some((
            SatelliteInfo {
                norad_id: norad,
                name: name.to_string(),
            },
            call.to_string(),
        ));
    }

    if let Some((base, ssid)) = from_callsign.rsplit_once('-') {
        if ssid.len() == 1 && ssid.chars().all(|c| c.is_ascii_digit()) {
            if let Some(&(call, norad, name)) =
                CALLSIGN_TABLE.iter().find(|(c, _, _)| *c == base)
            {
                return Some((
                    SatelliteInfo {
                        norad_id: norad,
                        name: name.to_string(),
                    },
                    call.to_string(),
                ));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ax25_telemetry_parse() {
        let frame = ax25::build_ui_frame("LUSAT-1", "CQ", b"V=7.4 T=21C");
        let result = parse(&frame, "ax25", Some("LUSAT"));
        assert!(result.success);
        assert_eq!(result.parser.as_deref(), Some("ax25"));
        assert_eq!(result.frame["source"], "LUSAT-1");
        assert_eq!(result.data["info"], "V=7.4 T=21C");
    }

    #[test]
    fn test_csp_header_fields() {
        // priority 2, src 1, dst 10, dport 12, sport 33, flags 0
        let header: u32 = (2 << 30) | (1 << 25) | (10 << 20) | (12 << 14) | (33 << 8);
        let mut packet = header.to_be_bytes().to_vec();
        packet.extend_from_slice(&[0xAB, 0xCD]);
        let result = parse(&packet, "csp", None);
        assert!(result.success);
        assert_eq!(result.frame["source"], 1);
        assert_eq!(result.frame["destination"], 10);
        assert_eq!(result.frame["destination_port"], 12);
        assert_eq!(result.data["payload_hex"], "abcd");
    }

    #[test]
    fn test_ccsds_header_fields() {
        let packet = [0x08, 0x2A, 0xC0, 0x07, 0x00, 0x03, 0xDE, 0xAD, 0xBE, 0xEF];
        let result = parse(&packet, "ccsds", None);
        assert!(result.success);
        assert_eq!(result.frame["apid"], 42);
        assert_eq!(result.frame["sequence_count"], 7);
        assert_eq!(result.frame["data_length"], 3);
    }

    #[test]
    fn test_garbage_fails_soft() {
        let result = parse(&[0x01, 0x02], "ax25", None);
        assert!(!result.success);
        assert!(result.parser.is_none());
    }

    #[test]
    fn test_identify_satellite_exact_and_ssid() {
        let (sat, matched) = identify_satellite("LUSAT").unwrap();
        assert_eq!(sat.norad_id, 20442);
        assert_eq!(matched, "LUSAT");

        let (sat, matched) = identify_satellite("DP0BEE-1").unwrap();
        assert_eq!(sat.norad_id, 35933);
        assert_eq!(matched, "DP0BEE");

        assert!(identify_satellite("N0CALL").is_none());
        // Multi-digit SSIDs do not trigger the fallback.
        assert!(identify_satellite("LUSAT-10").is_none());
    }
}
