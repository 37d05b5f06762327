//! AX.25 address-field handling: callsign extraction from received
//! frames and header construction for the loopback paths.

use crate::errors::DecodeError;

/// Callsigns recovered from an AX.25 header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Callsigns {
    pub from: String,
    pub to: String,
}

/// A parsed AX.25 UI header.
#[derive(Debug, Clone, PartialEq)]
pub struct Ax25Frame {
    pub destination: String,
    pub source: String,
    pub control: u8,
    pub pid: Option<u8>,
    pub payload: Vec<u8>,
}

fn decode_address(field: &[u8]) -> Result<(String, bool), DecodeError> {
    if field.len() < 7 {
        return Err(DecodeError::InvalidAddress);
    }
    let mut callsign = String::new();
    for &byte in &field[..6] {
        let ch = (byte >> 1) as char;
        if !ch.is_ascii() {
            return Err(DecodeError::InvalidAddress);
        }
        if ch != ' ' {
            callsign.push(ch);
        }
    }
    let ssid = (field[6] >> 1) & 0x0F;
    if ssid != 0 {
        callsign.push_str(&format!("-{ssid}"));
    }
    let last = field[6] & 0x01 != 0;
    Ok((callsign, last))
}

fn encode_address(callsign: &str, last: bool) -> [u8; 7] {
    let (base, ssid) = match callsign.split_once('-') {
        Some((base, ssid)) => (base, ssid.parse::<u8>().unwrap_or(0)),
        None => (callsign, 0),
    };
    let mut field = [b' ' << 1; 7];
    for (i, ch) in base.bytes().take(6).enumerate() {
        field[i] = ch.to_ascii_uppercase() << 1;
    }
    field[6] = 0x60 | ((ssid & 0x0F) << 1) | (last as u8);
    field
}

/// Parse an AX.25 frame (flags and FCS already removed). Digipeater
/// addresses are skipped; only destination and source matter here.
pub fn parse(frame: &[u8]) -> Result<Ax25Frame, DecodeError> {
    if frame.len() < 15 {
        return Err(DecodeError::FrameTooShort { len: frame.len() });
    }

    let (destination, _) = decode_address(&frame[0..7])?;
    let (source, mut last) = decode_address(&frame[7..14])?;

    // Skip digipeater addresses until the extension bit terminates the
    // address field.
    let mut offset = 14;
    while !last {
        if offset + 7 > frame.len() {
            return Err(DecodeError::InvalidAddress);
        }
        let (_, l) = decode_address(&frame[offset..offset + 7])?;
        last = l;
        offset += 7;
    }

    if offset >= frame.len() {
        return Err(DecodeError::FrameTooShort { len: frame.len() });
    }
    let control = frame[offset];
    offset += 1;

    // UI frames carry a PID; supervisory frames do not.
    let pid = if control & 0x03 == 0x03 && offset < frame.len() {
        let pid = frame[offset];
        offset += 1;
        Some(pid)
    } else {
        None
    };

    Ok(Ax25Frame {
        destination,
        source,
        control,
        pid,
        payload: frame[offset..].to_vec(),
    })
}

/// Callsign pair from a frame, if its header parses.
pub fn callsigns(frame: &[u8]) -> Option<Callsigns> {
    parse(frame).ok().map(|parsed| Callsigns {
        from: parsed.source,
        to: parsed.destination,
    })
}

/// Build an AX.25 UI frame (control 0x03, PID 0xF0) around a payload.
pub fn build_ui_frame(source: &str, destination: &str, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(16 + payload.len());
    frame.extend_from_slice(&encode_address(destination, false));
    frame.extend_from_slice(&encode_address(source, true));
    frame.push(0x03);
    frame.push(0xF0);
    frame.extend_from_slice(payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ui_frame_roundtrip() {
        let frame = build_ui_frame("LUSAT-1", "CQ", b"hello from orbit");
        let parsed = parse(&frame).unwrap();
        assert_eq!(parsed.source, "LUSAT-1");
        assert_eq!(parsed.destination, "CQ");
        assert_eq!(parsed.control, 0x03);
        assert_eq!(parsed.pid, Some(0xF0));
        assert_eq!(parsed.payload, b"hello from orbit");
    }

    #[test]
    fn test_callsigns_helper() {
        let frame = build_ui_frame("DP0BEE", "APRS", b"x");
        let calls = callsigns(&frame).unwrap();
        assert_eq!(calls.from, "DP0BEE");
        assert_eq!(calls.to, "APRS");
    }

    #[test]
    fn test_short_frame_rejected() {
        assert!(matches!(
            parse(&[0u8; 10]),
            Err(DecodeError::FrameTooShort { len: 10 })
        ));
    }

    #[test]
    fn test_ssid_zero_omitted() {
        let frame = build_ui_frame("NOCALL", "CQ", b"");
        let parsed = parse(&frame).unwrap();
        assert_eq!(parsed.source, "NOCALL");
    }
}
