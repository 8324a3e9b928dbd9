use crate::config::Config;
use crate::controller::BackendStatus;
use serde_json::json;

/// Packet id used for both the login-disconnect (TEXT) and status-response (INFO) packets.
const PACKET_ID: u8 = 0x00;

/// Framing constant for TEXT messages (login disconnect / loadscreen text).
const TEXT_FRAMING_CONSTANT: i32 = 0;
/// Framing constant for INFO messages; reserves header room for the (possibly large) favicon.
const INFO_FRAMING_CONSTANT: i32 = 11264;

/// Number of bytes needed to hold `value` under the little-endian base-255 length scheme:
/// the smallest `n` with `255^n >= value`. Clamped to at least 1 (`value <= 0` has no valid
/// base-255 digit count but is never a real length).
fn base255_byte_count(value: i64) -> usize {
    if value <= 0 {
        return 1;
    }
    ((value as f64).ln() / 255f64.ln()).ceil().max(1.0) as usize
}

/// Writes `value` as a little-endian length header in the fewest bytes `base255_byte_count`
/// says it needs. This is not a Minecraft VarInt: there is no continuation bit, so it only
/// round-trips for a reader that already knows (or can derive) the byte count.
fn write_base255_length(value: i64, out: &mut Vec<u8>) {
    let byte_num = base255_byte_count(value);
    let bytes = value.to_le_bytes();
    out.extend_from_slice(&bytes[..byte_num]);
}

/// Frames `payload` as `header1 | header2 | header3 | payload`: `header3` is the base-255
/// length of `payload.len() + constant`, `header2` is the single packet-id byte, and `header1`
/// is the base-255 length of everything that follows it (`header2` + `header3` + `payload`),
/// plus the same `constant` again.
fn frame(payload: &[u8], constant: i32) -> Vec<u8> {
    let mut header3_and_payload = Vec::new();
    write_base255_length(payload.len() as i64 + constant as i64, &mut header3_and_payload);
    header3_and_payload.extend_from_slice(payload);

    let mut body = Vec::with_capacity(header3_and_payload.len() + 1);
    body.push(PACKET_ID);
    body.extend_from_slice(&header3_and_payload);

    let mut packet = Vec::new();
    write_base255_length(body.len() as i64 + constant as i64, &mut packet);
    packet.extend_from_slice(&body);
    packet
}

/// Builds the TEXT (login-disconnect) packet shown on the client's loadscreen while the
/// backend is `STARTING`, referencing the controller's live countdown.
pub fn build_text_message(config: &Config, status: BackendStatus, time_until_up: u32) -> Vec<u8> {
    let body = match status {
        BackendStatus::Offline => format!(
            "Server start command issued. Please wait... Time left: {} seconds",
            time_until_up
        ),
        _ => format!(
            "Server is starting. Please wait. Time left: {} seconds",
            time_until_up
        ),
    };
    let json_msg = json!({
        "text": body,
        "color": config.connection_msg_color,
        "bold": config.connection_msg_bold
    })
    .to_string();
    frame(json_msg.as_bytes(), TEXT_FRAMING_CONSTANT)
}

/// Adapts a raw description string for embedding in INFO JSON: newlines become the
/// legacy-formatting center-pad sequence and `&` becomes the Minecraft color escape `0xA7`.
fn adapt_description(text: &str) -> String {
    let with_newlines = text.replace('\n', "&r\\n");
    let mut adapted = String::with_capacity(with_newlines.len());
    for ch in with_newlines.chars() {
        if ch == '&' {
            adapted.push('\u{A7}');
        } else {
            adapted.push(ch);
        }
    }
    adapted
}

/// Builds the INFO (server-list ping) packet advertising the backend as hibernating or
/// warming up, with the configured favicon and the given version/protocol (the caller
/// supplies either the configured defaults or a pair learned from a live handshake).
pub fn build_info_message(
    config: &Config,
    status: BackendStatus,
    version_name: &str,
    protocol: i32,
) -> Vec<u8> {
    let label = match status {
        BackendStatus::Starting => "WARMING UP",
        _ => "HIBERNATING",
    };
    let description = adapt_description(&format!("{}\n{}", config.motd_text, label));

    let mut value = json!({
        "description": { "text": description },
        "version": {
            "name": version_name,
            "protocol": protocol
        }
    });
    if let Some(icon) = &config.server_icon {
        if let serde_json::Value::Object(ref mut map) = value {
            map.insert(
                "favicon".to_string(),
                serde_json::Value::String(format!("data:image/png;base64,{icon}")),
            );
        }
    }

    frame(value.to_string().as_bytes(), INFO_FRAMING_CONSTANT)
}

/// Scans the first server-to-client buffer for `serverVersion`/`serverProtocol`, returning
/// them if found. Deliberately a string search rather than JSON parsing, matching the
/// narrow protocol awareness the bridging path is allowed (see Non-goals).
pub fn learn_version_protocol(buf: &[u8]) -> Option<(String, i32)> {
    let text = String::from_utf8_lossy(buf);
    let name_marker = "\"version\":{\"name\":\"";
    let protocol_marker = ",\"protocol\":";

    let name_start = text.find(name_marker)? + name_marker.len();
    let name_end = text[name_start..].find('"')? + name_start;
    let name = text[name_start..name_end].to_string();

    let protocol_start = text.find(protocol_marker)? + protocol_marker.len();
    let rest = &text[protocol_start..];
    let protocol_end = rest.find('}')?;
    let protocol: i32 = rest[..protocol_end].trim().parse().ok()?;

    Some((name, protocol))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Inverse of `write_base255_length`: the byte count isn't carried on the wire, so this
    /// searches for the `n` whose little-endian `n`-byte value is self-consistent with the
    /// number of bytes remaining after it (`value == remaining_len + constant`).
    fn read_base255_length(buf: &[u8], constant: i32) -> (i64, usize) {
        for byte_num in 1..=8usize.min(buf.len()) {
            let mut arr = [0u8; 8];
            arr[..byte_num].copy_from_slice(&buf[..byte_num]);
            let value = i64::from_le_bytes(arr);
            let remaining = (buf.len() - byte_num) as i64;
            if remaining == value - constant as i64 {
                return (value, byte_num);
            }
        }
        panic!("no self-consistent base-255 length found");
    }

    fn decode_frame(packet: &[u8], constant: i32) -> (u8, Vec<u8>) {
        let (_len1, off1) = read_base255_length(packet, constant);
        let body = &packet[off1..];
        let packet_id = body[0];
        let (_len3, off3) = read_base255_length(&body[1..], constant);
        let payload = body[1 + off3..].to_vec();
        (packet_id, payload)
    }

    #[test]
    fn text_message_round_trips_and_contains_countdown() {
        let config = Config::default();
        let packet = build_text_message(&config, BackendStatus::Offline, 17);
        let (packet_id, payload) = decode_frame(&packet, TEXT_FRAMING_CONSTANT);
        assert_eq!(packet_id, 0x00);
        let msg = String::from_utf8(payload).unwrap();
        assert!(msg.contains("Server start command issued"));
        assert!(msg.contains("17"));
    }

    #[test]
    fn text_message_during_starting_differs_from_offline() {
        let config = Config::default();
        let starting = build_text_message(&config, BackendStatus::Starting, 5);
        let (_, payload) = decode_frame(&starting, TEXT_FRAMING_CONSTANT);
        let msg = String::from_utf8(payload).unwrap();
        assert!(msg.contains("Server is starting"));
    }

    #[test]
    fn info_message_round_trips_and_labels_status() {
        let config = Config::default();
        let packet = build_info_message(&config, BackendStatus::Offline, "mcnap", 766);
        let (packet_id, payload) = decode_frame(&packet, INFO_FRAMING_CONSTANT);
        assert_eq!(packet_id, 0x00);
        let msg = String::from_utf8(payload).unwrap();
        assert!(msg.contains("HIBERNATING"));

        let packet = build_info_message(&config, BackendStatus::Starting, "mcnap", 766);
        let (_, payload) = decode_frame(&packet, INFO_FRAMING_CONSTANT);
        let msg = String::from_utf8(payload).unwrap();
        assert!(msg.contains("WARMING UP"));
    }

    #[test]
    fn adapt_description_escapes_ampersand_and_newline() {
        let adapted = adapt_description("a&b\nc");
        assert_eq!(adapted, "a\u{A7}b&r\\nc");
    }

    #[test]
    fn learn_version_protocol_extracts_pair() {
        let buf = br#"{"description":{},"version":{"name":"1.20.5","protocol":766},"other":1}"#;
        let (name, protocol) = learn_version_protocol(buf).expect("should find version");
        assert_eq!(name, "1.20.5");
        assert_eq!(protocol, 766);
    }

    #[test]
    fn learn_version_protocol_none_when_absent() {
        let buf = b"not a status response";
        assert!(learn_version_protocol(buf).is_none());
    }
}
