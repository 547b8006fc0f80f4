//! ELM327 reply parsing: raw prompt-terminated text into CAN frame bytes.
//!
//! Replies arrive as CR/LF-delimited frames, each `HEADER DATA...` with
//! space-separated hex. Multi-ECU requests (functional addressing to 7DF)
//! interleave frames from several responders; the numerically lowest CAN
//! arbitration ID identifies the primary responder, and its bytes are kept
//! separately as priority data.

use crate::cell::PROTOCOL_UNKNOWN;
use log::{debug, warn};

/// Extra data characters to skip after the header, per protocol number.
///
/// Indexed by protocol 0..=12; protocols outside this range fall back to
/// the header-text-length heuristic.
pub const PROTOCOL_EXTRA_OFFSET: [usize; 13] = [
    0, // 0: Automatic
    3, // 1: SAE J1850 PWM (41.6 kbaud)
    3, // 2: SAE J1850 VPW (10.4 kbaud)
    3, // 3: ISO 9141-2 (5 baud init, 10.4 kbaud)
    3, // 4: ISO 14230-4 KWP (5 baud init, 10.4 kbaud)
    3, // 5: ISO 14230-4 KWP (fast init, 10.4 kbaud)
    0, // 6: ISO 15765-4 CAN (11 bit ID, 500 kbaud)
    9, // 7: ISO 15765-4 CAN (29 bit ID, 500 kbaud)
    0, // 8: ISO 15765-4 CAN (11 bit ID, 250 kbaud)
    9, // 9: ISO 15765-4 CAN (29 bit ID, 250 kbaud)
    9, // A: SAE J1939 CAN (29 bit ID, 250 kbaud)
    0, // B: USER1 CAN (11 bit ID, 125 kbaud)
    0, // C: USER2 CAN (29 bit ID, 50 kbaud)
];

/// A parsed adapter reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    /// All frame payloads concatenated in arrival order.
    pub bytes: Vec<u8>,
    /// Payload of the lowest-header frame, set only for true multi-ECU
    /// replies (more than two frames with differing headers).
    pub priority_bytes: Vec<u8>,
}

impl Response {
    /// The byte window to decode from: priority data when present.
    pub fn decode_source(&self) -> &[u8] {
        if self.priority_bytes.is_empty() {
            &self.bytes
        } else {
            &self.priority_bytes
        }
    }
}

/// Decode the space-separated hex pairs of one frame.
fn parse_frame_data(data: &str) -> Vec<u8> {
    let mut compact: String = data.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() % 2 != 0 {
        warn!("Incomplete byte at end of frame: {data}");
        compact.pop();
    }
    match hex::decode(&compact) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Non-hex data in frame {data:?}: {e}");
            Vec::new()
        }
    }
}

/// Split a raw adapter reply into CAN frames and extract the data bytes.
///
/// `protocol` is the cached protocol number (`PROTOCOL_UNKNOWN` when the
/// cell has not been filled yet); it selects the per-protocol extra data
/// offset. With an unknown protocol the header text length decides:
/// 2 characters is the legacy ISO variant with 9 extra characters, 3 and 8
/// need no extra skip, anything else drops the frame.
pub fn parse_frames(text: &str, protocol: i32) -> Response {
    let mut response = Response::default();

    let mut frame_count = 0usize;
    let mut lowest_header = u32::MAX;
    let mut first_header: Option<u32> = None;
    let mut all_headers_same = true;
    let mut lowest_data: Vec<u8> = Vec::new();

    if protocol != PROTOCOL_UNKNOWN {
        debug!("Current protocol number: {protocol}");
    }

    for frame in text.split(['\r', '\n']).filter(|f| !f.is_empty()) {
        frame_count += 1;
        let frame = frame.strip_suffix('>').unwrap_or(frame);
        if frame.is_empty() {
            continue;
        }

        let Some((header_str, data)) = frame.split_once(' ') else {
            warn!("No space delimiter found in frame: {frame}");
            continue;
        };
        let Ok(header) = u32::from_str_radix(header_str, 16) else {
            warn!("Non-hex header in frame: {frame}");
            continue;
        };
        debug!("Frame {frame_count} header: {header:#X} (length: {})", header_str.len());

        match first_header {
            None => first_header = Some(header),
            Some(first) if first != header => all_headers_same = false,
            Some(_) => {}
        }

        let extra = if (0..=12).contains(&protocol) {
            PROTOCOL_EXTRA_OFFSET[protocol as usize]
        } else {
            match header_str.len() {
                2 => 9,
                3 | 8 => 0,
                len => {
                    warn!("Unexpected header length: {len}, skipping frame");
                    continue;
                }
            }
        };
        let Some(data) = data.get(extra..) else {
            warn!("Frame shorter than data offset {extra}: {frame}");
            continue;
        };

        let frame_bytes = parse_frame_data(data);
        if header < lowest_header {
            lowest_header = header;
            lowest_data = frame_bytes.clone();
        }
        response.bytes.extend_from_slice(&frame_bytes);
    }

    // A primary responder is only meaningful for true multi-ECU replies
    if frame_count > 2 && !all_headers_same {
        response.priority_bytes = lowest_data;
        debug!(
            "Priority data set - length: {}, lowest header: {lowest_header:#X}",
            response.priority_bytes.len()
        );
    }

    debug!(
        "Parsing complete. Total frames: {frame_count}, total bytes: {}, priority bytes: {}",
        response.bytes.len(),
        response.priority_bytes.len()
    );

    response
}

/// OR together the successive 7-byte frames of a support-bitmap reply.
pub fn merge_bitmap(bytes: &[u8]) -> [u8; 7] {
    let mut merged = [0u8; 7];
    for chunk in bytes.chunks(7) {
        for (slot, &byte) in merged.iter_mut().zip(chunk) {
            *slot |= byte;
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_frame_protocol_6() {
        let response = parse_frames("7E8 04 41 0C 1A F8\r\r>", 6);
        assert_eq!(response.bytes, [0x04, 0x41, 0x0C, 0x1A, 0xF8]);
        assert!(response.priority_bytes.is_empty());
    }

    #[test]
    fn test_two_frames_no_priority() {
        let text = "7E8 06 41 00 00 00 00 01\r7EA 06 41 00 FF FF FF FF\r";
        let response = parse_frames(text, 6);
        assert_eq!(
            response.bytes,
            [
                0x06, 0x41, 0x00, 0x00, 0x00, 0x00, 0x01, //
                0x06, 0x41, 0x00, 0xFF, 0xFF, 0xFF, 0xFF,
            ]
        );
        // Only two frames: no priority data even though headers differ
        assert!(response.priority_bytes.is_empty());
        assert_eq!(response.decode_source(), &response.bytes[..]);
    }

    #[test]
    fn test_three_frames_priority_is_lowest_header() {
        let text = "7E9 03 41 0D 28\r7E8 04 41 0C 1A F8\r7EA 03 41 05 4F\r>";
        let response = parse_frames(text, 6);
        assert_eq!(response.priority_bytes, [0x04, 0x41, 0x0C, 0x1A, 0xF8]);
        assert_eq!(response.decode_source(), &[0x04, 0x41, 0x0C, 0x1A, 0xF8]);
    }

    #[test]
    fn test_three_frames_same_header_no_priority() {
        let text = "7E8 10 14 49 02 01 31 44\r7E8 21 34 47 50 30 30 52\r7E8 22 35 35 42 31 32 33\r";
        let response = parse_frames(text, 6);
        assert!(response.priority_bytes.is_empty());
    }

    #[test]
    fn test_protocol_7_extended_header_offset() {
        // 29-bit CAN headers print spaced; the first token is only the
        // priority byte and the 9 extra characters cover the rest
        let text = "18 DA F1 10 05 41 0C 1A F8\r";
        let response = parse_frames(text, 7);
        assert_eq!(response.bytes, [0x05, 0x41, 0x0C, 0x1A, 0xF8]);
    }

    #[test]
    fn test_protocol_3_iso_header_offset() {
        // ISO 9141: three header bytes, the table skips one more after the
        // first-space split
        let text = "48 6B 10 41 0C 1A F8\r";
        let response = parse_frames(text, 3);
        assert_eq!(response.bytes, [0x10, 0x41, 0x0C, 0x1A, 0xF8]);
    }

    #[test]
    fn test_unknown_protocol_falls_back_to_header_length() {
        // 3-char header: no extra skip
        let response = parse_frames("7E8 04 41 0C 1A F8\r", PROTOCOL_UNKNOWN);
        assert_eq!(response.bytes, [0x04, 0x41, 0x0C, 0x1A, 0xF8]);

        // 2-char header token: spaced extended header, skip 9 more characters
        let response = parse_frames("18 DA F1 10 05 41 0C 1A F8\r", PROTOCOL_UNKNOWN);
        assert_eq!(response.bytes, [0x05, 0x41, 0x0C, 0x1A, 0xF8]);

        // 5-char header: not a known format, frame dropped
        let response = parse_frames("7E8AB 04 41 0C\r", PROTOCOL_UNKNOWN);
        assert!(response.bytes.is_empty());
    }

    #[test]
    fn test_frame_without_space_is_skipped() {
        let response = parse_frames("SEARCHING...\r7E8 04 41 0C 1A F8\r", 6);
        assert_eq!(response.bytes, [0x04, 0x41, 0x0C, 0x1A, 0xF8]);
    }

    #[test]
    fn test_incomplete_trailing_byte_dropped() {
        let response = parse_frames("7E8 04 41 0C 1A F\r", 6);
        assert_eq!(response.bytes, [0x04, 0x41, 0x0C, 0x1A]);
    }

    #[test]
    fn test_merge_bitmap() {
        let bytes = [
            0x06, 0x41, 0x00, 0x00, 0x00, 0x00, 0x01, //
            0x06, 0x41, 0x00, 0xFF, 0xFF, 0xFF, 0xFF,
        ];
        assert_eq!(
            merge_bitmap(&bytes),
            [0x06, 0x41, 0x00, 0xFF, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_merge_bitmap_short_input() {
        assert_eq!(
            merge_bitmap(&[0x01, 0x02]),
            [0x01, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }
}
