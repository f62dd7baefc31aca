//! Framing for the HID byte-stream transport.
//!
//! Each packet is carried as one JSON body, possibly split across several
//! 64-byte HID reports. The first report of a packet carries a 4-byte
//! header (sync byte, version byte, little-endian body length); later
//! reports for the same packet carry no header, just raw continuation
//! bytes. A single trailing CRC byte follows the body; it is informational
//! only and is not verified on read (mirrors the link's original
//! producer, which never checked it either).
//!
//! [`HidDecoder`] is a stateful, incremental decoder in the same vein as a
//! streaming frame codec: feed it bytes as they arrive from the device,
//! and drain decoded packets as they complete. Because a single HID read
//! can contain trailing bytes from a follow-up frame, or arrive split
//! mid-header, the decoder always resynchronizes on the next sync byte
//! after anything unexpected.

use bytes::{Buf, Bytes, BytesMut};
use busline_core::packet::Packet;
use tracing::warn;

use crate::error::{CodecError, Result};

pub const SYNC_BYTE: u8 = 0x3c;
pub const VERSION_BYTE: u8 = 0x40;
pub const MAX_HID_REPORT_SIZE: usize = 64;
/// sync byte + version byte + 2-byte little-endian length.
pub const HEADER_LEN: usize = 4;

enum State {
    /// Looking for the next sync byte; everything before it is noise.
    Seeking,
    /// Sync byte consumed, waiting for version + 2-byte length.
    Header,
    /// Header parsed, waiting for `length` body bytes.
    Body { length: usize },
    /// Body collected, waiting for the single trailing CRC byte.
    Crc { body: Bytes },
}

/// Incrementally reassembles JSON packet bodies out of a raw HID byte
/// stream, one frame at a time.
pub struct HidDecoder {
    staging: BytesMut,
    state: State,
}

impl Default for HidDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HidDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            staging: BytesMut::new(),
            state: State::Seeking,
        }
    }

    /// Appends freshly-read bytes to the decoder's internal buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.staging.extend_from_slice(bytes);
    }

    /// Pulls the next fully-decoded packet out of the buffer, if one is
    /// ready. Call in a loop after each `feed` until it returns `Ok(None)`.
    pub fn decode_next(&mut self) -> Result<Option<Packet>> {
        loop {
            match std::mem::replace(&mut self.state, State::Seeking) {
                State::Seeking => match self.staging.iter().position(|&b| b == SYNC_BYTE) {
                    Some(idx) => {
                        self.staging.advance(idx + 1);
                        self.state = State::Header;
                    }
                    None => {
                        // No sync byte in what we have; none of it can ever
                        // matter, so drop it rather than let the buffer grow
                        // unbounded while nothing is connected.
                        self.staging.clear();
                        return Ok(None);
                    }
                },
                State::Header => {
                    if self.staging.len() < HEADER_LEN - 1 {
                        self.state = State::Header;
                        return Ok(None);
                    }
                    let version = self.staging[0];
                    if version != VERSION_BYTE {
                        warn!(version, "unexpected HID frame version, resyncing");
                        self.staging.advance(1);
                        self.state = State::Seeking;
                        continue;
                    }
                    let length = u16::from_le_bytes([self.staging[1], self.staging[2]]) as usize;
                    self.staging.advance(3);
                    self.state = State::Body { length };
                }
                State::Body { length } => {
                    if self.staging.len() < length {
                        self.state = State::Body { length };
                        return Ok(None);
                    }
                    let body = self.staging.split_to(length).freeze();
                    self.state = State::Crc { body };
                }
                State::Crc { body } => {
                    if self.staging.is_empty() {
                        self.state = State::Crc { body };
                        return Ok(None);
                    }
                    self.staging.advance(1); // CRC is not validated.
                    let packet: Packet = serde_json::from_slice(&body)
                        .map_err(CodecError::MalformedPayload)?;
                    return Ok(Some(packet));
                }
            }
        }
    }
}

/// Serializes `packet` and splits it into the sequence of HID report
/// payloads needed to transmit it, each prefixed with the report-id byte
/// `hidapi` expects (`0x00`, this device has no alternate report ids).
/// Only the first report carries the sync/version/length header.
pub fn frame_packet(packet: &Packet) -> Result<Vec<Vec<u8>>> {
    let body = serde_json::to_vec(packet).map_err(CodecError::MalformedPayload)?;
    let length = body.len();
    if length > u16::MAX as usize {
        return Err(CodecError::FrameTooLarge(length));
    }

    let mut reports = Vec::new();
    let mut offset = 0;
    let mut first = true;

    loop {
        let header_len = if first { HEADER_LEN } else { 0 };
        let chunk_len = (length - offset).min(MAX_HID_REPORT_SIZE - 1 - header_len);

        let mut report = Vec::with_capacity(MAX_HID_REPORT_SIZE);
        report.push(0x00); // report id
        if first {
            report.push(SYNC_BYTE);
            report.push(VERSION_BYTE);
            report.extend_from_slice(&(length as u16).to_le_bytes());
        }
        report.extend_from_slice(&body[offset..offset + chunk_len]);
        offset += chunk_len;
        first = false;
        reports.push(report);

        if offset >= length {
            break;
        }
    }

    Ok(reports)
}
