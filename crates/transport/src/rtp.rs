//! RTP packet format (RFC 3550)
//!
//! Only the fixed header is interpreted. CSRC lists and header extensions
//! are skipped and padding is stripped from the payload.

use crate::TransportError;

const RTP_VERSION: u8 = 2;
const HEADER_LEN: usize = 12;

/// A single RTP packet carrying one audio frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub payload_type: u8,
    pub marker: bool,
    pub sequence: u16,
    /// Media timestamp in sample units
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: Vec<u8>,
}

impl RtpPacket {
    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32, payload: Vec<u8>) -> Self {
        Self {
            payload_type,
            marker: false,
            sequence,
            timestamp,
            ssrc,
            payload,
        }
    }

    /// Parse a datagram
    pub fn parse(buf: &[u8]) -> Result<Self, TransportError> {
        if buf.len() < HEADER_LEN {
            return Err(TransportError::MalformedPacket(format!(
                "{} bytes is shorter than the RTP header",
                buf.len()
            )));
        }

        let version = buf[0] >> 6;
        if version != RTP_VERSION {
            return Err(TransportError::MalformedPacket(format!(
                "unsupported RTP version {}",
                version
            )));
        }

        let has_padding = buf[0] & 0x20 != 0;
        let has_extension = buf[0] & 0x10 != 0;
        let csrc_count = (buf[0] & 0x0F) as usize;

        let mut offset = HEADER_LEN + csrc_count * 4;
        if has_extension {
            if buf.len() < offset + 4 {
                return Err(TransportError::MalformedPacket(
                    "truncated header extension".to_string(),
                ));
            }
            let words = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
            offset += 4 + words * 4;
        }

        let mut end = buf.len();
        if has_padding && end > offset {
            let padding = buf[end - 1] as usize;
            if padding == 0 || padding > end - offset {
                return Err(TransportError::MalformedPacket(format!(
                    "invalid padding length {}",
                    padding
                )));
            }
            end -= padding;
        }

        if offset > end {
            return Err(TransportError::MalformedPacket(
                "header exceeds packet length".to_string(),
            ));
        }

        Ok(Self {
            payload_type: buf[1] & 0x7F,
            marker: buf[1] & 0x80 != 0,
            sequence: u16::from_be_bytes([buf[2], buf[3]]),
            timestamp: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ssrc: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            payload: buf[offset..end].to_vec(),
        })
    }

    /// Serialize into `out`, replacing its contents
    pub fn write_to(&self, out: &mut Vec<u8>) {
        write_packet(
            out,
            RtpHeader {
                payload_type: self.payload_type,
                marker: self.marker,
                sequence: self.sequence,
                timestamp: self.timestamp,
                ssrc: self.ssrc,
            },
            &self.payload,
        );
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_to(&mut out);
        out
    }
}

/// Fixed header fields for an outbound packet
#[derive(Debug, Clone, Copy)]
pub struct RtpHeader {
    pub payload_type: u8,
    pub marker: bool,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

/// Serialize a header and borrowed payload into `out`, replacing its contents
pub fn write_packet(out: &mut Vec<u8>, header: RtpHeader, payload: &[u8]) {
    out.clear();
    out.reserve(HEADER_LEN + payload.len());
    out.push(RTP_VERSION << 6);
    out.push(((header.marker as u8) << 7) | (header.payload_type & 0x7F));
    out.extend_from_slice(&header.sequence.to_be_bytes());
    out.extend_from_slice(&header.timestamp.to_be_bytes());
    out.extend_from_slice(&header.ssrc.to_be_bytes());
    out.extend_from_slice(payload);
}
