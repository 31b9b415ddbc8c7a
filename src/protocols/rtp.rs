//! RTP (Real-time Transport Protocol) framing
//!
//! Packet encode/decode, RFC 2833 telephone-event payloads, and the
//! per-direction receive statistics the media relay keeps. Socket handling
//! lives in the relay service; this module is pure wire format.

use std::time::Instant;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// Minimum size of a well-formed RTP datagram
pub const RTP_HEADER_LEN: usize = 12;

/// RTP packet structure
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc_list: Vec<u32>,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn new(payload_type: u8, sequence_number: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            version: 2,
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: false,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc_list: Vec::new(),
            payload: Bytes::new(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(RTP_HEADER_LEN + (self.csrc_count as usize * 4) + self.payload.len());

        // First byte: V(2) + P(1) + X(1) + CC(4)
        let first_byte = (self.version << 6)
            | (if self.padding { 1 << 5 } else { 0 })
            | (if self.extension { 1 << 4 } else { 0 })
            | self.csrc_count;
        buf.put_u8(first_byte);

        // Second byte: M(1) + PT(7)
        let second_byte = (if self.marker { 1 << 7 } else { 0 }) | self.payload_type;
        buf.put_u8(second_byte);

        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);

        for csrc in &self.csrc_list {
            buf.put_u32(*csrc);
        }

        buf.put(self.payload.clone());

        buf.freeze()
    }

    pub fn decode(mut data: Bytes) -> Result<Self> {
        if data.len() < RTP_HEADER_LEN {
            return Err(Error::rtp("RTP packet too short"));
        }

        let first_byte = data.get_u8();
        let version = (first_byte >> 6) & 0x03;
        let padding = (first_byte & 0x20) != 0;
        let extension = (first_byte & 0x10) != 0;
        let csrc_count = first_byte & 0x0F;

        if version != 2 {
            return Err(Error::rtp("Invalid RTP version"));
        }

        let second_byte = data.get_u8();
        let marker = (second_byte & 0x80) != 0;
        let payload_type = second_byte & 0x7F;

        let sequence_number = data.get_u16();
        let timestamp = data.get_u32();
        let ssrc = data.get_u32();

        let mut csrc_list = Vec::new();
        for _ in 0..csrc_count {
            if data.remaining() < 4 {
                return Err(Error::rtp("Invalid CSRC list"));
            }
            csrc_list.push(data.get_u32());
        }

        if extension {
            if data.remaining() < 4 {
                return Err(Error::rtp("Invalid extension header"));
            }
            let _extension_type = data.get_u16();
            let extension_length = data.get_u16() as usize * 4;

            if data.remaining() < extension_length {
                return Err(Error::rtp("Invalid extension length"));
            }

            data.advance(extension_length);
        }

        let payload = if padding && !data.is_empty() {
            let padding_length = data[data.len() - 1] as usize;
            if padding_length > data.len() {
                return Err(Error::rtp("Invalid padding length"));
            }
            data.slice(0..data.len() - padding_length)
        } else {
            data
        };

        Ok(Self {
            version,
            padding,
            extension,
            csrc_count,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc_list,
            payload,
        })
    }
}

/// Decoded RFC 2833 telephone-event payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rfc2833Event {
    /// Event code: 0-9 digits, 10 `*`, 11 `#`, 12-15 A-D
    pub event: u8,
    pub end: bool,
    pub volume: u8,
    /// Duration so far in timestamp units (samples at 8 kHz)
    pub duration: u16,
}

impl Rfc2833Event {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < 4 {
            return Err(Error::rtp("telephone-event payload too short"));
        }
        Ok(Self {
            event: payload[0],
            end: payload[1] & 0x80 != 0,
            volume: payload[1] & 0x3F,
            duration: u16::from_be_bytes([payload[2], payload[3]]),
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u8(self.event);
        buf.put_u8(if self.end { 0x80 } else { 0 } | (self.volume & 0x3F));
        buf.put_u16(self.duration);
        buf.freeze()
    }

    pub fn duration_ms(&self, clock_rate: u32) -> u32 {
        (u32::from(self.duration) * 1000) / clock_rate.max(1)
    }
}

/// Receive-direction statistics per RFC 3550
#[derive(Debug, Clone)]
pub struct RtpStreamStats {
    pub packets: u64,
    pub bytes: u64,
    pub packets_lost: u32,
    /// Interarrival jitter in timestamp units, RFC 3550 A.8
    pub jitter: f64,
    pub last_sequence: u16,
    pub last_timestamp: u32,
    last_arrival: Option<Instant>,
    clock_rate: u32,
}

impl RtpStreamStats {
    pub fn new(clock_rate: u32) -> Self {
        Self {
            packets: 0,
            bytes: 0,
            packets_lost: 0,
            jitter: 0.0,
            last_sequence: 0,
            last_timestamp: 0,
            last_arrival: None,
            clock_rate,
        }
    }

    pub fn update(&mut self, packet: &RtpPacket, wire_len: usize) {
        let now = Instant::now();
        self.packets += 1;
        self.bytes += wire_len as u64;

        if let Some(last_arrival) = self.last_arrival {
            // Loss from sequence gaps
            let expected = self.last_sequence.wrapping_add(1);
            if packet.sequence_number != expected {
                let gap = packet.sequence_number.wrapping_sub(expected);
                // Large backwards jumps are reordering, not loss
                if gap < 0x8000 {
                    self.packets_lost = self.packets_lost.saturating_add(u32::from(gap));
                }
            }

            // J(i) = J(i-1) + (|D(i-1,i)| - J(i-1)) / 16, D in timestamp units
            let arrival_delta =
                now.duration_since(last_arrival).as_secs_f64() * f64::from(self.clock_rate);
            let timestamp_delta =
                f64::from(packet.timestamp.wrapping_sub(self.last_timestamp));
            let d = (arrival_delta - timestamp_delta).abs();
            self.jitter += (d - self.jitter) / 16.0;
        }

        self.last_sequence = packet.sequence_number;
        self.last_timestamp = packet.timestamp;
        self.last_arrival = Some(now);
    }

    pub fn jitter_ms(&self) -> f64 {
        self.jitter * 1000.0 / f64::from(self.clock_rate.max(1))
    }

    pub fn loss_rate(&self) -> f64 {
        if self.packets == 0 {
            0.0
        } else {
            f64::from(self.packets_lost) * 100.0
                / (self.packets as f64 + f64::from(self.packets_lost))
        }
    }
}

/// Sequence/timestamp state for a locally generated stream (prompt
/// injection, tone playback)
#[derive(Debug)]
pub struct RtpSender {
    pub ssrc: u32,
    pub payload_type: u8,
    sequence: u16,
    timestamp: u32,
}

impl RtpSender {
    pub fn new(payload_type: u8) -> Self {
        Self {
            ssrc: rand::random::<u32>(),
            payload_type,
            sequence: rand::random::<u16>(),
            timestamp: rand::random::<u32>(),
        }
    }

    /// Produce the next packet in the stream; `samples` advances the
    /// timestamp (160 for a 20 ms frame at 8 kHz).
    pub fn next_packet(&mut self, payload: Bytes, samples: u32, marker: bool) -> RtpPacket {
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(samples);
        let mut packet = RtpPacket::new(self.payload_type, self.sequence, self.timestamp, self.ssrc);
        packet.marker = marker;
        packet.payload = payload;
        packet
    }
}
