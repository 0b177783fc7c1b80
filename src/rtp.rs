// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Handles RTP data as described in
//! [RFC 3550 section 5.1](https://datatracker.ietf.org/doc/html/rfc3550#section-5.1).

use std::convert::TryFrom;
use std::ops::Range;

use bytes::{Buf, Bytes};

use crate::{PacketContext, Timestamp};

/// The minimum length of an RTP header (no CSRCs or extensions).
const MIN_HEADER_LEN: u16 = 12;

/// The header extension profile used to carry a composition time (PTS − DTS)
/// offset alongside H.264 access units.
pub(crate) const CTS_EXTENSION_PROFILE: u16 = 0x0007;

/// Raw packet without state-specific interpretation or metadata.
///
/// This primarily validates a raw buffer then provides accessors for it.
/// The payload range is determined once during validation and kept as a
/// `Range<u16>` rather than being reconstructed on later accesses.
///
/// CSRC entries are rejected outright: neither role of this crate ever mixes
/// streams, so a nonzero CC field means the packet is not for us.
#[derive(Debug)]
pub(crate) struct RawPacket(
    /// Full packet data, including headers.
    ///
    /// ```text
    ///  0                   1                   2                   3
    ///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |V=2|P|X|  CC   |M|     PT      |       sequence number         |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |                           timestamp                           |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |           synchronization source (SSRC) identifier            |
    /// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
    /// |      defined by profile       |           length              |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |                  header extension (if X set)                  |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// ```
    pub Bytes,
);

impl RawPacket {
    /// Validates an RTP packet, returning a wrapper and the payload range.
    ///
    /// The payload range is not part of the `RawPacket` to avoid extra padding
    /// bytes within the containing `ReceivedPacket`.
    pub fn new(data: Bytes) -> Result<(Self, Range<u16>), RawPacketError> {
        // RTP doesn't have a defined maximum size but it's implied by the transport:
        // * UDP packets (even with fragmentation) are at most 65,536 (minus IP/UDP headers).
        // * interleaved RTSP data messages have at most 65,536 bytes of data.
        let len = match u16::try_from(data.len()) {
            Ok(l) => l,
            Err(_) => {
                return Err(RawPacketError {
                    reason: "too long",
                    data,
                })
            }
        };
        if len < MIN_HEADER_LEN {
            return Err(RawPacketError {
                reason: "too short",
                data,
            });
        }
        if (data[0] & 0b1100_0000) != 2 << 6 {
            return Err(RawPacketError {
                reason: "must be version 2",
                data,
            });
        }
        if (data[0] & 0b0000_1111) != 0 {
            return Err(RawPacketError {
                reason: "CSRC entries are not supported",
                data,
            });
        }
        let has_padding = (data[0] & 0b0010_0000) != 0;
        let has_extension = (data[0] & 0b0001_0000) != 0;
        let payload_start = if has_extension {
            if data.len() < usize::from(MIN_HEADER_LEN + 4) {
                return Err(RawPacketError {
                    reason: "extension is after end of packet",
                    data,
                });
            }
            let extension_words = u16::from_be_bytes([
                data[usize::from(MIN_HEADER_LEN) + 2],
                data[usize::from(MIN_HEADER_LEN) + 3],
            ]);
            match extension_words
                .checked_mul(4)
                .and_then(|b| b.checked_add(MIN_HEADER_LEN + 4))
            {
                Some(s) => s,
                None => {
                    return Err(RawPacketError {
                        reason: "extension extends beyond maximum packet size",
                        data,
                    })
                }
            }
        } else {
            MIN_HEADER_LEN
        };
        if len < payload_start {
            return Err(RawPacketError {
                reason: "payload start is after end of packet",
                data,
            });
        }
        let payload_end = if has_padding {
            if len == payload_start {
                return Err(RawPacketError {
                    reason: "missing padding",
                    data,
                });
            }
            let padding_len = u16::from(data[data.len() - 1]);
            if padding_len == 0 {
                return Err(RawPacketError {
                    reason: "invalid padding length 0",
                    data,
                });
            }
            let payload_end = match len.checked_sub(padding_len) {
                Some(e) => e,
                None => {
                    return Err(RawPacketError {
                        reason: "padding larger than packet",
                        data,
                    })
                }
            };
            if payload_end < payload_start {
                return Err(RawPacketError {
                    reason: "bad padding",
                    data,
                });
            }
            payload_end
        } else {
            len
        };
        Ok((Self(data), payload_start..payload_end))
    }

    #[inline]
    pub fn mark(&self) -> bool {
        (self.0[1] & 0b1000_0000) != 0
    }

    #[inline]
    pub fn sequence_number(&self) -> u16 {
        assert!(self.0.len() >= usize::from(MIN_HEADER_LEN));
        u16::from_be_bytes([self.0[2], self.0[3]])
    }

    #[inline]
    pub fn ssrc(&self) -> u32 {
        assert!(self.0.len() >= usize::from(MIN_HEADER_LEN));
        u32::from_be_bytes([self.0[8], self.0[9], self.0[10], self.0[11]])
    }

    #[inline]
    pub fn payload_type(&self) -> u8 {
        self.0[1] & 0b0111_1111
    }

    #[inline]
    pub fn timestamp(&self) -> u32 {
        assert!(self.0.len() >= usize::from(MIN_HEADER_LEN));
        u32::from_be_bytes([self.0[4], self.0[5], self.0[6], self.0[7]])
    }

    /// Returns the composition time offset carried in the header extension,
    /// if the packet carries one under [`CTS_EXTENSION_PROFILE`].
    pub fn cts(&self) -> Option<u32> {
        if (self.0[0] & 0b0001_0000) == 0 {
            return None;
        }
        let base = usize::from(MIN_HEADER_LEN);
        let profile = u16::from_be_bytes([self.0[base], self.0[base + 1]]);
        let words = u16::from_be_bytes([self.0[base + 2], self.0[base + 3]]);
        if profile != CTS_EXTENSION_PROFILE || words != 1 {
            return None;
        }
        Some(u32::from_be_bytes([
            self.0[base + 4],
            self.0[base + 5],
            self.0[base + 6],
            self.0[base + 7],
        ]))
    }
}

#[derive(Debug)]
#[doc(hidden)]
pub struct RawPacketError {
    pub reason: &'static str,
    pub data: Bytes,
}

pub(crate) struct RawPacketBuilder {
    pub sequence_number: u16,
    pub timestamp: u32,
    pub payload_type: u8,
    pub ssrc: u32,
    pub mark: bool,

    /// When present, written as a one-word header extension under
    /// [`CTS_EXTENSION_PROFILE`] with the X bit set.
    pub cts: Option<u32>,
}

impl RawPacketBuilder {
    pub(crate) fn build<P: AsRef<[u8]>>(
        self,
        payload: P,
    ) -> Result<(RawPacket, Range<u16>), &'static str> {
        if self.payload_type >= 0x80 {
            return Err("payload type too large");
        }
        let payload = payload.as_ref();
        let ext_len = if self.cts.is_some() { 8 } else { 0 };
        let mut data = Vec::with_capacity(usize::from(MIN_HEADER_LEN) + ext_len + payload.len());
        data.push(2 << 6 | if self.cts.is_some() { 0b0001_0000 } else { 0 });
        data.push(if self.mark { 0b1000_0000 } else { 0 } | self.payload_type);
        data.extend_from_slice(&self.sequence_number.to_be_bytes());
        data.extend_from_slice(&self.timestamp.to_be_bytes());
        data.extend_from_slice(&self.ssrc.to_be_bytes());
        if let Some(cts) = self.cts {
            data.extend_from_slice(&CTS_EXTENSION_PROFILE.to_be_bytes());
            data.extend_from_slice(&1u16.to_be_bytes());
            data.extend_from_slice(&cts.to_be_bytes());
        }
        data.extend_from_slice(payload);
        let len = u16::try_from(data.len()).map_err(|_| "payload too long")?;
        let payload_start = MIN_HEADER_LEN + ext_len as u16;
        Ok((RawPacket(data.into()), payload_start..len))
    }
}

/// A received RTP packet.
///
/// This holds more information than the packet itself: also a
/// [`PacketContext`], the channel, and extended timestamp.
pub struct ReceivedPacket {
    pub(crate) ctx: PacketContext,
    pub(crate) channel_id: usize,
    pub(crate) timestamp: crate::Timestamp,
    pub(crate) raw: RawPacket,
    pub(crate) payload_range: Range<u16>,

    /// Number of skipped sequence numbers since the last packet.
    pub(crate) loss: u16,
}

impl std::fmt::Debug for ReceivedPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivedPacket")
            .field("ctx", &self.ctx)
            .field("channel_id", &self.channel_id)
            .field("timestamp", &self.timestamp)
            .field("ssrc", &self.raw.ssrc())
            .field("sequence_number", &self.raw.sequence_number())
            .field("mark", &self.raw.mark())
            .field("payload", &crate::hex::LimitedHex::new(self.payload(), 64))
            .finish()
    }
}

impl ReceivedPacket {
    #[inline]
    pub fn timestamp(&self) -> crate::Timestamp {
        self.timestamp
    }

    #[inline]
    pub fn mark(&self) -> bool {
        self.raw.mark()
    }

    #[inline]
    pub fn ctx(&self) -> &PacketContext {
        &self.ctx
    }

    #[inline]
    pub fn channel_id(&self) -> usize {
        self.channel_id
    }

    #[inline]
    pub fn ssrc(&self) -> u32 {
        self.raw.ssrc()
    }

    #[inline]
    pub fn sequence_number(&self) -> u16 {
        self.raw.sequence_number()
    }

    /// Returns the composition time offset from the header extension, if any.
    #[inline]
    pub fn cts(&self) -> Option<u32> {
        self.raw.cts()
    }

    /// Returns the raw bytes, including the RTP headers.
    #[inline]
    pub fn raw(&self) -> &[u8] {
        &self.raw.0[..]
    }

    /// Returns only the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.raw.0[usize::from(self.payload_range.start)..usize::from(self.payload_range.end)]
    }

    #[inline]
    pub fn loss(&self) -> u16 {
        self.loss
    }

    /// Consumes the `ReceivedPacket` and returns the payload as a [`Bytes`].
    #[inline]
    pub fn into_payload_bytes(self) -> Bytes {
        let mut data = self.raw.0;
        data.truncate(usize::from(self.payload_range.end));
        data.advance(usize::from(self.payload_range.start));
        data
    }
}

/// Testing API; exposed for tests of the codec paths.
#[doc(hidden)]
pub struct ReceivedPacketBuilder {
    pub ctx: PacketContext,
    pub channel_id: usize,
    pub sequence_number: u16,
    pub timestamp: Timestamp,
    pub payload_type: u8,
    pub ssrc: u32,
    pub mark: bool,
    pub loss: u16,
    pub cts: Option<u32>,
}

impl ReceivedPacketBuilder {
    pub fn build<P: AsRef<[u8]>>(self, payload: P) -> Result<ReceivedPacket, &'static str> {
        let (raw, payload_range) = RawPacketBuilder {
            sequence_number: self.sequence_number,
            timestamp: self.timestamp.timestamp as u32,
            payload_type: self.payload_type,
            ssrc: self.ssrc,
            mark: self.mark,
            cts: self.cts,
        }
        .build(payload)?;
        Ok(ReceivedPacket {
            ctx: self.ctx,
            channel_id: self.channel_id,
            timestamp: self.timestamp,
            raw,
            payload_range,
            loss: self.loss,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use super::*;

    fn ts(timestamp: i64) -> Timestamp {
        Timestamp {
            timestamp,
            clock_rate: NonZeroU32::new(90_000).unwrap(),
            start: 0,
        }
    }

    #[test]
    fn round_trip_no_extension() {
        let pkt = ReceivedPacketBuilder {
            ctx: PacketContext::dummy(),
            channel_id: 0,
            sequence_number: 0x1234,
            timestamp: ts(0x567890),
            payload_type: 96,
            ssrc: 0xdeadbeef,
            mark: true,
            loss: 0,
            cts: None,
        }
        .build(b"payload")
        .unwrap();
        assert_eq!(pkt.sequence_number(), 0x1234);
        assert_eq!(pkt.ssrc(), 0xdeadbeef);
        assert!(pkt.mark());
        assert_eq!(pkt.cts(), None);
        assert_eq!(pkt.payload(), b"payload");

        // Revalidate the raw bytes through the parse path.
        let (raw, range) = RawPacket::new(Bytes::copy_from_slice(pkt.raw())).unwrap();
        assert_eq!(&raw.0[usize::from(range.start)..usize::from(range.end)], b"payload");
    }

    #[test]
    fn round_trip_cts_extension() {
        let pkt = ReceivedPacketBuilder {
            ctx: PacketContext::dummy(),
            channel_id: 0,
            sequence_number: 1,
            timestamp: ts(90),
            payload_type: 96,
            ssrc: 0,
            mark: false,
            loss: 0,
            cts: Some(3_600),
        }
        .build(b"x")
        .unwrap();
        assert_eq!(pkt.cts(), Some(3_600));
        assert_eq!(pkt.payload(), b"x");
        let (raw, range) = RawPacket::new(Bytes::copy_from_slice(pkt.raw())).unwrap();
        assert_eq!(raw.cts(), Some(3_600));
        assert_eq!(usize::from(range.start), 20);
    }

    #[test]
    fn reject_csrcs() {
        // Version 2 but CC=1.
        let buf = b"\x81\x60\x00\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00";
        let e = RawPacket::new(Bytes::copy_from_slice(buf)).unwrap_err();
        assert_eq!(e.reason, "CSRC entries are not supported");
    }

    #[test]
    fn reject_version_1() {
        let buf = b"\x40\x60\x00\x01\x00\x00\x00\x00\x00\x00\x00\x00";
        let e = RawPacket::new(Bytes::copy_from_slice(buf)).unwrap_err();
        assert_eq!(e.reason, "must be version 2");
    }
}
