// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Handles RTCP data as described in
//! [RFC 3550 section 6](https://datatracker.ietf.org/doc/html/rfc3550#section-6).

use std::convert::TryInto;

use bytes::Bytes;

use crate::PacketContext;

/// The application-defined packet name used to carry a stream's first DTS.
///
/// When the sending side emits an H.264 keyframe it also emits one APP packet
/// with this name whose payload is the stream's first DTS in 90 kHz units as
/// a big-endian `u64`, letting the receiver restore absolute stream time.
pub const FIRST_DTS_NAME: &[u8; 4] = b"FlFD";

/// A received RTCP compound packet.
///
/// The contents have been validated at least as specified in [RFC 3550 appendix
/// A.2](https://datatracker.ietf.org/doc/html/rfc3550#appendix-A.2), updated
/// by [RFC 5506](https://datatracker.ietf.org/doc/html/rfc5506):
///
/// *   There is at least one RTCP packet within the compound packet.
/// *   All packets are RTCP version 2.
/// *   Non-final packets have no padding.
/// *   The packets' lengths add up to the compound packet's length.
pub struct ReceivedCompoundPacket {
    pub(crate) ctx: PacketContext,
    pub(crate) channel_id: usize,
    pub(crate) raw: Bytes,
}

impl ReceivedCompoundPacket {
    /// For tests.
    #[doc(hidden)]
    pub fn dummy(data: &[u8]) -> Self {
        Self {
            ctx: PacketContext::dummy(),
            channel_id: 0,
            raw: Bytes::copy_from_slice(data),
        }
    }

    /// Validates the supplied compound packet.
    ///
    /// Returns the first packet on success so the caller doesn't need to
    /// recalculate its lengths.
    pub(crate) fn validate(raw: &[u8]) -> Result<PacketRef<'_>, String> {
        let (first_pkt, mut rest) = PacketRef::parse(raw)?;
        let mut pkt = first_pkt;
        loop {
            if rest.is_empty() {
                break;
            } else if pkt.has_padding() {
                return Err("padding on non-final packet within RTCP compound packet".to_owned());
            }
            (pkt, rest) = PacketRef::parse(rest)?;
        }
        Ok(first_pkt)
    }

    #[inline]
    pub fn ctx(&self) -> &PacketContext {
        &self.ctx
    }

    #[inline]
    pub fn channel_id(&self) -> usize {
        self.channel_id
    }

    /// Returns the full raw compound packet, including headers of all packets.
    #[inline]
    pub fn raw(&self) -> &[u8] {
        &self.raw[..]
    }

    /// Returns an iterator through all contained packets.
    #[inline]
    pub fn pkts(&self) -> impl Iterator<Item = PacketRef<'_>> {
        CompoundPacketIterator(&self.raw[..])
    }
}

impl std::fmt::Debug for ReceivedCompoundPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivedCompoundPacket")
            .field("ctx", &self.ctx)
            .field("channel_id", &self.channel_id)
            .field("raw", &crate::hex::LimitedHex::new(&self.raw[..], 64))
            .finish()
    }
}

/// Internal type returned from [`ReceivedCompoundPacket::pkts`].
struct CompoundPacketIterator<'a>(&'a [u8]);

impl<'a> Iterator for CompoundPacketIterator<'a> {
    type Item = PacketRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.0.is_empty() {
            return None;
        }

        let (pkt, rest) =
            PacketRef::parse(self.0).expect("failed to parse previously validated packet");
        self.0 = rest;
        Some(pkt)
    }
}

/// A payload type-specific accessor for a packet.
#[non_exhaustive]
pub enum TypedPacketRef<'a> {
    SenderReport(SenderReportRef<'a>),
    ReceiverReport(ReceiverReportRef<'a>),
    FirstDts(FirstDtsRef<'a>),
}

/// A sender report, as defined in
/// [RFC 3550 section 6.4.1](https://datatracker.ietf.org/doc/html/rfc3550#section-6.4.1).
///
/// ```text
///         0                   1                   2                   3
///         0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// header |V=2|P|    RC   |   PT=SR=200   |             length            |
///        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///        |                         SSRC of sender                        |
///        +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// sender |              NTP timestamp, most significant word             |
/// info   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///        |             NTP timestamp, least significant word             |
///        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///        |                         RTP timestamp                         |
///        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///        |                     sender's packet count                     |
///        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///        |                      sender's octet count                     |
///        +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// ```
pub struct SenderReportRef<'a>(PacketRef<'a>);

impl<'a> SenderReportRef<'a> {
    fn validate(pkt: PacketRef<'a>) -> Result<Self, String> {
        let count = usize::from(pkt.count());
        const HEADER_LEN: usize = 8;
        const SENDER_INFO_LEN: usize = 20;
        const REPORT_BLOCK_LEN: usize = 24;
        let expected_len = HEADER_LEN + SENDER_INFO_LEN + (count * REPORT_BLOCK_LEN);
        if pkt.payload_end < expected_len {
            return Err(format!(
                "RTCP SR has invalid count={} with unpadded_byte_len={}",
                count, pkt.payload_end
            ));
        }
        Ok(Self(pkt))
    }

    pub fn ssrc(&self) -> u32 {
        u32::from_be_bytes(self.0.buf[4..8].try_into().unwrap())
    }

    pub fn ntp_timestamp(&self) -> crate::NtpTimestamp {
        crate::NtpTimestamp(u64::from_be_bytes(self.0.buf[8..16].try_into().unwrap()))
    }

    pub fn rtp_timestamp(&self) -> u32 {
        u32::from_be_bytes(self.0.buf[16..20].try_into().unwrap())
    }
}

impl<'a> std::ops::Deref for SenderReportRef<'a> {
    type Target = PacketRef<'a>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A receiver report, as defined in
/// [RFC 3550 section 6.4.2](https://datatracker.ietf.org/doc/html/rfc3550#section-6.4.2).
pub struct ReceiverReportRef<'a>(PacketRef<'a>);

impl<'a> ReceiverReportRef<'a> {
    fn validate(pkt: PacketRef<'a>) -> Result<Self, String> {
        let count = usize::from(pkt.count());
        const HEADER_LEN: usize = 8;
        const REPORT_BLOCK_LEN: usize = 24;
        let expected_len = HEADER_LEN + (count * REPORT_BLOCK_LEN);
        if pkt.payload_end < expected_len {
            return Err(format!(
                "RTCP RR has invalid count={} with unpadded_byte_len={}",
                count, pkt.payload_end
            ));
        }
        Ok(Self(pkt))
    }

    pub fn ssrc(&self) -> u32 {
        u32::from_be_bytes(self.0.buf[4..8].try_into().unwrap())
    }
}

impl<'a> std::ops::Deref for ReceiverReportRef<'a> {
    type Target = PacketRef<'a>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// The application-defined (PT=204) packet named [`FIRST_DTS_NAME`].
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P| subtype |   PT=APP=204  |           length=4            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           SSRC/CSRC                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                         name = "FlFD"                         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                first DTS in 90 kHz units (u64)                |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
pub struct FirstDtsRef<'a>(PacketRef<'a>);

impl<'a> FirstDtsRef<'a> {
    fn validate(pkt: PacketRef<'a>) -> Result<Option<Self>, String> {
        const EXPECTED_LEN: usize = 20;
        if pkt.payload_end < EXPECTED_LEN {
            return Err(format!(
                "RTCP APP packet too short: unpadded_byte_len={}",
                pkt.payload_end
            ));
        }
        if &pkt.buf[8..12] != FIRST_DTS_NAME {
            return Ok(None); // some other application's packet.
        }
        Ok(Some(Self(pkt)))
    }

    pub fn ssrc(&self) -> u32 {
        u32::from_be_bytes(self.0.buf[4..8].try_into().unwrap())
    }

    /// The first DTS in milliseconds, rounded from the 90 kHz payload.
    pub fn first_dts_millis(&self) -> i64 {
        let v = u64::from_be_bytes(self.0.buf[12..20].try_into().unwrap());
        ((v + 45) / 90) as i64
    }
}

/// Builds the single RTCP APP packet described at [`FirstDtsRef`].
pub(crate) fn build_first_dts(ssrc: u32, first_dts_millis: i64) -> [u8; 20] {
    let mut out = [0u8; 20];
    out[0] = 2 << 6;
    out[1] = 204;
    out[2..4].copy_from_slice(&4u16.to_be_bytes());
    out[4..8].copy_from_slice(&ssrc.to_be_bytes());
    out[8..12].copy_from_slice(FIRST_DTS_NAME);
    out[12..20].copy_from_slice(&((first_dts_millis * 90) as u64).to_be_bytes());
    out
}

/// Builds a receiver report (PT=201) with a single report block.
///
/// Loss and jitter are reported as zero; the interesting fields are the
/// highest received sequence number and the LSR/DLSR pair which lets the
/// sender compute round-trip time.
pub(crate) struct ReceiverReportBuilder {
    pub ssrc: u32,
    pub source_ssrc: u32,
    pub extended_max_seq: u32,
    pub last_sr: u32,
    pub delay_since_last_sr: u32,
}

impl ReceiverReportBuilder {
    pub(crate) fn build(self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[0] = 2 << 6 | 1; // version 2, RC=1.
        out[1] = 201;
        out[2..4].copy_from_slice(&7u16.to_be_bytes());
        out[4..8].copy_from_slice(&self.ssrc.to_be_bytes());
        out[8..12].copy_from_slice(&self.source_ssrc.to_be_bytes());
        // fraction lost (8 bits) + cumulative lost (24 bits) stay zero.
        out[16..20].copy_from_slice(&self.extended_max_seq.to_be_bytes());
        // interarrival jitter stays zero.
        out[24..28].copy_from_slice(&self.last_sr.to_be_bytes());
        out[28..32].copy_from_slice(&self.delay_since_last_sr.to_be_bytes());
        out
    }
}

/// A generic packet, not parsed as any particular payload type.
///
/// This only interprets the leading four bytes:
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|         |   PT          |             length            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Copy, Clone)]
pub struct PacketRef<'a> {
    buf: &'a [u8],
    payload_end: usize,
}

const COMMON_HEADER_LEN: usize = 4;

impl<'a> PacketRef<'a> {
    /// Parses a buffer into this packet and rest, doing only basic validation
    /// of the version, padding, and length.
    pub fn parse(buf: &'a [u8]) -> Result<(Self, &'a [u8]), String> {
        if buf.len() < COMMON_HEADER_LEN {
            return Err(format!(
                "RTCP packets must be at least {} bytes; have only {}",
                COMMON_HEADER_LEN,
                buf.len()
            ));
        }
        let ver = buf[0] >> 6;
        if ver != 2 {
            return Err(format!("RTCP packets must be version 2; got {ver}"));
        }

        // raw_len is "The length of this RTCP packet in 32-bit words minus one,
        // including the header and any padding."
        let raw_len = (u16::from(buf[2]) << 8) | u16::from(buf[3]);
        let len = (usize::from(raw_len) + 1) * 4;
        if buf.len() < len {
            return Err(format!(
                "RTCP packet header has length {} bytes; have only {}",
                len,
                buf.len()
            ));
        }
        let (this, rest) = buf.split_at(len);
        let padding_bit = this[0] & 0b0010_0000;
        if padding_bit != 0 {
            if raw_len == 0 {
                return Err("RTCP packet has invalid combination of padding and len=0".to_owned());
            }
            let padding_bytes = usize::from(this[len - 1]);
            if padding_bytes == 0 || padding_bytes > len - COMMON_HEADER_LEN {
                return Err(format!(
                    "RTCP packet of len {len} states invalid {padding_bytes} padding bytes"
                ));
            }
            Ok((
                PacketRef {
                    buf: this,
                    payload_end: len - padding_bytes,
                },
                rest,
            ))
        } else {
            Ok((
                PacketRef {
                    buf: this,
                    payload_end: len,
                },
                rest,
            ))
        }
    }

    /// Returns the uninterpreted payload type of this RTCP packet.
    #[inline]
    pub fn payload_type(&self) -> u8 {
        self.buf[1]
    }

    /// Parses to a `TypedPacketRef` if the payload type is supported.
    pub fn as_typed(self) -> Result<Option<TypedPacketRef<'a>>, String> {
        match self.payload_type() {
            200 => Ok(Some(TypedPacketRef::SenderReport(
                SenderReportRef::validate(self)?,
            ))),
            201 => Ok(Some(TypedPacketRef::ReceiverReport(
                ReceiverReportRef::validate(self)?,
            ))),
            204 => Ok(FirstDtsRef::validate(self)?.map(TypedPacketRef::FirstDts)),
            _ => Ok(None),
        }
    }

    /// Parses as a sender report, if the type matches.
    pub fn as_sender_report(self) -> Result<Option<SenderReportRef<'a>>, String> {
        if self.payload_type() == 200 {
            return Ok(Some(SenderReportRef::validate(self)?));
        }
        Ok(None)
    }

    /// Parses as a first-DTS APP packet, if the type and name match.
    pub fn as_first_dts(self) -> Result<Option<FirstDtsRef<'a>>, String> {
        if self.payload_type() == 204 {
            return FirstDtsRef::validate(self);
        }
        Ok(None)
    }

    /// Returns true iff this packet has padding.
    #[inline]
    pub fn has_padding(&self) -> bool {
        (self.buf[0] & 0b0010_0000) != 0
    }

    /// Returns the low 5 bits of the first octet, which is typically a count
    /// or subtype.
    #[inline]
    pub fn count(&self) -> u8 {
        self.buf[0] & 0b0001_1111
    }

    /// Returns the full raw data, including headers.
    #[inline]
    pub fn raw(&self) -> &[u8] {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dahua() {
        // Sender report and source description from a Dahua camera.
        let buf = b"\x80\xc8\x00\x06\x66\x42\x6a\xe1\
                    \xe4\x36\x2f\x99\xcc\xcc\xcc\xcc\
                    \x85\x2e\xf8\x07\x00\x2a\x43\x33\
                    \x2f\x4c\x34\x1d\
                    \x81\xca\x00\x04\x66\x42\x6a\xe1\
                    \x01\x06\x28\x6e\x6f\x6e\x65\x29\
                    \x00\x00\x00\x00";
        let (pkt, buf) = PacketRef::parse(buf).unwrap();
        let sr = pkt.as_sender_report().unwrap().unwrap();
        assert_eq!(sr.ntp_timestamp(), crate::NtpTimestamp(0xe4362f99cccccccc));
        assert_eq!(sr.rtp_timestamp(), 0x852ef807);
        let (pkt, buf) = PacketRef::parse(buf).unwrap();
        assert_eq!(pkt.payload_type(), 202);
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn padding() {
        let buf = b"\xa7\x00\x00\x02asdf\x00\x00\x00\x04rest";
        let (pkt, rest) = PacketRef::parse(buf).unwrap();
        assert_eq!(pkt.count(), 7);
        assert_eq!(&pkt.buf[4..pkt.payload_end], b"asdf");
        assert_eq!(b"rest", rest);
    }

    #[test]
    fn first_dts_round_trip() {
        let buf = build_first_dts(0x1234_5678, 1_000_000);
        let (pkt, rest) = PacketRef::parse(&buf[..]).unwrap();
        assert!(rest.is_empty());
        let app = pkt.as_first_dts().unwrap().unwrap();
        assert_eq!(app.ssrc(), 0x1234_5678);
        assert_eq!(app.first_dts_millis(), 1_000_000);

        // The 90 kHz payload itself is exactly dts*90.
        assert_eq!(
            u64::from_be_bytes(buf[12..20].try_into().unwrap()),
            90_000_000
        );
    }

    #[test]
    fn foreign_app_packet_ignored() {
        let mut buf = build_first_dts(1, 1);
        buf[8..12].copy_from_slice(b"XXXX");
        let (pkt, _) = PacketRef::parse(&buf[..]).unwrap();
        assert!(pkt.as_first_dts().unwrap().is_none());
    }

    #[test]
    fn receiver_report() {
        let rr = ReceiverReportBuilder {
            ssrc: 1,
            source_ssrc: 2,
            extended_max_seq: 0x0001_0203,
            last_sr: 0x0a0b_0c0d,
            delay_since_last_sr: 65_536,
        }
        .build();
        let (pkt, rest) = PacketRef::parse(&rr[..]).unwrap();
        assert!(rest.is_empty());
        assert_eq!(pkt.count(), 1);
        match pkt.as_typed().unwrap().unwrap() {
            TypedPacketRef::ReceiverReport(rr) => assert_eq!(rr.ssrc(), 1),
            _ => panic!("expected RR"),
        }
        assert_eq!(&rr[8..12], &2u32.to_be_bytes());
        assert_eq!(&rr[12..16], &[0; 4]); // no loss reported.
        assert_eq!(&rr[16..20], &0x0001_0203u32.to_be_bytes());
        assert_eq!(&rr[28..32], &65_536u32.to_be_bytes());
    }
}
