// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [H.264](https://www.itu.int/rec/T-REC-H.264-201906-I/en)-encoded video,
//! packetized as specified in [RFC 6184](https://tools.ietf.org/html/rfc6184).
//!
//! The depacketizer accepts single NALs, STAP-A aggregates, and FU-A
//! fragments. The packetizer emits single NALs and FU-A fragments only; STAP
//! is never produced.

use std::convert::TryFrom;

use bytes::{Buf, Bytes};
use h264_reader::nal::{NalHeader, UnitType};

use crate::media::{Frame, VideoInfo};
use crate::rtp::{RawPacketBuilder, ReceivedPacket};

use super::VideoFrame;

/// Largest RTP packet (header plus payload) the packetizer will emit.
const MTU: usize = 1387;

const RTP_FIXED_HEADER_LEN: usize = 12;

/// Extra header bytes when the CTS extension is present.
const CTS_EXTENSION_LEN: usize = 8;

/// FU indicator type value, RFC 6184 section 5.8.
const FU_A: u8 = 28;

/// A depacketizer which finds access unit boundaries and produces
/// unfragmented NAL units.
///
/// This doesn't inspect the contents of the NAL units, so it doesn't depend
/// on or verify compliance with H.264 section 7.4.1.2.3 "Order of NAL units
/// and coded pictures and association to access units".
///
/// Currently expects that the stream starts at an access unit boundary unless
/// packet loss is indicated.
#[derive(Debug)]
pub(crate) struct Depacketizer {
    input_state: DepacketizerInputState,

    /// A complete video frame ready for pull.
    pending: Option<VideoFrame>,

    /// The out-of-band SPS NAL, used to notice in-band parameter changes.
    sps_nal: Option<Bytes>,

    /// The out-of-band PPS NAL.
    pps_nal: Option<Bytes>,

    /// In state `PreMark`, pieces of NALs, excluding their header bytes.
    /// Kept around (empty) in other states to re-use the backing allocation.
    pieces: Vec<Bytes>,

    /// In state `PreMark`, an entry for each NAL.
    /// Kept around (empty) in other states to re-use the backing allocation.
    nals: Vec<Nal>,
}

#[derive(Debug)]
struct Nal {
    hdr: NalHeader,

    /// The length of `Depacketizer::pieces` as this NAL finishes.
    next_piece_idx: u32,

    /// The total length of this NAL, including the header byte.
    len: u32,
}

/// An access unit that is currently being accumulated during `PreMark` state.
#[derive(Debug)]
struct AccessUnit {
    start_ctx: crate::PacketContext,
    end_ctx: crate::PacketContext,
    timestamp: crate::Timestamp,

    /// The composition time offset of the access unit's first packet.
    cts: Option<u32>,

    /// True iff currently processing a FU-A.
    in_fu_a: bool,

    /// RTP packets lost as this access unit was starting.
    loss: u16,
}

#[derive(Debug)]
enum DepacketizerInputState {
    /// Not yet processing an access unit.
    New,

    /// Ignoring the remainder of an access unit because of interior packet loss.
    Loss {
        timestamp: crate::Timestamp,
        pkts: u16,
    },

    /// Currently processing an access unit.
    /// This will be flushed after a marked packet or when receiving a later timestamp.
    PreMark(AccessUnit),

    /// Finished processing the given packet. It's an error to receive the same timestamp again.
    PostMark {
        timestamp: crate::Timestamp,
        loss: u16,
    },
}

impl Depacketizer {
    pub(super) fn new(clock_rate: u32, info: Option<&VideoInfo>) -> Result<Self, String> {
        if clock_rate != 90_000 {
            return Err(format!("H.264 clock rate must be 90000, got {clock_rate}"));
        }
        Ok(Depacketizer {
            input_state: DepacketizerInputState::New,
            pending: None,
            sps_nal: info.map(|i| i.sps.clone()),
            pps_nal: info.map(|i| i.pps.clone()),
            pieces: Vec::new(),
            nals: Vec::new(),
        })
    }

    pub(super) fn push(&mut self, pkt: ReceivedPacket) -> Result<(), String> {
        // Push shouldn't be called until pull is exhausted.
        if let Some(p) = self.pending.as_ref() {
            panic!("push with data already pending: {p:?}");
        }

        let seq = pkt.sequence_number();
        let mut access_unit =
            match std::mem::replace(&mut self.input_state, DepacketizerInputState::New) {
                DepacketizerInputState::New => {
                    debug_assert!(self.nals.is_empty());
                    debug_assert!(self.pieces.is_empty());
                    AccessUnit::start(&pkt, 0)
                }
                DepacketizerInputState::PreMark(mut access_unit) => {
                    if pkt.loss() > 0 {
                        if access_unit.timestamp.timestamp == pkt.timestamp().timestamp {
                            // Loss within this access unit. Ignore until mark or new timestamp.
                            self.nals.clear();
                            self.pieces.clear();
                            self.input_state = if pkt.mark() {
                                DepacketizerInputState::PostMark {
                                    timestamp: pkt.timestamp(),
                                    loss: pkt.loss(),
                                }
                            } else {
                                DepacketizerInputState::Loss {
                                    timestamp: pkt.timestamp(),
                                    pkts: pkt.loss(),
                                }
                            };
                            return Ok(());
                        }
                        // A suffix of a previous access unit was lost; discard it.
                        // A prefix of the new one may have been lost; try parsing.
                        AccessUnit::start(&pkt, 0)
                    } else if access_unit.timestamp.timestamp != pkt.timestamp().timestamp {
                        if access_unit.in_fu_a {
                            return Err(format!(
                                "timestamp changed from {} to {} in the middle of a fragmented NAL at seq={seq:04x}",
                                access_unit.timestamp,
                                pkt.timestamp()
                            ));
                        }
                        access_unit.end_ctx = *pkt.ctx();
                        self.pending = Some(self.finalize_access_unit(access_unit)?);
                        AccessUnit::start(&pkt, 0)
                    } else {
                        access_unit
                    }
                }
                DepacketizerInputState::PostMark {
                    timestamp: state_ts,
                    loss,
                } => {
                    debug_assert!(self.nals.is_empty());
                    debug_assert!(self.pieces.is_empty());
                    if state_ts.timestamp == pkt.timestamp().timestamp {
                        return Err(format!(
                            "received packet with timestamp {} after marked packet with same timestamp at seq={seq:04x}",
                            pkt.timestamp()
                        ));
                    }
                    AccessUnit::start(&pkt, loss)
                }
                DepacketizerInputState::Loss {
                    timestamp,
                    mut pkts,
                } => {
                    debug_assert!(self.nals.is_empty());
                    debug_assert!(self.pieces.is_empty());
                    if pkt.timestamp().timestamp == timestamp.timestamp {
                        pkts += pkt.loss();
                        self.input_state = DepacketizerInputState::Loss { timestamp, pkts };
                        return Ok(());
                    }
                    AccessUnit::start(&pkt, pkts)
                }
            };

        let ctx = *pkt.ctx();
        let mark = pkt.mark();
        let loss = pkt.loss();
        let timestamp = pkt.timestamp();
        let mut data = pkt.into_payload_bytes();
        if data.is_empty() {
            return Err(format!("empty NAL at RTP seq {seq:04x}"));
        }
        // https://tools.ietf.org/html/rfc6184#section-5.2
        let nal_header = data[0];
        if (nal_header >> 7) != 0 {
            return Err(format!("NAL header {nal_header:02x} has F bit set at seq {seq:04x}"));
        }
        data.advance(1); // skip the header byte.
        match nal_header & 0b11111 {
            1..=23 => {
                if access_unit.in_fu_a {
                    return Err(format!(
                        "non-fragmented NAL while fragment in progress at seq {seq:04x}"
                    ));
                }
                let len = u32::try_from(data.len()).expect("data len < u16::MAX") + 1;
                let next_piece_idx = self.add_piece(data)?;
                self.nals.push(Nal {
                    hdr: NalHeader::new(nal_header).expect("header w/o F bit set is valid"),
                    next_piece_idx,
                    len,
                });
            }
            24 => {
                // STAP-A. https://tools.ietf.org/html/rfc6184#section-5.7.1
                loop {
                    if data.remaining() < 2 {
                        return Err(format!(
                            "STAP-A has {} remaining bytes while expecting 2-byte length",
                            data.remaining()
                        ));
                    }
                    let len = data.get_u16();
                    if len == 0 {
                        return Err("zero length in STAP-A".into());
                    }
                    let hdr = NalHeader::new(data[0])
                        .map_err(|_| format!("bad header {:02x} in STAP-A", data[0]))?;
                    match data.remaining().cmp(&usize::from(len)) {
                        std::cmp::Ordering::Less => {
                            return Err(format!(
                                "STAP-A too short: {} bytes remaining, expecting {len}-byte NAL",
                                data.remaining()
                            ))
                        }
                        std::cmp::Ordering::Equal => {
                            data.advance(1);
                            let next_piece_idx = self.add_piece(data)?;
                            self.nals.push(Nal {
                                hdr,
                                next_piece_idx,
                                len: u32::from(len),
                            });
                            break;
                        }
                        std::cmp::Ordering::Greater => {
                            let mut piece = data.split_to(usize::from(len));
                            piece.advance(1);
                            let next_piece_idx = self.add_piece(piece)?;
                            self.nals.push(Nal {
                                hdr,
                                next_piece_idx,
                                len: u32::from(len),
                            });
                        }
                    }
                }
            }
            25..=27 | 29 => {
                return Err(format!(
                    "unimplemented NAL (header 0x{nal_header:02x}) at seq {seq:04x}"
                ))
            }
            28 => {
                // FU-A. https://tools.ietf.org/html/rfc6184#section-5.8
                if data.len() < 2 {
                    return Err(format!("FU-A is too short at seq {seq:04x}"));
                }
                let fu_header = data[0];
                let start = (fu_header & 0b10000000) != 0;
                let end = (fu_header & 0b01000000) != 0;
                let reserved = (fu_header & 0b00100000) != 0;
                let nal_header = NalHeader::new((nal_header & 0b01100000) | (fu_header & 0b00011111))
                    .expect("NalHeader is valid");
                data.advance(1);
                if (start && end) || reserved {
                    return Err(format!("invalid FU-A header {fu_header:08b} at seq {seq:04x}"));
                }
                let u32_len = u32::try_from(data.len()).expect("RTP packet len must be < u16::MAX");
                match (start, access_unit.in_fu_a) {
                    (true, true) => {
                        return Err(format!(
                            "FU-A with start bit while frag in progress at seq {seq:04x}"
                        ))
                    }
                    (true, false) => {
                        self.add_piece(data)?;
                        self.nals.push(Nal {
                            hdr: nal_header,
                            next_piece_idx: u32::MAX, // should be overwritten later.
                            len: 1 + u32_len,
                        });
                        access_unit.in_fu_a = true;
                    }
                    (false, true) => {
                        let pieces = self.add_piece(data)?;
                        let nal = self.nals.last_mut().expect("nals non-empty while in fu-a");
                        if u8::from(nal_header) != u8::from(nal.hdr) {
                            return Err(format!(
                                "FU-A has inconsistent NAL type: {:?} then {:?} at seq {seq:04x}",
                                nal.hdr, nal_header,
                            ));
                        }
                        nal.len += u32_len;
                        if end {
                            nal.next_piece_idx = pieces;
                            access_unit.in_fu_a = false;
                        } else if mark {
                            return Err(format!("FU-A with MARK and no END at seq {seq:04x}"));
                        }
                    }
                    (false, false) => {
                        if loss > 0 {
                            self.pieces.clear();
                            self.nals.clear();
                            self.input_state = DepacketizerInputState::Loss {
                                timestamp,
                                pkts: loss,
                            };
                            return Ok(());
                        }
                        return Err(format!(
                            "FU-A with start bit unset while no frag in progress at seq {seq:04x}"
                        ));
                    }
                }
            }
            _ => return Err(format!("bad nal header {nal_header:02x} at seq {seq:04x}")),
        }
        self.input_state = if mark {
            access_unit.end_ctx = ctx;
            self.pending = Some(self.finalize_access_unit(access_unit)?);
            DepacketizerInputState::PostMark { timestamp, loss: 0 }
        } else {
            DepacketizerInputState::PreMark(access_unit)
        };
        Ok(())
    }

    pub(super) fn pull(&mut self) -> Option<super::CodecItem> {
        self.pending.take().map(super::CodecItem::VideoFrame)
    }

    /// Adds a piece to `self.pieces`, erroring if it becomes absurdly large.
    fn add_piece(&mut self, piece: Bytes) -> Result<u32, String> {
        self.pieces.push(piece);
        u32::try_from(self.pieces.len()).map_err(|_| "more than u32::MAX pieces!".to_string())
    }

    fn finalize_access_unit(&mut self, au: AccessUnit) -> Result<VideoFrame, String> {
        let mut piece_idx = 0;
        let mut retained_len = 0usize;
        let mut is_random_access_point = false;
        let mut is_disposable = true;
        let mut new_sps = None;
        let mut new_pps = None;
        for nal in &self.nals {
            let next_piece_idx = usize::try_from(nal.next_piece_idx).expect("u32 fits in usize");
            let nal_pieces = &self.pieces[piece_idx..next_piece_idx];
            match nal.hdr.nal_unit_type() {
                UnitType::SeqParameterSet => {
                    if !matches(self.sps_nal.as_deref(), nal.hdr, nal_pieces) {
                        new_sps = Some(to_bytes(nal.hdr, nal.len, nal_pieces));
                    }
                }
                UnitType::PicParameterSet => {
                    if !matches(self.pps_nal.as_deref(), nal.hdr, nal_pieces) {
                        new_pps = Some(to_bytes(nal.hdr, nal.len, nal_pieces));
                    }
                }
                UnitType::SliceLayerWithoutPartitioningIdr => is_random_access_point = true,
                _ => {}
            }
            if nal.hdr.nal_ref_idc() != 0 {
                is_disposable = false;
            }
            retained_len += 4usize + usize::try_from(nal.len).expect("u32 fits in usize");
            piece_idx = next_piece_idx;
        }
        let mut data = Vec::with_capacity(retained_len);
        piece_idx = 0;
        for nal in &self.nals {
            let next_piece_idx = usize::try_from(nal.next_piece_idx).expect("u32 fits in usize");
            let nal_pieces = &self.pieces[piece_idx..next_piece_idx];
            data.extend_from_slice(&nal.len.to_be_bytes()[..]);
            data.push(nal.hdr.into());
            let mut actual_len = 1;
            for piece in nal_pieces {
                data.extend_from_slice(&piece[..]);
                actual_len += piece.len();
            }
            debug_assert_eq!(
                usize::try_from(nal.len).expect("u32 fits in usize"),
                actual_len
            );
            piece_idx = next_piece_idx;
        }
        debug_assert_eq!(retained_len, data.len());
        self.nals.clear();
        self.pieces.clear();

        let has_new_parameters = new_sps.is_some() || new_pps.is_some();
        if let Some(sps) = new_sps {
            self.sps_nal = Some(sps);
        }
        if let Some(pps) = new_pps {
            self.pps_nal = Some(pps);
        }
        Ok(VideoFrame {
            has_new_parameters,
            loss: au.loss,
            start_ctx: au.start_ctx,
            end_ctx: au.end_ctx,
            timestamp: au.timestamp,
            cts: au.cts,
            is_random_access_point,
            is_disposable,
            data,
        })
    }
}

impl AccessUnit {
    fn start(pkt: &ReceivedPacket, additional_loss: u16) -> Self {
        AccessUnit {
            start_ctx: *pkt.ctx(),
            end_ctx: *pkt.ctx(),
            timestamp: pkt.timestamp(),
            cts: pkt.cts(),
            in_fu_a: false,
            loss: pkt.loss() + additional_loss,
        }
    }
}

/// Returns true iff the bytes of `nal` equal the bytes of `[hdr, ..pieces]`.
///
/// With no out-of-band NAL to compare against, in-band parameters are
/// presumed unchanged.
fn matches(nal: Option<&[u8]>, hdr: NalHeader, pieces: &[Bytes]) -> bool {
    let Some(nal) = nal else {
        return true;
    };
    if nal.is_empty() || nal[0] != u8::from(hdr) {
        return false;
    }
    let mut nal_pos = 1;
    for piece in pieces {
        let new_pos = nal_pos + piece.len();
        if nal.len() < new_pos {
            return false;
        }
        if piece[..] != nal[nal_pos..new_pos] {
            return false;
        }
        nal_pos = new_pos;
    }
    nal_pos == nal.len()
}

/// Saves the given NAL to a contiguous Bytes.
fn to_bytes(hdr: NalHeader, len: u32, pieces: &[Bytes]) -> Bytes {
    let len = usize::try_from(len).expect("u32 fits in usize");
    let mut out = Vec::with_capacity(len);
    out.push(hdr.into());
    for piece in pieces {
        out.extend_from_slice(&piece[..]);
    }
    debug_assert_eq!(len, out.len());
    out.into()
}

/// Packetizes AVCC-form access units into RTP packets, fragmenting NALs that
/// don't fit in [`MTU`] as FU-A.
#[derive(Debug)]
pub(crate) struct Packetizer {
    ssrc: u32,

    /// Clock-rate ticks per millisecond of DTS.
    scale: f64,

    /// Bytes in each NAL length prefix of the incoming frame data.
    length_size: usize,

    next_seq: u16,
}

impl Packetizer {
    pub(super) fn new(ssrc: u32, timescale: u32, length_size: usize) -> Result<Self, String> {
        if length_size != 2 && length_size != 4 {
            return Err(format!("H.264 length size must be 2 or 4, got {length_size}"));
        }
        if timescale == 0 {
            return Err("H.264 timescale must be non-zero".into());
        }
        Ok(Packetizer {
            ssrc,
            scale: f64::from(timescale) / 1_000.0,
            length_size,
            next_seq: 0,
        })
    }

    pub(super) fn packetize(&mut self, frame: &Frame) -> Result<Vec<Bytes>, String> {
        let timestamp = ((frame.dts as f64) * self.scale).round() as i64 as u32;
        let cts_ticks = (((frame.pts - frame.dts) as f64) * self.scale).round() as i64 as u32;
        let cts = if cts_ticks == 0 { None } else { Some(cts_ticks) };

        // Split the frame body into NALs by length prefix.
        let mut nals = Vec::new();
        let mut body = &frame.data[..];
        while !body.is_empty() {
            if body.len() < self.length_size {
                return Err(format!(
                    "truncated NAL length prefix: {} bytes left",
                    body.len()
                ));
            }
            let len = match self.length_size {
                2 => usize::from(u16::from_be_bytes([body[0], body[1]])),
                4 => usize::try_from(u32::from_be_bytes([body[0], body[1], body[2], body[3]]))
                    .expect("u32 fits in usize"),
                _ => unreachable!(),
            };
            body = &body[self.length_size..];
            if body.len() < len || len == 0 {
                return Err(format!(
                    "bad NAL length {len} with {} bytes left",
                    body.len()
                ));
            }
            nals.push(&body[..len]);
            body = &body[len..];
        }
        if nals.is_empty() {
            return Err("access unit with no NALs".into());
        }

        let mut out = Vec::new();
        let last_nal_idx = nals.len() - 1;
        for (i, nal) in nals.iter().enumerate() {
            let end_of_au = i == last_nal_idx;
            let header_len = RTP_FIXED_HEADER_LEN + if cts.is_some() { CTS_EXTENSION_LEN } else { 0 };
            if nal.len() + header_len <= MTU {
                out.push(self.emit(timestamp, cts, end_of_au, nal.to_vec())?);
            } else {
                self.fragment(timestamp, cts, end_of_au, nal, MTU - header_len - 2, &mut out)?;
            }
        }
        Ok(out)
    }

    /// Emits the FU-A fragments of one NAL, RFC 6184 section 5.8.
    fn fragment(
        &mut self,
        timestamp: u32,
        cts: Option<u32>,
        end_of_au: bool,
        nal: &[u8],
        max_fragment: usize,
        out: &mut Vec<Bytes>,
    ) -> Result<(), String> {
        let hdr = nal[0];
        let fu_indicator = (hdr & 0b0110_0000) | FU_A;
        let mut rest = &nal[1..];
        let mut first = true;
        while !rest.is_empty() {
            let take = std::cmp::min(rest.len(), max_fragment);
            let end = take == rest.len();
            let fu_header = (hdr & 0b0001_1111)
                | if first { 0b1000_0000 } else { 0 }
                | if end { 0b0100_0000 } else { 0 };
            let mut payload = Vec::with_capacity(2 + take);
            payload.push(fu_indicator);
            payload.push(fu_header);
            payload.extend_from_slice(&rest[..take]);
            out.push(self.emit(timestamp, cts, end && end_of_au, payload)?);
            rest = &rest[take..];
            first = false;
        }
        Ok(())
    }

    fn emit(
        &mut self,
        timestamp: u32,
        cts: Option<u32>,
        mark: bool,
        payload: Vec<u8>,
    ) -> Result<Bytes, String> {
        let (raw, _) = RawPacketBuilder {
            sequence_number: self.next_seq,
            timestamp,
            payload_type: super::VIDEO_PAYLOAD_TYPE,
            ssrc: self.ssrc,
            mark,
            cts,
        }
        .build(payload)?;
        self.next_seq = self.next_seq.wrapping_add(1);
        Ok(raw.0)
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use bytes::Bytes;

    use super::*;
    use crate::codec::CodecItem;
    use crate::media::FrameKind;
    use crate::rtp::{RawPacket, ReceivedPacketBuilder};
    use crate::PacketContext;

    fn ts(timestamp: i64) -> crate::Timestamp {
        crate::Timestamp {
            timestamp,
            clock_rate: NonZeroU32::new(90_000).unwrap(),
            start: 0,
        }
    }

    fn push(
        d: &mut Depacketizer,
        sequence_number: u16,
        timestamp: i64,
        mark: bool,
        payload: &[u8],
    ) {
        d.push(
            ReceivedPacketBuilder {
                ctx: PacketContext::dummy(),
                channel_id: 0,
                sequence_number,
                timestamp: ts(timestamp),
                payload_type: 96,
                ssrc: 0,
                mark,
                loss: 0,
                cts: None,
            }
            .build(payload)
            .unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn depacketize() {
        let mut d = Depacketizer::new(90_000, None).unwrap();
        push(&mut d, 0, 0, false, b"\x06plain"); // plain SEI packet.
        assert!(d.pull().is_none());
        push(
            &mut d,
            1,
            0,
            false,
            b"\x18\x00\x09\x06stap-a 1\x00\x09\x06stap-a 2",
        );
        assert!(d.pull().is_none());
        push(&mut d, 2, 0, false, b"\x7c\x86fu-a start, ");
        assert!(d.pull().is_none());
        push(&mut d, 3, 0, false, b"\x7c\x06fu-a middle, ");
        assert!(d.pull().is_none());
        push(&mut d, 4, 0, true, b"\x7c\x46fu-a end");
        let frame = match d.pull() {
            Some(CodecItem::VideoFrame(frame)) => frame,
            _ => panic!(),
        };
        assert_eq!(
            frame.data(),
            &b"\x00\x00\x00\x06\x06plain\
               \x00\x00\x00\x09\x06stap-a 1\
               \x00\x00\x00\x09\x06stap-a 2\
               \x00\x00\x00\x22\x66fu-a start, fu-a middle, fu-a end"[..]
        );
    }

    #[test]
    fn depacketize_parameter_change() {
        let sps = Bytes::from_static(b"\x67\x4d\x00\x1e\x95\xa8\x2d\x0f\x69\xb8\x08\x08\x08\x10");
        let pps = Bytes::from_static(b"\x68\xee\x3c\x80");
        let info = VideoInfo {
            timescale: 90_000,
            length_size: 4,
            sps,
            pps,
        };
        let mut d = Depacketizer::new(90_000, Some(&info)).unwrap();

        // Same PPS: no parameter change.
        push(&mut d, 0, 0, true, b"\x68\xee\x3c\x80");
        let frame = match d.pull() {
            Some(CodecItem::VideoFrame(frame)) => frame,
            _ => panic!(),
        };
        assert!(!frame.has_new_parameters());

        // A different SPS: parameter change.
        push(&mut d, 1, 3_000, true, b"\x67\x4d\x40\x1e\xff");
        let frame = match d.pull() {
            Some(CodecItem::VideoFrame(frame)) => frame,
            _ => panic!(),
        };
        assert!(frame.has_new_parameters());
    }

    fn avcc(nals: &[&[u8]]) -> Bytes {
        let mut out = Vec::new();
        for nal in nals {
            out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
            out.extend_from_slice(nal);
        }
        out.into()
    }

    #[test]
    fn packetize_single() {
        let mut p = Packetizer::new(0, 90_000, 4).unwrap();
        let frame = Frame {
            kind: FrameKind::Video { keyframe: false },
            dts: 1_000,
            pts: 1_000,
            data: avcc(&[b"\x06sei", b"\x41slice"]),
        };
        let pkts = p.packetize(&frame).unwrap();
        assert_eq!(pkts.len(), 2);
        let (first, first_range) = RawPacket::new(pkts[0].clone()).unwrap();
        assert_eq!(first.timestamp(), 90_000);
        assert_eq!(first.payload_type(), 96);
        assert!(!first.mark());
        assert_eq!(first.cts(), None);
        assert_eq!(usize::from(first_range.start), 12);
        let (last, _) = RawPacket::new(pkts[1].clone()).unwrap();
        assert!(last.mark());
        assert_eq!(last.sequence_number(), 1);
    }

    #[test]
    fn packetize_cts_extension() {
        let mut p = Packetizer::new(0, 90_000, 4).unwrap();
        let frame = Frame {
            kind: FrameKind::Video { keyframe: false },
            dts: 1_000,
            pts: 1_040,
            data: avcc(&[b"\x41slice"]),
        };
        let pkts = p.packetize(&frame).unwrap();
        assert_eq!(pkts.len(), 1);
        let (pkt, _) = RawPacket::new(pkts[0].clone()).unwrap();
        assert_eq!(pkt.cts(), Some(3_600)); // 40 ms at 90 kHz.
    }

    #[test]
    fn fragmentation_round_trip() {
        // A NAL bigger than the MTU must come out as multiple FU-A packets
        // whose reassembly equals the input, with exactly one marked packet.
        let mut nal = vec![0x65u8]; // IDR slice.
        nal.extend((0..4_000u32).map(|i| i as u8));
        let mut p = Packetizer::new(7, 90_000, 4).unwrap();
        let frame = Frame {
            kind: FrameKind::Video { keyframe: true },
            dts: 0,
            pts: 0,
            data: avcc(&[&nal]),
        };
        let pkts = p.packetize(&frame).unwrap();
        assert!(pkts.len() > 1);
        for pkt in &pkts {
            assert!(pkt.len() <= MTU);
        }
        assert_eq!(pkts.iter().filter(|p| p[1] & 0b1000_0000 != 0).count(), 1);

        let mut d = Depacketizer::new(90_000, None).unwrap();
        let mut frames = Vec::new();
        for (i, pkt) in pkts.iter().enumerate() {
            let (raw, range) = RawPacket::new(pkt.clone()).unwrap();
            d.push(
                ReceivedPacketBuilder {
                    ctx: PacketContext::dummy(),
                    channel_id: 0,
                    sequence_number: raw.sequence_number(),
                    timestamp: ts(i64::from(raw.timestamp())),
                    payload_type: 96,
                    ssrc: 7,
                    mark: raw.mark(),
                    loss: 0,
                    cts: None,
                }
                .build(&raw.0[usize::from(range.start)..usize::from(range.end)])
                .unwrap(),
            )
            .unwrap();
            while let Some(CodecItem::VideoFrame(f)) = d.pull() {
                frames.push(f);
            }
        }
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_random_access_point());
        assert_eq!(frames[0].data(), &avcc(&[&nal])[..]);
    }
}
