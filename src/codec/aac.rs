// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! AAC (Advanced Audio Codec) packetization and depacketization per
//! [RFC 3640](https://datatracker.ietf.org/doc/html/rfc3640), AAC-hbr mode:
//! `sizelength=13`, `indexlength=3`, `indexdeltalength=3`.

use bitstream_io::BitRead;
use bytes::{Bytes, BytesMut};
use std::num::{NonZeroU16, NonZeroU32};

use crate::media::{AudioInfo, Frame};
use crate::rtp::{RawPacketBuilder, ReceivedPacket};

use super::CodecItem;

/// Frames are held back this long at most waiting for batch mates.
const MAX_BATCH_AGE_MILLIS: i64 = 150;

/// At most this many access units share one RTP packet.
const MAX_BATCHED_FRAMES: usize = 4;

/// The largest size expressible in a 13-bit AU header.
const MAX_AU_SIZE: usize = (1 << 13) - 1;

/// Samples per frame when no AudioSpecificConfig is available.
const DEFAULT_FRAME_LENGTH: u16 = 1024;

/// The fields of an AudioSpecificConfig (ISO/IEC 14496-3 section 1.6.2.1)
/// this crate cares about.
#[derive(Clone, Debug)]
struct AudioSpecificConfig {
    frame_length: NonZeroU16,
    sampling_frequency: u32,
    channels: u16,
}

impl AudioSpecificConfig {
    /// Parses from raw bytes.
    fn parse(raw: &[u8]) -> Result<Self, String> {
        let mut r = bitstream_io::BitReader::endian(raw, bitstream_io::BigEndian);
        let audio_object_type = match r
            .read::<u8>(5)
            .map_err(|e| format!("unable to read audio_object_type: {e}"))?
        {
            31 => {
                32 + r
                    .read::<u8>(6)
                    .map_err(|e| format!("unable to read audio_object_type ext: {e}"))?
            }
            o => o,
        };

        // ISO/IEC 14496-3 section 1.6.3.3.
        let sampling_frequency = match r
            .read::<u8>(4)
            .map_err(|e| format!("unable to read sampling_frequency: {e}"))?
        {
            0x0 => 96_000,
            0x1 => 88_200,
            0x2 => 64_000,
            0x3 => 48_000,
            0x4 => 44_100,
            0x5 => 32_000,
            0x6 => 24_000,
            0x7 => 22_050,
            0x8 => 16_000,
            0x9 => 12_000,
            0xa => 11_025,
            0xb => 8_000,
            0xc => 7_350,
            v @ 0xd | v @ 0xe => {
                return Err(format!("reserved sampling_frequency_index value 0x{v:x}"))
            }
            0xf => r
                .read::<u32>(24)
                .map_err(|e| format!("unable to read sampling_frequency ext: {e}"))?,
            0x10..=0xff => unreachable!(),
        };
        let channels_config_id = r
            .read::<u8>(4)
            .map_err(|e| format!("unable to read channels: {e}"))?;
        // ISO/IEC 14496-3 Table 1.19; config 7 means 7.1.
        let channels = match channels_config_id {
            c @ 1..=6 => u16::from(c),
            7 => 8,
            c => return Err(format!("unsupported channelConfiguration {c}")),
        };

        // The supported types here are the ones that use GASpecificConfig.
        match audio_object_type {
            1 | 2 | 3 | 4 | 6 | 7 | 17 | 19 | 20 | 21 | 22 | 23 => {}
            o => return Err(format!("unsupported audio_object_type {o}")),
        }

        // GASpecificConfig, ISO/IEC 14496-3 section 4.4.1.
        let frame_length_flag = r
            .read_bit()
            .map_err(|e| format!("unable to read frame_length_flag: {e}"))?;
        let frame_length = match (audio_object_type, frame_length_flag) {
            (3 /* AAC SR */, false) => NonZeroU16::new(256).expect("non-zero"),
            (3 /* AAC SR */, true) => {
                return Err("frame_length_flag must be false for AAC SSR".into())
            }
            (23 /* ER AAC LD */, false) => NonZeroU16::new(512).expect("non-zero"),
            (23 /* ER AAC LD */, true) => NonZeroU16::new(480).expect("non-zero"),
            (_, false) => NonZeroU16::new(1024).expect("non-zero"),
            (_, true) => NonZeroU16::new(960).expect("non-zero"),
        };

        Ok(AudioSpecificConfig {
            frame_length,
            sampling_frequency,
            channels,
        })
    }
}

#[derive(Debug)]
pub(crate) struct Depacketizer {
    frame_length: NonZeroU16,
    state: DepacketizerState,
}

/// [`DepacketizerState`] holding access units within a single RTP packet.
///
/// This is the state used when there are multiple access units within a packet
/// (thus the name), when there's a single access unit, and even at the
/// beginning of a fragment.
#[derive(Debug)]
struct Aggregate {
    pkt: ReceivedPacket,

    /// RTP packets lost before the next frame in this aggregate. Includes old
    /// loss that caused a previous fragment to be too short.
    /// This should be 0 when `frame_i > 0`.
    loss: u16,

    /// True iff there was loss immediately before the packet that started this
    /// aggregate. The distinction between old and recent loss is relevant
    /// because only the latter should be capable of causing following fragments
    /// to be too short.
    loss_since_mark: bool,

    /// The index in range `[0, frame_count)` of the next frame to return from `pull`.
    frame_i: u16,

    /// The total non-zero total frames within this aggregate (including ones
    /// which have already been returned by `pull`).
    frame_count: u16,

    /// The starting byte offset of `frame_i`'s data within `pkt.payload()`.
    data_off: usize,
}

/// The received prefix of a single access unit which has been spread across
/// multiple packets.
#[derive(Debug)]
struct Fragment {
    rtp_timestamp: u16,

    /// Number of RTP packets lost between the previous output AudioFrame
    /// and now.
    loss: u16,

    /// True iff packets have been lost since the last mark. If so, this
    /// fragment may be incomplete.
    loss_since_mark: bool,

    size: u16,
    buf: BytesMut,
}

/// State of the depacketizer between calls to `push` and `pull`.
#[derive(Debug)]
enum DepacketizerState {
    /// State when there's no buffered data.
    Idle {
        prev_loss: u16,
        loss_since_mark: bool,
    },

    /// State after an RTP packet has been received. As described at
    /// [`Aggregate`], this may hold the first packet of a fragment, one
    /// packet, or multiple complete packets.
    Aggregated(Aggregate),

    /// State when a prefix of a fragmented packet has been received.
    Fragmented(Fragment),

    Ready(super::AudioFrame),
}

impl Default for DepacketizerState {
    fn default() -> Self {
        DepacketizerState::Idle {
            prev_loss: 0,
            loss_since_mark: false,
        }
    }
}

impl Depacketizer {
    pub(super) fn new(clock_rate: u32, info: Option<&AudioInfo>) -> Result<Self, String> {
        let frame_length = match info {
            Some(info) => {
                let config = AudioSpecificConfig::parse(&info.config)?;
                if clock_rate != config.sampling_frequency {
                    return Err(format!(
                        "expected RTP clock rate {} and AAC sampling frequency {} to match",
                        clock_rate, config.sampling_frequency,
                    ));
                }
                if matches!(info.channels, Some(c) if c != config.channels) {
                    return Err(format!(
                        "expected RTP channels {:?} and AAC channels {} to match",
                        info.channels, config.channels
                    ));
                }
                config.frame_length
            }
            None => NonZeroU16::new(DEFAULT_FRAME_LENGTH).expect("non-zero"),
        };
        Ok(Self {
            frame_length,
            state: DepacketizerState::default(),
        })
    }

    pub(super) fn push(&mut self, pkt: ReceivedPacket) -> Result<(), String> {
        if pkt.loss() > 0 {
            if let DepacketizerState::Fragmented(ref f) = self.state {
                log::debug!(
                    "Discarding in-progress fragmented AAC frame due to loss of {} RTP packets.",
                    pkt.loss(),
                );
                self.state = DepacketizerState::Idle {
                    prev_loss: f.loss, // note this packet's loss will be added in later.
                    loss_since_mark: true,
                };
            }
        }

        // Read the AU headers.
        let payload = pkt.payload();
        if payload.len() < 2 {
            return Err("packet too short for au-header-length".to_string());
        }
        let au_headers_length_bits = u16::from_be_bytes([payload[0], payload[1]]);

        // AAC-hbr requires 16-bit AU headers: 13-bit size, 3-bit index.
        if (au_headers_length_bits & 0x7) != 0 {
            return Err(format!("bad au-headers-length {au_headers_length_bits}"));
        }
        let au_headers_count = au_headers_length_bits >> 4;
        let data_off = 2 + (usize::from(au_headers_count) << 1);
        if payload.len() < data_off {
            return Err("packet too short for au-headers".to_string());
        }
        match &mut self.state {
            DepacketizerState::Fragmented(ref mut frag) => {
                if au_headers_count != 1 {
                    return Err(format!(
                        "Got {au_headers_count}-AU packet while fragment in progress"
                    ));
                }
                if (pkt.timestamp().timestamp as u16) != frag.rtp_timestamp {
                    return Err(format!(
                        "Timestamp changed from 0x{:04x} to 0x{:04x} mid-fragment",
                        frag.rtp_timestamp,
                        pkt.timestamp().timestamp as u16
                    ));
                }
                let au_header = u16::from_be_bytes([payload[2], payload[3]]);
                let size = usize::from(au_header >> 3);
                if size != usize::from(frag.size) {
                    return Err(format!("size changed {}->{} mid-fragment", frag.size, size));
                }
                let data = &payload[data_off..];
                match (frag.buf.len() + data.len()).cmp(&size) {
                    std::cmp::Ordering::Less => {
                        if pkt.mark() {
                            if frag.loss_since_mark {
                                self.state = DepacketizerState::Idle {
                                    prev_loss: frag.loss,
                                    loss_since_mark: false,
                                };
                                return Ok(());
                            }
                            return Err(format!(
                                "frag marked complete when {}+{}<{}",
                                frag.buf.len(),
                                data.len(),
                                size
                            ));
                        }
                        frag.buf.extend_from_slice(data);
                    }
                    std::cmp::Ordering::Equal => {
                        if !pkt.mark() {
                            return Err(
                                "frag not marked complete when full data present".to_string()
                            );
                        }
                        frag.buf.extend_from_slice(data);
                        self.state = DepacketizerState::Ready(super::AudioFrame {
                            ctx: *pkt.ctx(),
                            loss: frag.loss,
                            frame_length: NonZeroU32::from(self.frame_length),
                            timestamp: pkt.timestamp(),
                            data: std::mem::take(&mut frag.buf).freeze(),
                        });
                    }
                    std::cmp::Ordering::Greater => return Err("too much data in fragment".into()),
                }
            }
            DepacketizerState::Aggregated(_) => panic!("push when already in state aggregated"),
            DepacketizerState::Idle {
                prev_loss,
                loss_since_mark,
            } => {
                if au_headers_count == 0 {
                    return Err("aggregate with no headers".to_string());
                }
                let loss = pkt.loss();
                self.state = DepacketizerState::Aggregated(Aggregate {
                    pkt,
                    loss: *prev_loss + loss,
                    loss_since_mark: *loss_since_mark || loss > 0,
                    frame_i: 0,
                    frame_count: au_headers_count,
                    data_off,
                });
            }
            DepacketizerState::Ready(..) => panic!("push when in state ready"),
        }
        Ok(())
    }

    pub(super) fn pull(&mut self) -> Result<Option<CodecItem>, String> {
        match std::mem::take(&mut self.state) {
            s @ DepacketizerState::Idle { .. } | s @ DepacketizerState::Fragmented(..) => {
                self.state = s;
                Ok(None)
            }
            DepacketizerState::Ready(f) => {
                self.state = DepacketizerState::default();
                Ok(Some(CodecItem::AudioFrame(f)))
            }
            DepacketizerState::Aggregated(mut agg) => {
                let i = usize::from(agg.frame_i);
                let payload = agg.pkt.payload();
                let mark = agg.pkt.mark();
                let au_header = u16::from_be_bytes([payload[2 + (i << 1)], payload[3 + (i << 1)]]);
                let size = usize::from(au_header >> 3);
                let index = au_header & 0b111;
                if index != 0 {
                    // First AU's index must be zero; subsequent AU's deltas > 1
                    // indicate interleaving, which isn't supported.
                    return Err("interleaved AUs are not supported".to_string());
                }
                if size > payload.len() - agg.data_off {
                    // Start of a fragment.
                    if agg.frame_count != 1 {
                        return Err("fragmented AUs must not share packets".to_string());
                    }
                    if mark {
                        if agg.loss_since_mark {
                            log::debug!(
                                "Discarding in-progress fragmented AAC frame due to loss of {} RTP packets.",
                                agg.loss
                            );
                            self.state = DepacketizerState::Idle {
                                prev_loss: agg.loss,
                                loss_since_mark: false,
                            };
                            return Ok(None);
                        }
                        return Err("mark can't be set on beginning of fragment".to_string());
                    }
                    let mut buf = BytesMut::with_capacity(size);
                    buf.extend_from_slice(&payload[agg.data_off..]);
                    self.state = DepacketizerState::Fragmented(Fragment {
                        rtp_timestamp: agg.pkt.timestamp().timestamp as u16,
                        loss: agg.loss,
                        loss_since_mark: agg.loss_since_mark,
                        size: size as u16,
                        buf,
                    });
                    return Ok(None);
                }
                if !mark {
                    return Err("mark must be set on non-fragmented au".to_string());
                }

                let delta = u32::from(agg.frame_i) * u32::from(self.frame_length.get());
                let agg_timestamp = agg.pkt.timestamp();
                let frame = super::AudioFrame {
                    ctx: *agg.pkt.ctx(),
                    loss: agg.loss,
                    frame_length: NonZeroU32::from(self.frame_length),

                    // u16 * u16 can't overflow u32, but i64 + u32 can overflow i64.
                    timestamp: agg_timestamp.try_add(delta).ok_or_else(|| {
                        format!("aggregate timestamp {agg_timestamp} + {delta} overflows")
                    })?,
                    data: Bytes::copy_from_slice(&payload[agg.data_off..agg.data_off + size]),
                };
                agg.loss = 0;
                agg.data_off += size;
                agg.frame_i += 1;
                if agg.frame_i < agg.frame_count {
                    self.state = DepacketizerState::Aggregated(agg);
                }
                Ok(Some(CodecItem::AudioFrame(frame)))
            }
        }
    }
}

/// Packetizes AAC access units, batching a few consecutive frames per packet.
///
/// Frames are buffered until [`MAX_BATCHED_FRAMES`] are pending or a new
/// frame arrives more than [`MAX_BATCH_AGE_MILLIS`] after the first pending
/// one. Call [`Packetizer::flush`] on teardown so the tail isn't dropped.
#[derive(Debug)]
pub(crate) struct Packetizer {
    ssrc: u32,

    /// Clock-rate ticks per millisecond of DTS.
    scale: f64,

    next_seq: u16,
    pending: Vec<(i64, Bytes)>,
}

impl Packetizer {
    pub(super) fn new(ssrc: u32, timescale: u32) -> Result<Self, String> {
        if timescale == 0 {
            return Err("AAC timescale must be non-zero".into());
        }
        Ok(Packetizer {
            ssrc,
            scale: f64::from(timescale) / 1_000.0,
            next_seq: 0,
            pending: Vec::with_capacity(MAX_BATCHED_FRAMES),
        })
    }

    pub(super) fn packetize(&mut self, frame: &Frame) -> Result<Vec<Bytes>, String> {
        if frame.data.len() > MAX_AU_SIZE {
            return Err(format!(
                "AAC access unit of {} bytes exceeds the 13-bit AU size field",
                frame.data.len()
            ));
        }
        let mut out = Vec::new();
        if let Some(&(first_dts, _)) = self.pending.first() {
            if frame.dts - first_dts > MAX_BATCH_AGE_MILLIS {
                out.push(self.emit()?);
            }
        }
        self.pending.push((frame.dts, frame.data.clone()));
        if self.pending.len() >= MAX_BATCHED_FRAMES {
            out.push(self.emit()?);
        }
        Ok(out)
    }

    pub(super) fn flush(&mut self) -> Result<Vec<Bytes>, String> {
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![self.emit()?])
    }

    /// Builds one RTP packet from everything pending.
    ///
    /// ```text
    /// +---------+-----------+-----------+---------------+
    /// | RTP     | AU Header | Auxiliary | Access Unit   |
    /// | Header  | Section   | Section   | Data Section  |
    /// +---------+-----------+-----------+---------------+
    /// ```
    fn emit(&mut self) -> Result<Bytes, String> {
        let frames = std::mem::take(&mut self.pending);
        debug_assert!(!frames.is_empty());
        let timestamp = ((frames[0].0 as f64) * self.scale).round() as i64 as u32;
        let headers_len = 2 * frames.len();
        let bodies_len: usize = frames.iter().map(|(_, d)| d.len()).sum();
        let mut payload = Vec::with_capacity(2 + headers_len + bodies_len);
        payload.extend_from_slice(&((headers_len * 8) as u16).to_be_bytes());
        for (_, data) in &frames {
            // 13-bit size followed by a 3-bit AU index of zero.
            payload.extend_from_slice(&(((data.len() as u16) << 3).to_be_bytes()));
        }
        for (_, data) in &frames {
            payload.extend_from_slice(data);
        }
        let (raw, _) = RawPacketBuilder {
            sequence_number: self.next_seq,
            timestamp,
            payload_type: super::AUDIO_PAYLOAD_TYPE,
            ssrc: self.ssrc,
            mark: true,
            cts: None,
        }
        .build(payload)?;
        self.next_seq = self.next_seq.wrapping_add(1);
        Ok(raw.0)
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use super::*;
    use crate::codec::CodecItem;
    use crate::media::FrameKind;
    use crate::rtp::{RawPacket, ReceivedPacketBuilder};
    use crate::PacketContext;

    fn ts(timestamp: i64) -> crate::Timestamp {
        crate::Timestamp {
            timestamp,
            clock_rate: NonZeroU32::new(48_000).unwrap(),
            start: 0,
        }
    }

    fn audio_frame(dts: i64, data: &'static [u8]) -> Frame {
        Frame {
            kind: FrameKind::Audio,
            dts,
            pts: dts,
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn parse_audio_specific_config() {
        // 48 kHz stereo AAC-LC: object type 2, frequency index 3, channels 2.
        let config = AudioSpecificConfig::parse(&[0x11, 0x90]).unwrap();
        assert_eq!(config.sampling_frequency, 48_000);
        assert_eq!(config.channels, 2);
        assert_eq!(config.frame_length.get(), 1_024);
    }

    #[test]
    fn batching() {
        let mut p = Packetizer::new(1, 48_000).unwrap();
        // Three frames 21 ms apart, then one more: all within 150 ms of the
        // first, so exactly one packet with four AU headers comes out.
        assert!(p.packetize(&audio_frame(0, b"one")).unwrap().is_empty());
        assert!(p.packetize(&audio_frame(21, b"two")).unwrap().is_empty());
        assert!(p.packetize(&audio_frame(42, b"three")).unwrap().is_empty());
        let pkts = p.packetize(&audio_frame(64, b"four")).unwrap();
        assert_eq!(pkts.len(), 1);

        let (raw, range) = RawPacket::new(pkts[0].clone()).unwrap();
        assert!(raw.mark());
        assert_eq!(raw.payload_type(), 97);
        assert_eq!(raw.timestamp(), 0);
        let payload = &raw.0[usize::from(range.start)..usize::from(range.end)];
        assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 4 * 16);
        let sizes: Vec<u16> = (0..4)
            .map(|i| u16::from_be_bytes([payload[2 + 2 * i], payload[3 + 2 * i]]) >> 3)
            .collect();
        assert_eq!(sizes, vec![3, 3, 5, 4]);
        assert_eq!(&payload[10..], b"onetwothreefour");
    }

    #[test]
    fn batch_age_flush() {
        let mut p = Packetizer::new(1, 48_000).unwrap();
        assert!(p.packetize(&audio_frame(0, b"old")).unwrap().is_empty());
        // 151 ms later: the pending batch goes out first, the new frame waits.
        let pkts = p.packetize(&audio_frame(151, b"new")).unwrap();
        assert_eq!(pkts.len(), 1);
        let flushed = p.flush().unwrap();
        assert_eq!(flushed.len(), 1);
        let (raw, _) = RawPacket::new(flushed[0].clone()).unwrap();
        // 151 ms at 48 kHz.
        assert_eq!(raw.timestamp(), 7_248);
        assert!(p.flush().unwrap().is_empty());
    }

    #[test]
    fn round_trip() {
        let mut p = Packetizer::new(1, 48_000).unwrap();
        p.packetize(&audio_frame(0, b"first au")).unwrap();
        p.packetize(&audio_frame(21, b"second au")).unwrap();
        let pkts = p.flush().unwrap();
        assert_eq!(pkts.len(), 1);

        let mut d = Depacketizer::new(48_000, None).unwrap();
        let (raw, range) = RawPacket::new(pkts[0].clone()).unwrap();
        d.push(
            ReceivedPacketBuilder {
                ctx: PacketContext::dummy(),
                channel_id: 1,
                sequence_number: raw.sequence_number(),
                timestamp: ts(i64::from(raw.timestamp())),
                payload_type: 97,
                ssrc: 1,
                mark: raw.mark(),
                loss: 0,
                cts: None,
            }
            .build(&raw.0[usize::from(range.start)..usize::from(range.end)])
            .unwrap(),
        )
        .unwrap();
        let mut frames = Vec::new();
        while let Some(CodecItem::AudioFrame(f)) = d.pull().unwrap() {
            frames.push(f);
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data(), b"first au");
        assert_eq!(frames[1].data(), b"second au");
        // The second AU in an aggregate advances by one frame length.
        assert_eq!(frames[1].timestamp().timestamp(), 1_024);
    }
}
