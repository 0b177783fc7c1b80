// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Codec-specific logic: RTP depacketization and packetization for the two
//! payload formats this endpoint speaks, H.264 ([RFC
//! 6184](https://tools.ietf.org/html/rfc6184)) and AAC ([RFC
//! 3640](https://datatracker.ietf.org/doc/html/rfc3640)).

use std::num::NonZeroU32;

use bytes::Bytes;

use crate::media::{AudioInfo, Frame, MediaInfo, VideoInfo};
use crate::rtp::ReceivedPacket;
use crate::TrackContent;

pub(crate) mod aac;
pub(crate) mod h264;

/// RTP payload type used for H.264 video.
pub const VIDEO_PAYLOAD_TYPE: u8 = 96;

/// RTP payload type used for AAC audio.
pub const AUDIO_PAYLOAD_TYPE: u8 = 97;

/// An item produced by a [`Depacketizer`].
#[derive(Debug)]
#[non_exhaustive]
pub enum CodecItem {
    VideoFrame(VideoFrame),
    AudioFrame(AudioFrame),
}

/// A single video frame (aka video sample or video access unit).
///
/// Typically this is an encoded picture. It could also be a single field of
/// an interlaced picture.
pub struct VideoFrame {
    // A pair of contexts: for the start and for the end.
    // Having both can be useful to measure the total time elapsed while
    // receiving the frame.
    pub(crate) start_ctx: crate::PacketContext,
    pub(crate) end_ctx: crate::PacketContext,

    pub(crate) has_new_parameters: bool,
    pub(crate) loss: u16,
    pub(crate) timestamp: crate::Timestamp,

    /// The composition time offset carried in the RTP header extension of the
    /// access unit's first packet, in clock-rate units.
    pub(crate) cts: Option<u32>,

    pub(crate) is_random_access_point: bool,
    pub(crate) is_disposable: bool,
    pub(crate) data: Vec<u8>,
}

impl VideoFrame {
    /// Returns true if this frame set new video parameters (SPS/PPS).
    #[inline]
    pub fn has_new_parameters(&self) -> bool {
        self.has_new_parameters
    }

    /// Returns the number of lost RTP packets before this video frame.
    ///
    /// Note that if loss occurs during a fragmented frame, more than this
    /// number of packets' worth of data may be skipped.
    #[inline]
    pub fn loss(&self) -> u16 {
        self.loss
    }

    /// Returns this picture's timestamp in the time base associated with the stream.
    #[inline]
    pub fn timestamp(&self) -> crate::Timestamp {
        self.timestamp
    }

    /// Returns the composition time offset (PTS − DTS) in clock-rate units,
    /// when the sender transmitted one.
    #[inline]
    pub fn cts(&self) -> Option<u32> {
        self.cts
    }

    #[inline]
    pub fn start_ctx(&self) -> &crate::PacketContext {
        &self.start_ctx
    }

    #[inline]
    pub fn end_ctx(&self) -> &crate::PacketContext {
        &self.end_ctx
    }

    /// Returns if this is a "random access point (RAP)" aka "instantaneous
    /// decoding refresh (IDR)" picture.
    #[inline]
    pub fn is_random_access_point(&self) -> bool {
        self.is_random_access_point
    }

    /// Returns if no other pictures require this one to be decoded correctly.
    ///
    /// In H.264 terms, this is a frame with `nal_ref_idc == 0`.
    #[inline]
    pub fn is_disposable(&self) -> bool {
        self.is_disposable
    }

    /// Returns the access unit in AVCC form: each NAL is encoded as a `u32`
    /// length in big-endian format followed by the NAL's contents.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

impl std::fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoFrame")
            .field("timestamp", &self.timestamp)
            .field("start_ctx", &self.start_ctx)
            .field("end_ctx", &self.end_ctx)
            .field("loss", &self.loss)
            .field("cts", &self.cts)
            .field("has_new_parameters", &self.has_new_parameters)
            .field("is_random_access_point", &self.is_random_access_point)
            .field("is_disposable", &self.is_disposable)
            .field("data", &crate::hex::LimitedHex::new(&self.data, 64))
            .finish()
    }
}

/// An audio frame, which consists of one access unit.
pub struct AudioFrame {
    pub(crate) ctx: crate::PacketContext,
    pub(crate) timestamp: crate::Timestamp,
    pub(crate) frame_length: NonZeroU32,
    pub(crate) loss: u16,
    pub(crate) data: Bytes,
}

impl AudioFrame {
    #[inline]
    pub fn ctx(&self) -> &crate::PacketContext {
        &self.ctx
    }

    #[inline]
    pub fn timestamp(&self) -> crate::Timestamp {
        self.timestamp
    }

    /// The duration of this frame in clock-rate units.
    #[inline]
    pub fn frame_length(&self) -> NonZeroU32 {
        self.frame_length
    }

    /// Returns the number of lost RTP packets before this audio frame.
    #[inline]
    pub fn loss(&self) -> u16 {
        self.loss
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl std::fmt::Debug for AudioFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioFrame")
            .field("ctx", &self.ctx)
            .field("loss", &self.loss)
            .field("timestamp", &self.timestamp)
            .field("frame_length", &self.frame_length)
            .field("data", &crate::hex::LimitedHex::new(&self.data, 64))
            .finish()
    }
}

/// Turns RTP packets into [`CodecItem`]s.
#[derive(Debug)]
pub struct Depacketizer(DepacketizerInner);

#[derive(Debug)]
enum DepacketizerInner {
    Aac(Box<aac::Depacketizer>),
    H264(Box<h264::Depacketizer>),
}

impl Depacketizer {
    /// Creates an H.264 depacketizer; `info` supplies out-of-band SPS/PPS for
    /// parameter-change detection when available.
    pub fn h264(clock_rate: u32, info: Option<&VideoInfo>) -> Result<Self, String> {
        Ok(Depacketizer(DepacketizerInner::H264(Box::new(
            h264::Depacketizer::new(clock_rate, info)?,
        ))))
    }

    /// Creates an AAC depacketizer; `info` supplies the AudioSpecificConfig
    /// which determines samples per frame.
    pub fn aac(clock_rate: u32, info: Option<&AudioInfo>) -> Result<Self, String> {
        Ok(Depacketizer(DepacketizerInner::Aac(Box::new(
            aac::Depacketizer::new(clock_rate, info)?,
        ))))
    }

    /// Creates a depacketizer for the given content using `info`'s timescale.
    pub fn for_content(content: TrackContent, info: &MediaInfo) -> Result<Self, String> {
        match content {
            TrackContent::Video => {
                let v = info.video.as_ref().ok_or("no video track in media info")?;
                Self::h264(v.timescale, Some(v))
            }
            TrackContent::Audio => {
                let a = info.audio.as_ref().ok_or("no audio track in media info")?;
                Self::aac(a.timescale, Some(a))
            }
        }
    }

    /// Supplies a new packet to the depacketizer.
    ///
    /// Between any two calls to `push`, the caller must call `pull` until it
    /// returns `Ok(None)`.
    pub fn push(&mut self, input: ReceivedPacket) -> Result<(), String> {
        match &mut self.0 {
            DepacketizerInner::Aac(d) => d.push(input),
            DepacketizerInner::H264(d) => d.push(input),
        }
    }

    /// Retrieves a completed frame from the depacketizer.
    ///
    /// AAC supports aggregating multiple frames into one packet, so a single
    /// `push` call may cause `pull` to return `Ok(Some(...))` more than once.
    pub fn pull(&mut self) -> Result<Option<CodecItem>, String> {
        match &mut self.0 {
            DepacketizerInner::Aac(d) => d.pull(),
            DepacketizerInner::H264(d) => Ok(d.pull()),
        }
    }
}

/// Turns [`Frame`]s into ready-to-send RTP packets.
///
/// Frames reach the packetizer with DTS/PTS already shifted onto the wire
/// timeline (first frame at zero). The packetizer owns the sequence number
/// counter; packets come out strictly ordered.
#[derive(Debug)]
pub struct Packetizer(PacketizerInner);

#[derive(Debug)]
enum PacketizerInner {
    Aac(aac::Packetizer),
    H264(h264::Packetizer),
}

impl Packetizer {
    /// Creates an H.264 packetizer. `ssrc` is conventionally the track id.
    pub fn h264(ssrc: u32, timescale: u32, length_size: usize) -> Result<Self, String> {
        Ok(Packetizer(PacketizerInner::H264(h264::Packetizer::new(
            ssrc,
            timescale,
            length_size,
        )?)))
    }

    /// Creates an AAC packetizer. `ssrc` is conventionally the track id.
    pub fn aac(ssrc: u32, timescale: u32) -> Result<Self, String> {
        Ok(Packetizer(PacketizerInner::Aac(aac::Packetizer::new(
            ssrc, timescale,
        )?)))
    }

    /// Packetizes one frame.
    ///
    /// May return no packets: the AAC packetizer batches frames and emits
    /// them once the batch fills or ages out.
    pub fn packetize(&mut self, frame: &Frame) -> Result<Vec<Bytes>, String> {
        match &mut self.0 {
            PacketizerInner::Aac(p) => p.packetize(frame),
            PacketizerInner::H264(p) => p.packetize(frame),
        }
    }

    /// Emits any batched packets immediately.
    pub fn flush(&mut self) -> Result<Vec<Bytes>, String> {
        match &mut self.0 {
            PacketizerInner::Aac(p) => p.flush(),
            PacketizerInner::H264(_) => Ok(Vec::new()),
        }
    }
}
