// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The boundary between a session and the embedding application: media
//! frames, stream descriptors, and the handler invoked by server-role
//! sessions for `DESCRIBE`/`PLAY`/`ANNOUNCE`.

use bytes::Bytes;
use tokio::sync::mpsc;
use url::Url;

/// Capacity of the bounded frame queues between a media source and a session.
pub const FRAME_QUEUE_CAPACITY: usize = 64;

/// What a [`Frame`] carries.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameKind {
    /// An H.264 access unit in AVCC form (length-prefixed NALs).
    Video {
        /// True iff this access unit contains an IDR slice.
        keyframe: bool,
    },

    /// A raw AAC access unit.
    Audio,

    /// Codec configuration (parameter sets); not sent on the wire.
    Config,

    /// Out-of-band metadata; not sent on the wire.
    Metadata,
}

/// One media frame crossing the session boundary.
///
/// Timestamps are in milliseconds of stream time. `pts >= dts`; for audio the
/// two are always equal.
#[derive(Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub dts: i64,
    pub pts: i64,
    pub data: Bytes,
}

impl Frame {
    /// Returns true iff this frame is actual media (not config or metadata).
    #[inline]
    pub fn is_media(&self) -> bool {
        matches!(self.kind, FrameKind::Video { .. } | FrameKind::Audio)
    }

    #[inline]
    pub fn is_keyframe(&self) -> bool {
        matches!(self.kind, FrameKind::Video { keyframe: true })
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("kind", &self.kind)
            .field("dts", &self.dts)
            .field("pts", &self.pts)
            .field("data", &crate::hex::LimitedHex::new(&self.data, 64))
            .finish()
    }
}

/// Parameters of the video track of a presentation.
#[derive(Clone, Debug)]
pub struct VideoInfo {
    /// RTP clock rate in Hz; 90000 for H.264.
    pub timescale: u32,

    /// Bytes in each NAL length prefix of AVCC-form frame data (2 or 4).
    pub length_size: usize,

    /// The (single) SPS NAL, without any start code.
    pub sps: Bytes,

    /// The (single) PPS NAL, without any start code.
    pub pps: Bytes,
}

/// Parameters of the audio track of a presentation.
#[derive(Clone, Debug)]
pub struct AudioInfo {
    /// RTP clock rate in Hz; equals the AAC sampling frequency.
    pub timescale: u32,

    /// The raw AudioSpecificConfig.
    pub config: Bytes,

    /// Channel count, when known.
    pub channels: Option<u16>,
}

/// A parsed stream descriptor: which tracks exist and their parameters.
#[derive(Clone, Debug, Default)]
pub struct MediaInfo {
    pub video: Option<VideoInfo>,
    pub audio: Option<AudioInfo>,
}

/// How a presentation flows; affects `PAUSE` semantics.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Flow {
    /// A live stream: `PAUSE`/`PLAY` toggle output without seeking.
    Stream,

    /// A file: playback position is meaningful.
    File,
}

/// A playing media source: its flow type and the frames it produces.
///
/// The session detects source death by the sender side of `frames` being
/// dropped.
pub struct Source {
    pub flow: Flow,
    pub frames: mpsc::Receiver<Frame>,
}

/// Where frames of an announced (pushed) stream go.
///
/// The session detects sink death by `send` failing.
pub type Sink = mpsc::Sender<Frame>;

/// Error from a [`MediaHandler`] call, mapped onto an RTSP status code.
#[derive(Debug)]
pub enum HandlerError {
    /// Maps to 401 with a `WWW-Authenticate: Basic` challenge.
    Unauthorized,

    /// Maps to 404.
    NotFound,

    /// Maps to the given status code.
    Failed { code: u16, message: String },
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerError::Unauthorized => write!(f, "unauthorized"),
            HandlerError::NotFound => write!(f, "not found"),
            HandlerError::Failed { code, message } => write!(f, "{code}: {message}"),
        }
    }
}

impl std::error::Error for HandlerError {}

/// The media application behind a server-role session.
///
/// One handler instance exists per session; calls arrive serialized from the
/// session task. Handlers should not block: anything slow belongs on a
/// separate task feeding the returned frame channel.
pub trait MediaHandler: Send + 'static {
    /// Handles `DESCRIBE`: authenticate and return the stream descriptor.
    fn describe(
        &mut self,
        url: &Url,
        request: &rtsp_types::Request<Bytes>,
    ) -> Result<MediaInfo, HandlerError>;

    /// Handles `PLAY`: start (or locate) the source and hand over its frames.
    fn play(
        &mut self,
        url: &Url,
        request: &rtsp_types::Request<Bytes>,
        client_ip: std::net::IpAddr,
    ) -> Result<Source, HandlerError>;

    /// Handles `ANNOUNCE`: accept an inbound stream described by `media_info`.
    fn announce(
        &mut self,
        url: &Url,
        request: &rtsp_types::Request<Bytes>,
        media_info: MediaInfo,
    ) -> Result<Sink, HandlerError>;

    /// Handles `LIST_SEGMENTS`. The default refuses.
    fn list_segments(&mut self, _path: &str) -> Result<Bytes, HandlerError> {
        Err(HandlerError::NotFound)
    }

    /// Handles `GET_SEGMENT`. The default refuses.
    fn get_segment(&mut self, _path: &str, _segment: &str) -> Result<Bytes, HandlerError> {
        Err(HandlerError::NotFound)
    }
}
