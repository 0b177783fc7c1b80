// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Server-side RTSP session: streams pre-existing media to a client
//! (`DESCRIBE`/`SETUP`/`PLAY`) and accepts pushed streams
//! (`ANNOUNCE`/`SETUP` with `mode=record`/`RECORD`).
//!
//! One session task per accepted connection; media arrives from (or departs
//! to) the embedding application through the [`crate::media::MediaHandler`]
//! trait and bounded frame channels.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::{debug, trace, warn};
use rtsp_types::StatusCode;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;

use crate::codec::{Depacketizer, Packetizer};
use crate::media::{Flow, Frame, HandlerError, MediaHandler, MediaInfo, Sink};
use crate::session::{
    Channel, ChannelId, ChannelKind, Datagram, InboundTiming, IDLE_TIMEOUT, RR_INTERVAL_ACTIVE,
    RR_INTERVAL_IDLE,
};
use crate::timing::FirstDts;
use crate::tokio::Connection;
use crate::{Error, ErrorInt, PacketContext, RtspMessageContext, TrackContent};

pub(crate) mod sdp;

/// The value of the `Public` header in `OPTIONS` and `GET_PARAMETER` replies.
const PUBLIC_METHODS: &str = "SETUP, TEARDOWN, ANNOUNCE, RECORD, PLAY, OPTIONS, DESCRIBE, \
                              GET_PARAMETER, LIST_SEGMENTS, GET_SEGMENT";

/// The `Server` header value.
const SERVER_NAME: &str = concat!("iris/", env!("CARGO_PKG_VERSION"));

/// The realm offered in `WWW-Authenticate: Basic` challenges.
const BASIC_REALM: &str = "iris";

/// The `Transport` header of a `SETUP` request, as far as this server cares.
#[derive(Debug, Default, PartialEq, Eq)]
struct RequestedTransport {
    tcp: bool,
    interleaved: Option<(u8, u8)>,
    client_port: Option<(u16, u16)>,
    record: bool,
}

/// Parses a `SETUP` request's `Transport` header.
///
/// The only accepted forms are `RTP/AVP;unicast;client_port=n-m` and
/// `RTP/AVP/TCP;unicast;interleaved=n-m`; everything else is the caller's cue
/// to answer 461.
fn parse_transport(value: &str) -> Result<RequestedTransport, String> {
    let mut out = RequestedTransport::default();
    let mut parts = value.split(';');
    match parts.next().map(str::trim) {
        Some("RTP/AVP") | Some("RTP/AVP/UDP") => {}
        Some("RTP/AVP/TCP") => out.tcp = true,
        other => return Err(format!("unsupported transport spec {other:?}")),
    }
    for part in parts {
        let part = part.trim();
        if let Some(v) = part.strip_prefix("interleaved=") {
            let (n, m) = v
                .split_once('-')
                .ok_or_else(|| format!("bad interleaved channels {v:?}"))?;
            let n = u8::from_str_radix(n, 10).map_err(|_| format!("bad channel {n:?}"))?;
            let m = u8::from_str_radix(m, 10).map_err(|_| format!("bad channel {m:?}"))?;
            out.interleaved = Some((n, m));
        } else if let Some(v) = part.strip_prefix("client_port=") {
            let (n, m) = v
                .split_once('-')
                .ok_or_else(|| format!("bad client_port {v:?}"))?;
            let n = u16::from_str_radix(n, 10).map_err(|_| format!("bad port {n:?}"))?;
            let m = u16::from_str_radix(m, 10).map_err(|_| format!("bad port {m:?}"))?;
            out.client_port = Some((n, m));
        } else if let Some(v) = part.strip_prefix("mode=") {
            out.record = v.trim_matches('"').eq_ignore_ascii_case("record");
        }
    }
    Ok(out)
}

/// Where one outbound track's packets go.
enum OutputTransport {
    Interleaved {
        rtp_id: u8,
        rtcp_id: u8,
    },
    Udp {
        rtp_socket: Arc<UdpSocket>,
        rtcp_socket: Arc<UdpSocket>,
        peer_rtp: SocketAddr,
        peer_rtcp: SocketAddr,
    },
}

/// One stream of the presentation being sent to the client.
struct OutputTrack {
    packetizer: Packetizer,
    transport: OutputTransport,
}

/// Whether the event loop keeps going after handling one event.
enum Step {
    Continue,
    Shutdown,
}

/// A server-role RTSP session.
pub struct ServerSession<H: MediaHandler> {
    conn: Connection,
    handler: H,
    session_id: Option<Box<str>>,
    media_info: Option<MediaInfo>,
    paused: bool,
    flow: Flow,

    /// Frames from the media source while playing.
    source: Option<mpsc::Receiver<Frame>>,

    /// Frame destination while recording an announced stream.
    sink: Option<Sink>,

    /// Outbound per-track state, populated by `SETUP` (play direction).
    outputs: [Option<OutputTrack>; 2],

    /// Inbound per-track state, populated by `SETUP` with `mode=record`.
    channels: [Option<Channel>; 2],

    first_dts: FirstDts,
    timing: InboundTiming,
    net_tx: mpsc::Sender<Datagram>,
    net_rx: mpsc::Receiver<Datagram>,
}

impl<H: MediaHandler> ServerSession<H> {
    /// Wraps an accepted TCP connection.
    pub fn accept(stream: TcpStream, handler: H) -> Result<Self, Error> {
        let conn = Connection::from_stream(stream)
            .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
        let (net_tx, net_rx) = mpsc::channel(crate::media::FRAME_QUEUE_CAPACITY);
        Ok(ServerSession {
            conn,
            handler,
            session_id: None,
            media_info: None,
            paused: false,
            flow: Flow::Stream,
            source: None,
            sink: None,
            outputs: [None, None],
            channels: [None, None],
            first_dts: FirstDts::default(),
            timing: InboundTiming::default(),
            net_tx,
            net_rx,
        })
    }

    /// Drives the session until the peer closes, tears down, or errors.
    pub async fn run(mut self) -> Result<(), Error> {
        let start = tokio::time::Instant::now();
        let mut rr_period = RR_INTERVAL_IDLE;
        let mut rr_tick = tokio::time::interval_at(start + rr_period, rr_period);
        let idle_deadline = tokio::time::sleep(IDLE_TIMEOUT);
        tokio::pin!(idle_deadline);
        let mut seen_request = false;
        loop {
            let step = tokio::select! {
                msg = self.conn.next() => match msg {
                    None => {
                        debug!("peer closed the control connection");
                        return Ok(());
                    }
                    Some(Err(e)) => {
                        log::info!("closing session: {e}");
                        return Ok(());
                    }
                    Some(Ok(msg)) => {
                        seen_request = true;
                        self.handle_message(msg.ctx, msg.msg).await
                    }
                },
                frame = Self::next_source_frame(&mut self.source) => match frame {
                    Some(frame) => self.handle_source_frame(frame).await,
                    None => {
                        debug!("media source ended; closing session");
                        return Ok(());
                    }
                },
                Some((channel_id, kind, data)) = self.net_rx.recv() => {
                    self.handle_media_packet(channel_id, kind, PacketContext::udp(), data).await
                },
                _ = rr_tick.tick() => {
                    let active = self.channels.iter().any(Option::is_some);
                    let desired = if active { RR_INTERVAL_ACTIVE } else { RR_INTERVAL_IDLE };
                    if desired != rr_period {
                        rr_period = desired;
                        rr_tick = tokio::time::interval_at(
                            tokio::time::Instant::now() + rr_period,
                            rr_period,
                        );
                    }
                    self.send_receiver_reports().await
                },
                _ = &mut idle_deadline, if !seen_request => {
                    debug!("no request within {IDLE_TIMEOUT:?}; closing");
                    return Ok(());
                }
            };
            match step {
                Ok(Step::Continue) => {}
                Ok(Step::Shutdown) => return Ok(()),
                Err(e) if matches!(&*e.0, ErrorInt::WriteError { .. }) => {
                    log::info!("closing session: {e}");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Awaits the next frame from the media source, or forever if not playing.
    async fn next_source_frame(source: &mut Option<mpsc::Receiver<Frame>>) -> Option<Frame> {
        match source {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }

    async fn handle_message(
        &mut self,
        ctx: RtspMessageContext,
        msg: rtsp_types::Message<Bytes>,
    ) -> Result<Step, Error> {
        match msg {
            rtsp_types::Message::Request(request) => self.handle_request(&request).await,
            rtsp_types::Message::Data(data) => {
                let id = data.channel_id();
                let channel_id = ChannelId::from(id >> 1);
                let kind = if id & 1 == 0 {
                    ChannelKind::Rtp
                } else {
                    ChannelKind::Rtcp
                };
                self.handle_media_packet(channel_id, kind, PacketContext::tcp(ctx), data.into_body())
                    .await
            }
            rtsp_types::Message::Response(response) => {
                warn!("ignoring unexpected RTSP response: {:?}", response.status());
                Ok(Step::Continue)
            }
        }
    }

    async fn handle_request(
        &mut self,
        request: &rtsp_types::Request<Bytes>,
    ) -> Result<Step, Error> {
        let method: &str = request.method().into();
        trace!("handling {method}");
        match method {
            "OPTIONS" | "GET_PARAMETER" => {
                let response = self
                    .response(request, StatusCode::Ok)
                    .header(rtsp_types::headers::PUBLIC, PUBLIC_METHODS)
                    .build(Bytes::new());
                self.send_response(response).await
            }
            "DESCRIBE" => self.handle_describe(request).await,
            "SETUP" => self.handle_setup(request).await,
            "PLAY" => self.handle_play(request).await,
            "PAUSE" => self.handle_pause(request).await,
            "TEARDOWN" => {
                self.flush_outputs().await?;
                let response = self.response(request, StatusCode::Ok).build(Bytes::new());
                self.send_response(response).await?;
                Ok(Step::Shutdown)
            }
            "ANNOUNCE" => self.handle_announce(request).await,
            "RECORD" => {
                let response = self.response(request, StatusCode::Ok).build(Bytes::new());
                self.send_response(response).await
            }
            "LIST_SEGMENTS" => {
                let path = request_path(request);
                let result = self.handler.list_segments(&path);
                self.send_segment_result(request, result).await
            }
            "GET_SEGMENT" => {
                let path = request_path(request);
                let segment = request
                    .request_uri()
                    .and_then(|u| {
                        u.query_pairs()
                            .find(|(k, _)| k == "segment")
                            .map(|(_, v)| v.into_owned())
                    })
                    .unwrap_or_default();
                let result = self.handler.get_segment(&path, &segment);
                self.send_segment_result(request, result).await
            }
            _ => {
                let response = self
                    .response(request, StatusCode::MethodNotAllowed)
                    .build(Bytes::new());
                self.send_response(response).await
            }
        }
    }

    async fn handle_describe(
        &mut self,
        request: &rtsp_types::Request<Bytes>,
    ) -> Result<Step, Error> {
        let Some(url) = request.request_uri().cloned() else {
            let response = self
                .response(request, StatusCode::BadRequest)
                .build(Bytes::new());
            return self.send_response(response).await;
        };
        match self.handler.describe(&url, request) {
            Ok(info) => {
                // A fresh unique session id; epoch microseconds are unique
                // enough for one listener and easy to correlate with logs.
                let session_id = chrono::Utc::now().timestamp_micros().to_string();
                let body = sdp::media_info_to_sdp(&info, &session_id, &url);
                self.session_id = Some(session_id.into());
                self.media_info = Some(info);
                let response = self
                    .response(request, StatusCode::Ok)
                    .header(rtsp_types::headers::CONTENT_TYPE, "application/sdp")
                    .header(rtsp_types::headers::CONTENT_BASE, format!("{url}/"))
                    .build(Bytes::from(body));
                self.send_response(response).await
            }
            Err(e) => self.send_handler_error(request, e).await,
        }
    }

    async fn handle_setup(&mut self, request: &rtsp_types::Request<Bytes>) -> Result<Step, Error> {
        let track_id = request
            .request_uri()
            .and_then(|u| crate::client::parse::parse_track_id(u.as_str()));
        let Some(track_id @ 0..=1) = track_id else {
            let response = self
                .response(request, StatusCode::NotFound)
                .build(Bytes::new());
            return self.send_response(response).await;
        };
        let content = match track_id {
            0 => TrackContent::Video,
            _ => TrackContent::Audio,
        };
        let Some(transport) = request.header(&rtsp_types::headers::TRANSPORT) else {
            let response = self
                .response(request, StatusCode::BadRequest)
                .build(Bytes::new());
            return self.send_response(response).await;
        };
        let transport_value = transport.as_str().to_owned();
        let requested = match parse_transport(&transport_value) {
            Ok(r) => r,
            Err(e) => {
                debug!("unsupported transport {transport_value:?}: {e}");
                return self.send_unsupported_transport(request).await;
            }
        };
        if self.session_id.is_none() {
            self.session_id = Some(chrono::Utc::now().timestamp_micros().to_string().into());
        }

        let reply_transport = match (requested.tcp, requested.record) {
            (true, true) => {
                // Pushing media over interleaved TCP is not offered.
                return self.send_unsupported_transport(request).await;
            }
            (true, false) => {
                let Some((rtp_id, rtcp_id)) = requested.interleaved else {
                    return self.send_unsupported_transport(request).await;
                };
                match self.setup_output(
                    content,
                    OutputTransport::Interleaved { rtp_id, rtcp_id },
                ) {
                    Ok(()) => {}
                    Err(e) => return self.send_setup_failure(request, e).await,
                }
                // Echo the client's header.
                transport_value.clone()
            }
            (false, record) => {
                let Some((client_rtp, client_rtcp)) = requested.client_port else {
                    return self.send_unsupported_transport(request).await;
                };
                let peer_ip = self.conn.ctx().peer_addr().ip();
                let pair = match crate::tokio::UdpPair::for_ip(local_ip_for(peer_ip)) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("UDP port pool exhausted: {e}");
                        let response = self
                            .response(request, StatusCode::InternalServerError)
                            .build(Bytes::new());
                        return self.send_response(response).await;
                    }
                };
                let (server_rtp_port, server_rtcp_port) = (pair.rtp_port, pair.rtp_port + 1);
                if record {
                    match self.setup_record_channel(content, pair) {
                        Ok(()) => {}
                        Err(e) => return self.send_setup_failure(request, e).await,
                    }
                } else {
                    let rtp_socket = Arc::new(pair.rtp_socket);
                    let rtcp_socket = Arc::new(pair.rtcp_socket);
                    let transport = OutputTransport::Udp {
                        rtp_socket,
                        rtcp_socket,
                        peer_rtp: SocketAddr::new(peer_ip, client_rtp),
                        peer_rtcp: SocketAddr::new(peer_ip, client_rtcp),
                    };
                    match self.setup_output(content, transport) {
                        Ok(()) => {}
                        Err(e) => return self.send_setup_failure(request, e).await,
                    }
                }
                let mode_suffix = if record { ";mode=receive" } else { "" };
                format!(
                    "RTP/AVP;unicast;client_port={client_rtp}-{client_rtcp};\
                     server_port={server_rtp_port}-{server_rtcp_port}{mode_suffix}"
                )
            }
        };
        let response = self
            .response(request, StatusCode::Ok)
            .header(rtsp_types::headers::TRANSPORT, reply_transport)
            .build(Bytes::new());
        self.send_response(response).await
    }

    /// Creates the outbound packetizer for a play-direction `SETUP`.
    fn setup_output(
        &mut self,
        content: TrackContent,
        transport: OutputTransport,
    ) -> Result<(), String> {
        let info = self
            .media_info
            .as_ref()
            .ok_or("SETUP before DESCRIBE: no media info")?;
        let channel_id = content.channel_id();
        let ssrc = channel_id as u32;
        let packetizer = match content {
            TrackContent::Video => {
                let v = info.video.as_ref().ok_or("no video track")?;
                Packetizer::h264(ssrc, v.timescale, v.length_size)?
            }
            TrackContent::Audio => {
                let a = info.audio.as_ref().ok_or("no audio track")?;
                Packetizer::aac(ssrc, a.timescale)?
            }
        };
        self.outputs[channel_id] = Some(OutputTrack {
            packetizer,
            transport,
        });
        Ok(())
    }

    /// Creates the inbound channel for a `SETUP` with `mode=record`.
    fn setup_record_channel(
        &mut self,
        content: TrackContent,
        pair: crate::tokio::UdpPair,
    ) -> Result<(), String> {
        let info = self
            .media_info
            .as_ref()
            .ok_or("SETUP with mode=record before ANNOUNCE: no media info")?;
        let channel_id = content.channel_id();
        let timescale = match content {
            TrackContent::Video => info.video.as_ref().ok_or("no video track")?.timescale,
            TrackContent::Audio => info.audio.as_ref().ok_or("no audio track")?.timescale,
        };
        let depacketizer = Depacketizer::for_content(content, info)?;
        let mut channel = Channel::new(channel_id, content, timescale, depacketizer)?;
        let rtp = Arc::new(pair.rtp_socket);
        let rtcp = Arc::new(pair.rtcp_socket);
        crate::session::spawn_datagram_forwarder(
            rtp.clone(),
            channel_id,
            ChannelKind::Rtp,
            self.net_tx.clone(),
        );
        crate::session::spawn_datagram_forwarder(
            rtcp.clone(),
            channel_id,
            ChannelKind::Rtcp,
            self.net_tx.clone(),
        );
        channel.rtp_socket = Some(rtp);
        channel.rtcp_socket = Some(rtcp);
        self.channels[channel_id] = Some(channel);
        Ok(())
    }

    async fn handle_play(&mut self, request: &rtsp_types::Request<Bytes>) -> Result<Step, Error> {
        if self.paused && self.flow == Flow::Stream && self.source.is_some() {
            self.paused = false;
            let response = self.response(request, StatusCode::Ok).build(Bytes::new());
            return self.send_response(response).await;
        }
        let Some(url) = request.request_uri().cloned() else {
            let response = self
                .response(request, StatusCode::BadRequest)
                .build(Bytes::new());
            return self.send_response(response).await;
        };
        let client_ip = self.conn.ctx().peer_addr().ip();
        match self.handler.play(&url, request, client_ip) {
            Ok(source) => {
                self.flow = source.flow;
                self.source = Some(source.frames);
                self.paused = false;
                let rtp_info = self
                    .outputs
                    .iter()
                    .enumerate()
                    .filter(|(_, o)| o.is_some())
                    .map(|(i, _)| format!("url={url}/trackID={i};seq=0;rtptime=0"))
                    .collect::<Vec<_>>()
                    .join(",");
                let response = self
                    .response(request, StatusCode::Ok)
                    .header(rtsp_types::headers::RTP_INFO, rtp_info)
                    .header(rtsp_types::headers::RANGE, "npt=0-")
                    .build(Bytes::new());
                self.send_response(response).await
            }
            Err(e) => self.send_handler_error(request, e).await,
        }
    }

    async fn handle_pause(&mut self, request: &rtsp_types::Request<Bytes>) -> Result<Step, Error> {
        if self.flow != Flow::Stream {
            let response = self
                .response(request, StatusCode::MethodNotValidInThisState)
                .build(Bytes::new());
            return self.send_response(response).await;
        }
        self.paused = true;
        self.flush_outputs().await?;
        let response = self.response(request, StatusCode::Ok).build(Bytes::new());
        self.send_response(response).await
    }

    async fn handle_announce(
        &mut self,
        request: &rtsp_types::Request<Bytes>,
    ) -> Result<Step, Error> {
        if !matches!(
            request.header(&rtsp_types::headers::CONTENT_TYPE),
            Some(v) if v.as_str() == "application/sdp"
        ) {
            let response = self
                .response(request, StatusCode::UnsupportedMediaType)
                .build(Bytes::new());
            return self.send_response(response).await;
        }
        let Some(url) = request.request_uri().cloned() else {
            let response = self
                .response(request, StatusCode::BadRequest)
                .build(Bytes::new());
            return self.send_response(response).await;
        };
        let info = match sdp::media_info_from_sdp(&request.body()[..]) {
            Ok(info) => info,
            Err(e) => {
                debug!("unusable ANNOUNCE body: {e}");
                let response = self
                    .response(request, StatusCode::BadRequest)
                    .build(Bytes::new());
                return self.send_response(response).await;
            }
        };
        match self.handler.announce(&url, request, info.clone()) {
            Ok(sink) => {
                self.media_info = Some(info);
                self.sink = Some(sink);
                let response = self.response(request, StatusCode::Ok).build(Bytes::new());
                self.send_response(response).await
            }
            Err(e) => self.send_handler_error(request, e).await,
        }
    }

    /// Ships one frame from the playing media source.
    async fn handle_source_frame(&mut self, frame: Frame) -> Result<Step, Error> {
        // Codec config and metadata never hit the wire, and nothing flows
        // while paused.
        if !frame.is_media() || self.paused {
            return Ok(Step::Continue);
        }
        let first = self.first_dts.anchor(frame.dts);
        let keyframe = frame.is_keyframe();
        let shifted = Frame {
            kind: frame.kind,
            dts: frame.dts - first,
            pts: frame.pts - first,
            data: frame.data,
        };
        let channel_id = match shifted.kind {
            crate::media::FrameKind::Audio => TrackContent::Audio.channel_id(),
            _ => TrackContent::Video.channel_id(),
        };
        let Some(output) = self.outputs[channel_id].as_mut() else {
            // The client didn't SETUP this track.
            return Ok(Step::Continue);
        };
        let packets = match output.packetizer.packetize(&shifted) {
            Ok(p) => p,
            Err(e) => {
                warn!("dropping unpacketizable frame: {e}");
                return Ok(Step::Continue);
            }
        };
        if keyframe {
            // Tell the receiver where the absolute timeline starts so it can
            // undo the shift above.
            let app = crate::rtcp::build_first_dts(channel_id as u32, first);
            self.send_packet(channel_id, ChannelKind::Rtcp, Bytes::copy_from_slice(&app))
                .await?;
        }
        for packet in packets {
            self.send_packet(channel_id, ChannelKind::Rtp, packet).await?;
        }
        Ok(Step::Continue)
    }

    /// Emits anything still batched in the packetizers, so pausing or tearing
    /// down doesn't swallow the audio tail.
    async fn flush_outputs(&mut self) -> Result<(), Error> {
        for channel_id in 0..self.outputs.len() {
            let Some(output) = self.outputs[channel_id].as_mut() else {
                continue;
            };
            let packets = match output.packetizer.flush() {
                Ok(p) => p,
                Err(e) => {
                    warn!("flush failed on channel {channel_id}: {e}");
                    continue;
                }
            };
            for packet in packets {
                self.send_packet(channel_id, ChannelKind::Rtp, packet).await?;
            }
        }
        Ok(())
    }

    /// Sends one RTP or RTCP packet over the track's negotiated transport.
    async fn send_packet(
        &mut self,
        channel_id: ChannelId,
        kind: ChannelKind,
        packet: Bytes,
    ) -> Result<(), Error> {
        let output = self.outputs[channel_id]
            .as_ref()
            .expect("send_packet only called with an output present");
        match &output.transport {
            OutputTransport::Interleaved { rtp_id, rtcp_id } => {
                let id = match kind {
                    ChannelKind::Rtp => *rtp_id,
                    ChannelKind::Rtcp => *rtcp_id,
                };
                self.conn.send_data(id, packet).await
            }
            OutputTransport::Udp {
                rtp_socket,
                rtcp_socket,
                peer_rtp,
                peer_rtcp,
            } => {
                let (socket, peer) = match kind {
                    ChannelKind::Rtp => (rtp_socket, peer_rtp),
                    ChannelKind::Rtcp => (rtcp_socket, peer_rtcp),
                };
                if let Err(e) = socket.send_to(&packet, peer).await {
                    trace!("UDP send to {peer} failed: {e}");
                }
                Ok(())
            }
        }
    }

    /// Handles inbound RTP/RTCP: a pushed stream's media, or the client's
    /// receiver reports about our own output.
    async fn handle_media_packet(
        &mut self,
        channel_id: ChannelId,
        kind: ChannelKind,
        ctx: PacketContext,
        data: Bytes,
    ) -> Result<Step, Error> {
        let Some(channel) = self.channels.get_mut(channel_id).and_then(Option::as_mut) else {
            // Not a record-mode channel; the client's RRs about our own
            // output land here and need no action.
            trace!("ignoring inbound packet on channel {channel_id}");
            return Ok(Step::Continue);
        };
        match kind {
            ChannelKind::Rtp => match channel.handle_rtp(ctx, data) {
                Ok(items) => {
                    for item in items {
                        let frame = match self.timing.frame(item) {
                            Ok(frame) => frame,
                            Err(e) => bail!(ErrorInt::AudioDriftExceeded {
                                conn_ctx: *self.conn.ctx(),
                                shift_count: e.shift_count,
                            }),
                        };
                        let Some(sink) = &self.sink else {
                            continue;
                        };
                        if sink.send(frame).await.is_err() {
                            debug!("announce sink went away; closing session");
                            return Ok(Step::Shutdown);
                        }
                    }
                }
                Err(problem) => warn!(
                    "dropping RTP packet on {:?} stream ({}): {}",
                    channel.content, channel.stream_ctx, problem.0
                ),
            },
            ChannelKind::Rtcp => match channel.handle_rtcp(&data) {
                Ok(Some(first_dts)) => self.timing.first_dts.learn(first_dts),
                Ok(None) => {}
                Err(problem) => warn!(
                    "dropping RTCP packet on {:?} stream ({}): {}",
                    channel.content, channel.stream_ctx, problem.0
                ),
            },
        }
        Ok(Step::Continue)
    }

    /// Emits receiver reports for record-mode channels.
    async fn send_receiver_reports(&mut self) -> Result<Step, Error> {
        let now = std::time::Instant::now();
        for channel_id in 0..self.channels.len() {
            let Some(channel) = &self.channels[channel_id] else {
                continue;
            };
            let Some(report) = channel.receiver_report(now) else {
                continue;
            };
            if let Some(rtcp_socket) = &channel.rtcp_socket {
                if let Err(e) = rtcp_socket.try_send(&report) {
                    trace!("RR send failed on channel {channel_id}: {e}");
                }
            } else {
                let (_, rtcp_id) = channel.interleaved_ids();
                self.conn
                    .send_data(rtcp_id, Bytes::copy_from_slice(&report))
                    .await?;
            }
        }
        Ok(Step::Continue)
    }

    /// Starts a response with the headers every reply carries.
    fn response(
        &self,
        request: &rtsp_types::Request<Bytes>,
        status: StatusCode,
    ) -> rtsp_types::ResponseBuilder {
        let mut builder = rtsp_types::Response::builder(rtsp_types::Version::V1_0, status)
            .header(
                rtsp_types::headers::DATE,
                chrono::Utc::now()
                    .format("%a, %d %b %Y %H:%M:%S GMT")
                    .to_string(),
            )
            .header(rtsp_types::headers::SERVER, SERVER_NAME);
        if let Some(cseq) = request.header(&rtsp_types::headers::CSEQ) {
            builder = builder.header(rtsp_types::headers::CSEQ, cseq.as_str().to_owned());
        }
        if let Some(session_id) = &self.session_id {
            builder = builder.header(rtsp_types::headers::SESSION, session_id.to_string());
        }
        builder
    }

    async fn send_response(
        &mut self,
        response: rtsp_types::Response<Bytes>,
    ) -> Result<Step, Error> {
        self.conn
            .send(rtsp_types::Message::Response(response))
            .await?;
        Ok(Step::Continue)
    }

    async fn send_unsupported_transport(
        &mut self,
        request: &rtsp_types::Request<Bytes>,
    ) -> Result<Step, Error> {
        let response = self
            .response(request, StatusCode::UnsupportedTransport)
            .build(Bytes::new());
        self.send_response(response).await
    }

    async fn send_setup_failure(
        &mut self,
        request: &rtsp_types::Request<Bytes>,
        reason: String,
    ) -> Result<Step, Error> {
        debug!("SETUP failed: {reason}");
        let response = self
            .response(request, StatusCode::MethodNotValidInThisState)
            .build(Bytes::new());
        self.send_response(response).await
    }

    async fn send_handler_error(
        &mut self,
        request: &rtsp_types::Request<Bytes>,
        e: HandlerError,
    ) -> Result<Step, Error> {
        let response = match e {
            HandlerError::Unauthorized => self
                .response(request, StatusCode::Unauthorized)
                .header(
                    rtsp_types::headers::WWW_AUTHENTICATE,
                    format!("Basic realm=\"{BASIC_REALM}\""),
                )
                .build(Bytes::new()),
            HandlerError::NotFound => self
                .response(request, StatusCode::NotFound)
                .build(Bytes::new()),
            HandlerError::Failed { code, message } => {
                debug!("handler refused {:?}: {code} {message}", request.method());
                self.response(request, status_from_code(code))
                    .build(Bytes::new())
            }
        };
        self.send_response(response).await
    }

    async fn send_segment_result(
        &mut self,
        request: &rtsp_types::Request<Bytes>,
        result: Result<Bytes, HandlerError>,
    ) -> Result<Step, Error> {
        match result {
            Ok(body) => {
                let response = self.response(request, StatusCode::Ok).build(body);
                self.send_response(response).await
            }
            Err(e) => self.send_handler_error(request, e).await,
        }
    }
}

/// The request path used for segment lookups.
fn request_path(request: &rtsp_types::Request<Bytes>) -> String {
    request
        .request_uri()
        .map(|u| u.path().to_owned())
        .unwrap_or_default()
}

/// The local address to bind media sockets on, matching the peer's family.
fn local_ip_for(peer: std::net::IpAddr) -> std::net::IpAddr {
    match peer {
        std::net::IpAddr::V4(_) => std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
        std::net::IpAddr::V6(_) => std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
    }
}

fn status_from_code(code: u16) -> StatusCode {
    match code {
        400 => StatusCode::BadRequest,
        401 => StatusCode::Unauthorized,
        403 => StatusCode::Forbidden,
        404 => StatusCode::NotFound,
        453 => StatusCode::NotEnoughBandwidth,
        454 => StatusCode::SessionNotFound,
        455 => StatusCode::MethodNotValidInThisState,
        461 => StatusCode::UnsupportedTransport,
        503 => StatusCode::ServiceUnavailable,
        _ => StatusCode::InternalServerError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{FrameKind, Source, VideoInfo};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct TestHandler {
        source: Option<Source>,
    }

    impl MediaHandler for TestHandler {
        fn describe(
            &mut self,
            _url: &url::Url,
            _request: &rtsp_types::Request<Bytes>,
        ) -> Result<MediaInfo, HandlerError> {
            Ok(MediaInfo {
                video: Some(VideoInfo {
                    timescale: 90_000,
                    length_size: 4,
                    sps: Bytes::from_static(b"\x67\x42\x00\x1e"),
                    pps: Bytes::from_static(b"\x68\xce\x38\x80"),
                }),
                audio: None,
            })
        }

        fn play(
            &mut self,
            _url: &url::Url,
            _request: &rtsp_types::Request<Bytes>,
            _client_ip: std::net::IpAddr,
        ) -> Result<Source, HandlerError> {
            self.source.take().ok_or(HandlerError::NotFound)
        }

        fn announce(
            &mut self,
            _url: &url::Url,
            _request: &rtsp_types::Request<Bytes>,
            _media_info: MediaInfo,
        ) -> Result<Sink, HandlerError> {
            Err(HandlerError::Unauthorized)
        }
    }

    /// Reads one response, including any `Content-Length`-sized body.
    async fn read_response(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        let header_end = loop {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "unexpected EOF mid-response");
            buf.extend_from_slice(&chunk[..n]);
            if let Some(i) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break i + 4;
            }
        };
        let headers = String::from_utf8(buf[..header_end].to_vec()).unwrap();
        let content_length = headers
            .lines()
            .find_map(|l| l.strip_prefix("Content-Length: "))
            .map(|v| v.trim().parse::<usize>().unwrap())
            .unwrap_or(0);
        while buf.len() < header_end + content_length {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "unexpected EOF mid-body");
            buf.extend_from_slice(&chunk[..n]);
        }
        String::from_utf8(buf).unwrap()
    }

    /// Reads one `$`-framed interleaved block.
    async fn read_interleaved(stream: &mut TcpStream) -> (u8, Vec<u8>) {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], b'$');
        let len = usize::from(u16::from_be_bytes([header[2], header[3]]));
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.unwrap();
        (header[1], payload)
    }

    async fn start(handler: TestHandler) -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (peer, client) = tokio::join!(listener.accept(), connect);
        let (peer, _) = peer.unwrap();
        let session = ServerSession::accept(peer, handler).unwrap();
        tokio::spawn(session.run());
        client.unwrap()
    }

    #[tokio::test]
    async fn play_interleaved_end_to_end() {
        let (frame_tx, frame_rx) = mpsc::channel(8);
        let mut client = start(TestHandler {
            source: Some(Source {
                flow: Flow::Stream,
                frames: frame_rx,
            }),
        })
        .await;

        client
            .write_all(b"OPTIONS rtsp://127.0.0.1/cam RTSP/1.0\r\nCSeq: 1\r\n\r\n")
            .await
            .unwrap();
        let resp = read_response(&mut client).await;
        assert!(resp.starts_with("RTSP/1.0 200 OK\r\n"), "{resp}");
        assert!(resp.contains("CSeq: 1\r\n"), "{resp}");
        assert!(resp.contains("GET_SEGMENT"), "{resp}");
        assert!(resp.contains("Date: "), "{resp}");
        assert!(resp.contains("Server: iris/"), "{resp}");

        client
            .write_all(b"DESCRIBE rtsp://127.0.0.1/cam RTSP/1.0\r\nCSeq: 2\r\n\r\n")
            .await
            .unwrap();
        let resp = read_response(&mut client).await;
        assert!(resp.contains("Content-Base: rtsp://127.0.0.1/cam/\r\n"), "{resp}");
        assert!(resp.contains("Content-Type: application/sdp\r\n"), "{resp}");
        assert!(resp.contains("sprop-parameter-sets="), "{resp}");
        assert!(resp.contains("Session: "), "{resp}");

        client
            .write_all(
                b"SETUP rtsp://127.0.0.1/cam/trackID=0 RTSP/1.0\r\nCSeq: 3\r\n\
                  Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n",
            )
            .await
            .unwrap();
        let resp = read_response(&mut client).await;
        assert!(resp.starts_with("RTSP/1.0 200 OK\r\n"), "{resp}");
        assert!(
            resp.contains("Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n"),
            "{resp}"
        );

        client
            .write_all(b"PLAY rtsp://127.0.0.1/cam RTSP/1.0\r\nCSeq: 4\r\n\r\n")
            .await
            .unwrap();
        let resp = read_response(&mut client).await;
        assert!(resp.starts_with("RTSP/1.0 200 OK\r\n"), "{resp}");
        assert!(
            resp.contains("url=rtsp://127.0.0.1/cam/trackID=0;seq=0;rtptime=0"),
            "{resp}"
        );
        assert!(resp.contains("Range: npt=0-\r\n"), "{resp}");

        // A keyframe first announces the stream's absolute start time on the
        // RTCP channel, then flows as RTP with the DTS shifted to zero.
        frame_tx
            .send(Frame {
                kind: FrameKind::Video { keyframe: true },
                dts: 5_000,
                pts: 5_000,
                data: Bytes::from_static(b"\x00\x00\x00\x05\x65slic"),
            })
            .await
            .unwrap();
        let (channel, rtcp) = read_interleaved(&mut client).await;
        assert_eq!(channel, 1);
        assert_eq!(rtcp[1], 204);
        assert_eq!(&rtcp[8..12], b"FlFD");
        assert_eq!(
            u64::from_be_bytes(rtcp[12..20].try_into().unwrap()),
            5_000 * 90
        );
        let (channel, rtp) = read_interleaved(&mut client).await;
        assert_eq!(channel, 0);
        assert_eq!(rtp[1] & 0x7f, 96);
        assert_ne!(rtp[1] & 0x80, 0, "last packet of the AU carries the mark");
        assert_eq!(u32::from_be_bytes(rtp[4..8].try_into().unwrap()), 0);
        assert_eq!(&rtp[12..], b"\x65slic");
    }

    #[tokio::test]
    async fn rejects_record_over_tcp_and_unknown_methods() {
        let mut client = start(TestHandler { source: None }).await;

        client
            .write_all(b"DESCRIBE rtsp://127.0.0.1/cam RTSP/1.0\r\nCSeq: 1\r\n\r\n")
            .await
            .unwrap();
        read_response(&mut client).await;

        client
            .write_all(
                b"SETUP rtsp://127.0.0.1/cam/trackID=0 RTSP/1.0\r\nCSeq: 2\r\n\
                  Transport: RTP/AVP/TCP;unicast;interleaved=0-1;mode=record\r\n\r\n",
            )
            .await
            .unwrap();
        let resp = read_response(&mut client).await;
        assert!(resp.starts_with("RTSP/1.0 461 "), "{resp}");

        client
            .write_all(
                b"SETUP rtsp://127.0.0.1/cam/trackID=0 RTSP/1.0\r\nCSeq: 3\r\n\
                  Transport: RAW/RAW/UDP;unicast\r\n\r\n",
            )
            .await
            .unwrap();
        let resp = read_response(&mut client).await;
        assert!(resp.starts_with("RTSP/1.0 461 "), "{resp}");

        client
            .write_all(b"FROB rtsp://127.0.0.1/cam RTSP/1.0\r\nCSeq: 4\r\n\r\n")
            .await
            .unwrap();
        let resp = read_response(&mut client).await;
        assert!(resp.starts_with("RTSP/1.0 405 "), "{resp}");
    }

    #[tokio::test]
    async fn setup_udp_returns_server_ports() {
        let mut client = start(TestHandler { source: None }).await;

        client
            .write_all(b"DESCRIBE rtsp://127.0.0.1/cam RTSP/1.0\r\nCSeq: 1\r\n\r\n")
            .await
            .unwrap();
        read_response(&mut client).await;

        client
            .write_all(
                b"SETUP rtsp://127.0.0.1/cam/trackID=0 RTSP/1.0\r\nCSeq: 2\r\n\
                  Transport: RTP/AVP;unicast;client_port=9000-9001\r\n\r\n",
            )
            .await
            .unwrap();
        let resp = read_response(&mut client).await;
        assert!(resp.starts_with("RTSP/1.0 200 OK\r\n"), "{resp}");
        let transport = resp
            .lines()
            .find_map(|l| l.strip_prefix("Transport: "))
            .unwrap();
        assert!(
            transport.starts_with("RTP/AVP;unicast;client_port=9000-9001;server_port="),
            "{transport}"
        );
        assert!(!transport.contains("mode=receive"), "{transport}");
    }

    #[test]
    fn transport_udp_play() {
        let t = parse_transport("RTP/AVP;unicast;client_port=5000-5001").unwrap();
        assert_eq!(
            t,
            RequestedTransport {
                tcp: false,
                interleaved: None,
                client_port: Some((5000, 5001)),
                record: false,
            }
        );
    }

    #[test]
    fn transport_udp_record() {
        let t = parse_transport("RTP/AVP;unicast;mode=record;client_port=5000-5001").unwrap();
        assert!(t.record);
        let t = parse_transport("RTP/AVP;unicast;mode=\"RECORD\";client_port=5000-5001").unwrap();
        assert!(t.record);
    }

    #[test]
    fn transport_interleaved() {
        let t = parse_transport("RTP/AVP/TCP;unicast;interleaved=2-3").unwrap();
        assert!(t.tcp);
        assert_eq!(t.interleaved, Some((2, 3)));
    }

    #[test]
    fn transport_garbage() {
        parse_transport("RAW/RAW/UDP;unicast").unwrap_err();
    }
}
