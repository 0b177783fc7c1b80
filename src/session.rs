// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-session state shared between the client and server roles: the fixed
//! two-slot channel table, per-channel RTP/RTCP bookkeeping, and the timer
//! constants both roles obey.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::codec::{CodecItem, Depacketizer};
use crate::media::{Frame, FrameKind};
use crate::rtp::RawPacket;
use crate::timing::{AudioDriftCorrector, FirstDts, Timeline, TooManyAudioShifts};
use crate::{NtpTimestamp, PacketContext, StreamContext};

/// Index into the session's channel table: 0 is conventionally video, 1 audio.
pub type ChannelId = usize;

/// Base tick of the receiver-report timer while channels are active.
pub(crate) const RR_INTERVAL_ACTIVE: std::time::Duration = std::time::Duration::from_secs(3);

/// Receiver-report timer while no channel is active yet.
pub(crate) const RR_INTERVAL_IDLE: std::time::Duration = std::time::Duration::from_secs(2);

/// Keep-alive requests go out at three times the base tick.
pub(crate) const KEEPALIVE_MULTIPLIER: u32 = 3;

/// A control connection with no complete message yet is dropped after this.
pub(crate) const IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// A synchronous client call waits this long before killing the session.
pub(crate) const CALL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Which media a channel slot carries.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TrackContent {
    Video,
    Audio,
}

impl TrackContent {
    /// The conventional channel slot for this content.
    #[inline]
    pub fn channel_id(self) -> ChannelId {
        match self {
            TrackContent::Video => 0,
            TrackContent::Audio => 1,
        }
    }
}

/// The keep-alive request the client sends every
/// [`KEEPALIVE_MULTIPLIER`]×[`RR_INTERVAL_ACTIVE`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum KeepaliveMethod {
    /// `GET_PARAMETER`, chosen when the peer advertises it in `Public`.
    #[default]
    GetParameter,

    /// `OPTIONS`, the fallback every server accepts.
    Options,

    /// Keep-alives disabled.
    None,
}

/// State from the most recent RTCP sender report on a channel.
#[derive(Copy, Clone, Debug)]
pub(crate) struct SrState {
    pub(crate) ntp: NtpTimestamp,
    pub(crate) timecode: u32,

    /// Milliseconds since the Unix epoch corresponding to `ntp`.
    pub(crate) wall_clock_ms: i64,

    /// Local monotonic time at which the report arrived.
    pub(crate) last_sr_at: Instant,
}

impl SrState {
    /// The DLSR field for a receiver report: delay since the last SR in
    /// 1/65536 s units, rounded.
    pub(crate) fn delay_since(&self, now: Instant) -> u32 {
        let secs = now.saturating_duration_since(self.last_sr_at).as_secs_f64();
        (secs * 65_536.0).round() as u32
    }
}

/// A problem with one inbound packet. The packet is dropped and logged; the
/// session stays up.
#[derive(Debug)]
pub(crate) struct PacketProblem(pub(crate) String);

/// Whether a datagram or interleaved block is RTP or RTCP.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ChannelKind {
    Rtp,
    Rtcp,
}

/// A datagram forwarded from a channel's UDP socket into the session task.
pub(crate) type Datagram = (ChannelId, ChannelKind, Bytes);

/// Reads datagrams off one UDP socket and forwards them into the session's
/// event loop. Ends when the socket errors or the session goes away.
pub(crate) fn spawn_datagram_forwarder(
    socket: Arc<UdpSocket>,
    channel_id: ChannelId,
    kind: ChannelKind,
    tx: mpsc::Sender<Datagram>,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65_536];
        loop {
            tokio::select! {
                _ = tx.closed() => break,
                r = socket.recv_from(&mut buf) => match r {
                    Ok((n, _from)) => {
                        if tx
                            .send((channel_id, kind, Bytes::copy_from_slice(&buf[..n])))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        log::warn!("UDP receive error on channel {channel_id}: {e}");
                        break;
                    }
                },
            }
        }
    });
}

/// One media track of a session.
pub(crate) struct Channel {
    pub(crate) channel_id: ChannelId,
    pub(crate) content: TrackContent,
    pub(crate) timescale: u32,
    pub(crate) depacketizer: Depacketizer,
    pub(crate) timeline: Timeline,

    /// Present only in UDP transport mode. Shared with the forwarder task
    /// that reads inbound datagrams.
    pub(crate) rtp_socket: Option<Arc<UdpSocket>>,
    pub(crate) rtcp_socket: Option<Arc<UdpSocket>>,

    pub(crate) ssrc: Option<u32>,

    /// Sequence number of the most recently received RTP packet, plus one.
    /// Also set by `RTP-Info` sync before any packet arrives.
    pub(crate) next_seq: Option<u16>,

    /// Sequence number of the most recently received RTP packet, as echoed in
    /// receiver reports. Unlike `next_seq`, only actual traffic sets this.
    pub(crate) last_seq: Option<u16>,

    pub(crate) sr: Option<SrState>,
    pub(crate) stream_ctx: StreamContext,
}

impl Channel {
    pub(crate) fn new(
        channel_id: ChannelId,
        content: TrackContent,
        timescale: u32,
        depacketizer: Depacketizer,
    ) -> Result<Self, String> {
        Ok(Channel {
            channel_id,
            content,
            timescale,
            depacketizer,
            timeline: Timeline::new(None, timescale)?,
            rtp_socket: None,
            rtcp_socket: None,
            ssrc: None,
            next_seq: None,
            last_seq: None,
            sr: None,
            stream_ctx: StreamContext::dummy(),
        })
    }

    /// The interleaved channel ids used by this channel over TCP transport.
    #[inline]
    pub(crate) fn interleaved_ids(&self) -> (u8, u8) {
        let rtp = (self.channel_id as u8) << 1;
        (rtp, rtp + 1)
    }

    /// Binds a UDP port pair for this channel, spawning forwarder tasks that
    /// feed inbound datagrams to `net_tx`. Returns `(rtp_port, rtcp_port)`.
    pub(crate) fn bind_udp(
        &mut self,
        local_ip: std::net::IpAddr,
        net_tx: &mpsc::Sender<Datagram>,
    ) -> Result<(u16, u16), std::io::Error> {
        let pair = crate::tokio::UdpPair::for_ip(local_ip)?;
        let rtp = Arc::new(pair.rtp_socket);
        let rtcp = Arc::new(pair.rtcp_socket);
        spawn_datagram_forwarder(rtp.clone(), self.channel_id, ChannelKind::Rtp, net_tx.clone());
        spawn_datagram_forwarder(
            rtcp.clone(),
            self.channel_id,
            ChannelKind::Rtcp,
            net_tx.clone(),
        );
        self.rtp_socket = Some(rtp);
        self.rtcp_socket = Some(rtcp);
        self.stream_ctx = StreamContext::udp(local_ip, pair.rtp_port, local_ip, 0);
        Ok((pair.rtp_port, pair.rtp_port + 1))
    }

    /// Points this channel's UDP sockets at the peer once its ports are
    /// known, so outbound packets and receiver reports need no addressing.
    pub(crate) async fn connect_udp(
        &mut self,
        peer_ip: std::net::IpAddr,
        peer_rtp_port: u16,
    ) -> Result<(), std::io::Error> {
        if let Some(rtp) = &self.rtp_socket {
            rtp.connect((peer_ip, peer_rtp_port)).await?;
            let local = rtp.local_addr()?;
            self.stream_ctx = StreamContext::udp(local.ip(), local.port(), peer_ip, peer_rtp_port);
        }
        if let Some(rtcp) = &self.rtcp_socket {
            rtcp.connect((peer_ip, peer_rtp_port + 1)).await?;
        }
        Ok(())
    }

    /// Applies `RTP-Info` sync: the next expected sequence number and the
    /// RTP timestamp origin.
    pub(crate) fn sync(&mut self, seq: u16, rtptime: u32) {
        self.next_seq = Some(seq);
        self.timeline = Timeline::new(Some(rtptime), self.timescale)
            .expect("timescale was validated at channel creation");
    }

    /// Processes one inbound RTP packet, returning reassembled frames.
    ///
    /// Invalid packets (wrong version, CSRCs present, codec-level trouble)
    /// are reported as a [`PacketProblem`]; the caller logs and drops them.
    pub(crate) fn handle_rtp(
        &mut self,
        ctx: PacketContext,
        data: Bytes,
    ) -> Result<Vec<CodecItem>, PacketProblem> {
        let mut data = data;

        // Some servers wrap one RTSP interleaved message in another. RTP and
        // RTCP packets can never start with '$', so stripping the stray
        // header can't hurt a well-behaved peer.
        if data.len() > 4
            && data[0] == b'$'
            && usize::from(u16::from_be_bytes([data[2], data[3]])) <= data.len() - 4
        {
            log::debug!("stripping extra interleaved data header");
            bytes::Buf::advance(&mut data, 4);
        }

        let (raw, payload_range) =
            RawPacket::new(data).map_err(|e| PacketProblem(format!("bad RTP packet: {}", e.reason)))?;

        let sequence_number = raw.sequence_number();
        let ssrc = raw.ssrc();
        let loss = sequence_number.wrapping_sub(self.next_seq.unwrap_or(sequence_number));
        if matches!(self.ssrc, Some(s) if s != ssrc) || loss > 0x80_00 {
            return Err(PacketProblem(format!(
                "expected ssrc={:08x?} seq={:04x?} got ssrc={:08x} seq={:04x}",
                self.ssrc, self.next_seq, ssrc, sequence_number
            )));
        }
        // First non-null SSRC wins.
        self.ssrc.get_or_insert(ssrc);

        let timestamp = self
            .timeline
            .advance_to(raw.timestamp())
            .map_err(|e| PacketProblem(format!("timestamp error: {e}")))?;
        self.next_seq = Some(sequence_number.wrapping_add(1));
        self.last_seq = Some(sequence_number);

        let pkt = crate::rtp::ReceivedPacket {
            ctx,
            channel_id: self.channel_id,
            timestamp,
            raw,
            payload_range,
            loss,
        };
        self.depacketizer
            .push(pkt)
            .map_err(PacketProblem)?;
        let mut items = Vec::new();
        while let Some(item) = self.depacketizer.pull().map_err(PacketProblem)? {
            items.push(item);
        }
        Ok(items)
    }

    /// Processes one inbound RTCP compound packet.
    ///
    /// Stores sender-report state on the channel and returns a first DTS if
    /// the compound contained the peer's first-DTS APP packet.
    pub(crate) fn handle_rtcp(&mut self, data: &[u8]) -> Result<Option<i64>, PacketProblem> {
        crate::rtcp::ReceivedCompoundPacket::validate(data)
            .map_err(PacketProblem)?;
        let mut first_dts = None;
        let mut rest = data;
        while !rest.is_empty() {
            let (pkt, r) = crate::rtcp::PacketRef::parse(rest).map_err(PacketProblem)?;
            rest = r;
            if let Some(sr) = pkt.as_sender_report().map_err(PacketProblem)? {
                let ntp = sr.ntp_timestamp();
                let state = SrState {
                    ntp,
                    timecode: sr.rtp_timestamp(),
                    wall_clock_ms: ntp.unix_millis(),
                    last_sr_at: Instant::now(),
                };
                log::trace!(
                    "channel {} SR: wall clock {} ms, timecode {}",
                    self.channel_id,
                    state.wall_clock_ms,
                    state.timecode
                );
                self.sr = Some(state);
            } else if let Some(app) = pkt.as_first_dts().map_err(PacketProblem)? {
                first_dts = Some(app.first_dts_millis());
            }
        }
        Ok(first_dts)
    }

    /// Builds a receiver report if this channel has seen traffic and a sender
    /// report to echo.
    pub(crate) fn receiver_report(&self, now: Instant) -> Option<[u8; 32]> {
        let ssrc = self.ssrc?;
        let last_seq = self.last_seq?;
        let (last_sr, delay) = match &self.sr {
            Some(sr) => (sr.ntp.middle_bits(), sr.delay_since(now)),
            None => (0, 0),
        };
        Some(
            crate::rtcp::ReceiverReportBuilder {
                ssrc,
                source_ssrc: ssrc,
                extended_max_seq: u32::from(last_seq),
                last_sr,
                delay_since_last_sr: delay,
            }
            .build(),
        )
    }
}

/// Converts depacketized items onto the consumer's DTS/PTS timeline.
///
/// The receiving side of either role owns one of these: the first-DTS anchor
/// learned from the peer's RTCP APP packet, and the audio drift state.
#[derive(Debug, Default)]
pub(crate) struct InboundTiming {
    pub(crate) first_dts: FirstDts,
    drift: AudioDriftCorrector,
    last_video_dts: Option<i64>,
}

impl InboundTiming {
    /// Produces the consumer-facing frame for one depacketized item.
    pub(crate) fn frame(&mut self, item: CodecItem) -> Result<Frame, TooManyAudioShifts> {
        let base = self.first_dts.get().unwrap_or(0);
        match item {
            CodecItem::VideoFrame(v) => {
                let dts = base + v.timestamp().elapsed_millis();
                let cts_millis = match v.cts() {
                    Some(cts) => {
                        let rate = f64::from(v.timestamp().clock_rate().get());
                        ((f64::from(cts) * 1_000.0) / rate).round() as i64
                    }
                    None => 0,
                };
                self.last_video_dts = Some(dts);
                Ok(Frame {
                    kind: FrameKind::Video {
                        keyframe: v.is_random_access_point(),
                    },
                    dts,
                    pts: dts + cts_millis,
                    data: Bytes::from(v.into_data()),
                })
            }
            CodecItem::AudioFrame(a) => {
                let dts = base + a.timestamp().elapsed_millis();
                let dts = self.drift.correct(dts, self.last_video_dts)?;
                Ok(Frame {
                    kind: FrameKind::Audio,
                    dts,
                    pts: dts,
                    data: a.data,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interleaved_ids() {
        let d = Depacketizer::aac(8_000, None).unwrap();
        let ch = Channel::new(1, TrackContent::Audio, 8_000, d).unwrap();
        assert_eq!(ch.interleaved_ids(), (2, 3));
    }

    #[test]
    fn receiver_report_reports_last_received_seq() {
        let d = Depacketizer::aac(48_000, None).unwrap();
        let mut ch = Channel::new(1, TrackContent::Audio, 48_000, d).unwrap();

        // No traffic yet: nothing to report, even after RTP-Info sync.
        ch.sync(0, 0);
        assert!(ch.receiver_report(Instant::now()).is_none());

        // One AU of three bytes, sequence number 42.
        let (raw, _) = crate::rtp::RawPacketBuilder {
            sequence_number: 42,
            timestamp: 0,
            payload_type: 97,
            ssrc: 7,
            mark: true,
            cts: None,
        }
        .build(b"\x00\x10\x00\x18abc")
        .unwrap();
        ch.handle_rtp(PacketContext::dummy(), raw.0).unwrap();

        let rr = ch.receiver_report(Instant::now()).unwrap();
        assert_eq!(&rr[8..12], &7u32.to_be_bytes()); // source ssrc.
        // The extended highest sequence number is the one received, not the
        // next one expected.
        assert_eq!(&rr[16..20], &42u32.to_be_bytes());
    }

    #[test]
    fn dlsr_scale() {
        let now = Instant::now();
        let sr = SrState {
            ntp: NtpTimestamp(0),
            timecode: 0,
            wall_clock_ms: 0,
            last_sr_at: now - std::time::Duration::from_secs(1),
        };
        let dlsr = sr.delay_since(now);
        assert!((65_535..=65_537).contains(&dlsr), "dlsr={dlsr}");
    }
}
