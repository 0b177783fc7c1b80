// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP 1.0 session endpoint.
//!
//! This crate speaks both sides of RTSP: the [`server`] module streams
//! pre-existing media to a client, and the [`client`] module pulls media from
//! a camera or remote streamer. Both roles share the RTP/RTCP media plane
//! with TCP-interleaved and UDP transport, and the H.264/AAC packetization
//! paths in [`codec`].

#![forbid(clippy::print_stderr, clippy::print_stdout)]
// I prefer to use from_str_radix(..., 10) to explicitly note the base.
#![allow(clippy::from_str_radix_10)]

use std::fmt::{Debug, Display};
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::num::NonZeroU32;

mod error;
mod hex;

pub mod rtcp;
pub mod rtp;

#[cfg(test)]
mod testutil;

pub use error::Error;

/// Wraps the supplied `ErrorInt` and returns it as an `Err`.
macro_rules! bail {
    ($e:expr) => {
        return Err(crate::error::Error(std::sync::Arc::new($e)))
    };
}

macro_rules! wrap {
    ($e:expr) => {
        crate::error::Error(std::sync::Arc::new($e))
    };
}

pub mod auth;
pub mod client;
pub mod codec;
pub mod media;
pub mod server;
mod session;
mod timing;
mod tokio;

use error::ErrorInt;

pub use session::{ChannelId, KeepaliveMethod, TrackContent};

/// A received RTSP message.
#[derive(Debug)]
struct ReceivedMessage {
    ctx: RtspMessageContext,
    msg: rtsp_types::Message<bytes::Bytes>,
}

#[inline]
pub(crate) fn to_u64(v: usize) -> u64 {
    u64::try_from(v).expect("usize fits in u64")
}

/// An annotated RTP timestamp.
///
/// This couples together three pieces of information:
///
/// *   The stream's starting time, as learned from the RTSP `RTP-Info` header
///     or from the first received packet.
/// *   The codec-specific clock rate.
/// *   The timestamp as an `i64`, with its top bits inferred from wraparounds
///     of the 32-bit on-wire RTP timestamps.
///
/// In combination, these allow conversion to elapsed media time and then to
/// the millisecond DTS/PTS domain used at the [`media`] boundary.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Timestamp {
    /// A timestamp which must be compared to `start`.
    pub(crate) timestamp: i64,

    /// The codec-specified clock rate, in Hz. Must be non-zero.
    pub(crate) clock_rate: NonZeroU32,

    /// The stream's starting time.
    pub(crate) start: u32,
}

impl Timestamp {
    /// Creates a new timestamp unless `timestamp - start` underflows.
    #[inline]
    pub fn new(timestamp: i64, clock_rate: NonZeroU32, start: u32) -> Option<Self> {
        timestamp.checked_sub(i64::from(start)).map(|_| Timestamp {
            timestamp,
            clock_rate,
            start,
        })
    }

    /// Returns time since some arbitrary point before the stream started.
    #[inline]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Returns codec-specified clock rate, in Hz.
    #[inline]
    pub fn clock_rate(&self) -> NonZeroU32 {
        self.clock_rate
    }

    /// Returns elapsed time since the stream start in clock rate units.
    #[inline]
    pub fn elapsed(&self) -> i64 {
        self.timestamp - i64::from(self.start)
    }

    /// Returns elapsed time since the stream start in milliseconds, rounded.
    #[inline]
    pub fn elapsed_millis(&self) -> i64 {
        let rate = i64::from(self.clock_rate.get());
        let e = self.elapsed();
        (e * 1_000 + rate / 2).div_euclid(rate)
    }

    /// Returns `self + delta` unless it would overflow.
    pub fn try_add(&self, delta: u32) -> Option<Self> {
        // `timestamp - start` can't underflow because delta is non-negative.
        self.timestamp
            .checked_add(i64::from(delta))
            .map(|timestamp| Timestamp {
                timestamp,
                clock_rate: self.clock_rate,
                start: self.start,
            })
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (mod-2^32: {}), elapsed {} ms",
            self.timestamp,
            self.timestamp as u32,
            self.elapsed_millis()
        )
    }
}

impl Debug for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

/// Seconds between the NTP epoch (1900-01-01) and the Unix epoch (1970-01-01).
const NTP_UNIX_OFFSET_SECS: u64 = 2_208_988_800;

/// The Unix epoch as an [`NtpTimestamp`].
pub const UNIX_EPOCH: NtpTimestamp = NtpTimestamp(NTP_UNIX_OFFSET_SECS << 32);

/// A wallclock time represented using the format of the Network Time Protocol.
///
/// NTP timestamps are in a fixed-point representation of seconds since
/// 0h UTC on 1 January 1900. The top 32 bits represent the integer part
/// (wrapping around every 68 years) and the bottom 32 bits represent the
/// fractional part.
///
/// An `NtpTimestamp` isn't necessarily gathered from a real NTP server.
/// Reported NTP timestamps are allowed to jump backwards and/or be complete
/// nonsense.
#[derive(Copy, Clone, PartialEq, PartialOrd, Eq, Ord)]
pub struct NtpTimestamp(pub u64);

impl NtpTimestamp {
    /// Returns milliseconds since the Unix epoch, rounded.
    ///
    /// Negative for times before 1970.
    pub fn unix_millis(&self) -> i64 {
        let secs = (self.0 as f64) / ((1u64 << 32) as f64) - (NTP_UNIX_OFFSET_SECS as f64);
        (secs * 1_000.0).round() as i64
    }

    /// Returns the middle 32 bits, as echoed in receiver reports' LSR field.
    #[inline]
    pub fn middle_bits(&self) -> u32 {
        ((self.0 >> 16) & 0xFFFF_FFFF) as u32
    }
}

impl std::fmt::Display for NtpTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let date_time: chrono::DateTime<chrono::Utc> = (*self).into();
        write!(f, "{}", date_time.format("%FT%T%.3f%:z"))
    }
}

impl std::fmt::Debug for NtpTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Write both the raw and display forms.
        write!(f, "{} /* {} */", self.0, self)
    }
}

impl From<NtpTimestamp> for chrono::DateTime<chrono::Utc> {
    fn from(orig: NtpTimestamp) -> Self {
        let since_epoch = orig.0.wrapping_sub(UNIX_EPOCH.0);
        let sec_since_epoch = (since_epoch >> 32) as u32;
        let frac_int = (since_epoch & 0xFFFF_FFFF) as u32;
        let frac = frac_int as f64 / f64::from(u32::MAX);
        let nanos = (frac * 1e9).round() as u32;
        let timedelta = chrono::Duration::try_seconds(sec_since_epoch.into())
            .expect("u32 seconds is in range")
            + chrono::Duration::nanoseconds(nanos.into());
        chrono::DateTime::UNIX_EPOCH + timedelta
    }
}

/// A wall time taken from the local machine's realtime clock, used in error reporting.
#[derive(Copy, Clone, Debug)]
pub struct WallTime(chrono::DateTime<chrono::Utc>);

impl WallTime {
    fn now() -> Self {
        Self(chrono::Utc::now())
    }
}

impl Display for WallTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%FT%T"))
    }
}

/// RTSP connection context.
///
/// This gives enough information to pick out the flow in a packet capture.
#[derive(Copy, Clone, Debug)]
pub struct ConnectionContext {
    local_addr: std::net::SocketAddr,
    peer_addr: std::net::SocketAddr,
    established_wall: WallTime,
}

impl ConnectionContext {
    #[doc(hidden)]
    pub fn dummy() -> Self {
        let addr = SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0);
        Self {
            local_addr: addr,
            peer_addr: addr,
            established_wall: WallTime::now(),
        }
    }

    pub fn peer_addr(&self) -> std::net::SocketAddr {
        self.peer_addr
    }
}

impl Display for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}(me)<->{}@{}",
            &self.local_addr, &self.peer_addr, &self.established_wall,
        )
    }
}

/// Context of a received message (or read error) within an RTSP connection.
///
/// When paired with a [`ConnectionContext`], this should allow picking the
/// message out of a packet capture.
#[derive(Copy, Clone, Debug)]
pub struct RtspMessageContext {
    /// The starting byte position within the input stream. The bottom 32 bits
    /// can be compared to the relative TCP sequence number.
    pos: u64,

    /// Time when the application parsed the message. Caveat: this may not
    /// closely match the time on a packet capture if the application is
    /// overloaded (or if `CLOCK_REALTIME` jumps).
    received_wall: WallTime,
    received: std::time::Instant,
}

impl RtspMessageContext {
    #[doc(hidden)]
    pub fn dummy() -> Self {
        Self {
            pos: 0,
            received_wall: WallTime::now(),
            received: std::time::Instant::now(),
        }
    }

    pub fn received(&self) -> std::time::Instant {
        self.received
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }
}

impl Display for RtspMessageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.pos, &self.received_wall)
    }
}

/// Context for an active stream (RTP+RTCP pair), either TCP or UDP.
#[derive(Copy, Clone, Debug)]
pub struct StreamContext(StreamContextInner);

impl StreamContext {
    #[doc(hidden)]
    pub fn dummy() -> Self {
        StreamContext(StreamContextInner::Dummy)
    }

    pub(crate) fn tcp(rtp_channel_id: u8) -> Self {
        StreamContext(StreamContextInner::Tcp(TcpStreamContext { rtp_channel_id }))
    }

    pub(crate) fn udp(
        local_ip: IpAddr,
        local_rtp_port: u16,
        peer_ip: IpAddr,
        peer_rtp_port: u16,
    ) -> Self {
        StreamContext(StreamContextInner::Udp(UdpStreamContext {
            local_ip,
            peer_ip,
            local_rtp_port,
            peer_rtp_port,
        }))
    }
}

impl Display for StreamContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            StreamContextInner::Tcp(tcp) => {
                write!(
                    f,
                    "TCP, interleaved channel ids {}-{}",
                    tcp.rtp_channel_id,
                    tcp.rtp_channel_id + 1
                )
            }
            StreamContextInner::Udp(udp) => Display::fmt(udp, f),
            StreamContextInner::Dummy => write!(f, "dummy"),
        }
    }
}

#[derive(Copy, Clone, Debug)]
enum StreamContextInner {
    Tcp(TcpStreamContext),
    Udp(UdpStreamContext),
    Dummy,
}

/// Context for a UDP stream (aka UDP-based RTP transport).
///
/// This stores only the RTP addresses; the RTCP addresses are assumed to use
/// the same IP and one port higher.
#[derive(Copy, Clone, Debug)]
struct UdpStreamContext {
    local_ip: IpAddr,
    peer_ip: IpAddr,
    local_rtp_port: u16,
    peer_rtp_port: u16,
}

/// Context for a TCP stream.
///
/// This stores only the RTP channel id; the RTCP channel id is assumed to be one higher.
#[derive(Copy, Clone, Debug)]
struct TcpStreamContext {
    rtp_channel_id: u8,
}

impl Display for UdpStreamContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}-{}(me) <-> {}:{}-{}",
            self.local_ip,
            self.local_rtp_port,
            self.local_rtp_port + 1,
            self.peer_ip,
            self.peer_rtp_port,
            self.peer_rtp_port + 1
        )
    }
}

/// Context for an RTP or RTCP packet, received either via RTSP interleaved data or UDP.
///
/// Should be paired with a [`ConnectionContext`] of the RTSP connection that started
/// the session. In the interleaved data case, it's assumed the packet was received over
/// that same connection.
#[derive(Copy, Clone, Debug)]
pub struct PacketContext(PacketContextInner);

impl PacketContext {
    #[doc(hidden)]
    pub fn dummy() -> PacketContext {
        Self(PacketContextInner::Dummy)
    }

    pub(crate) fn tcp(msg_ctx: RtspMessageContext) -> Self {
        Self(PacketContextInner::Tcp { msg_ctx })
    }

    pub(crate) fn udp() -> Self {
        Self(PacketContextInner::Udp {
            received_wall: WallTime::now(),
        })
    }
}

#[derive(Copy, Clone, Debug)]
enum PacketContextInner {
    Tcp { msg_ctx: RtspMessageContext },
    Udp { received_wall: WallTime },
    Dummy,
}

impl Display for PacketContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            PacketContextInner::Udp { received_wall } => std::fmt::Display::fmt(&received_wall, f),
            PacketContextInner::Tcp { msg_ctx } => std::fmt::Display::fmt(&msg_ctx, f),
            PacketContextInner::Dummy => write!(f, "dummy"),
        }
    }
}

/// Returns the range within `buf` that represents `subset`.
/// If `subset` is empty, returns None; otherwise panics if `subset` is not within `buf`.
pub(crate) fn as_range(buf: &[u8], subset: &[u8]) -> Option<std::ops::Range<usize>> {
    if subset.is_empty() {
        return None;
    }
    let subset_p = subset.as_ptr() as usize;
    let buf_p = buf.as_ptr() as usize;
    let off = match subset_p.checked_sub(buf_p) {
        Some(off) => off,
        None => panic!(
            "{}-byte subset not within {}-byte buf",
            subset.len(),
            buf.len()
        ),
    };
    let end = off + subset.len();
    assert!(end <= buf.len());
    Some(off..end)
}

/// A pair of local UDP sockets used for RTP and RTCP transmission.
///
/// The RTP port is always even, and the RTCP port is always the following (odd) integer.
struct UdpPair {
    rtp_port: u16,
    rtp_socket: UdpSocket,
    rtcp_socket: UdpSocket,
}

/// Lowest (inclusive) and highest (exclusive) start ports tried first.
const UDP_START_PORT_RANGE: std::ops::Range<u16> = 10_000..20_000;

/// Binding never walks past this port.
const UDP_LAST_PORT: u16 = 60_000;

impl UdpPair {
    /// Binds an even/odd port pair, starting from a random even port in
    /// `[10000, 20000)` and walking upward by two on collision. Gives up with
    /// `AddrInUse` when the walk reaches 60000.
    fn for_ip(ip_addr: IpAddr) -> Result<Self, std::io::Error> {
        use rand::Rng as _;
        let start = rand::thread_rng().gen_range(UDP_START_PORT_RANGE) & !0b1;
        debug_assert!(UDP_START_PORT_RANGE.contains(&start));
        let mut rtp_port = start;
        while rtp_port < UDP_LAST_PORT {
            let rtp_addr = SocketAddr::new(ip_addr, rtp_port);
            let rtp_socket = match UdpSocket::bind(rtp_addr) {
                Ok(s) => s,
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    log::trace!("unable to bind RTP addr {:?}; walking up", rtp_addr);
                    rtp_port += 2;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let rtcp_addr = SocketAddr::new(ip_addr, rtp_port + 1);
            let rtcp_socket = match UdpSocket::bind(rtcp_addr) {
                Ok(s) => s,
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    log::trace!("unable to bind RTCP addr {:?}; walking up", rtcp_addr);
                    rtp_port += 2;
                    continue;
                }
                Err(e) => return Err(e),
            };
            return Ok(Self {
                rtp_port,
                rtp_socket,
                rtcp_socket,
            });
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            format!(
                "no free even/odd UDP port pair on {} in {}..{}",
                ip_addr, start, UDP_LAST_PORT
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn ntp_unix_millis() {
        // Exactly the Unix epoch.
        assert_eq!(UNIX_EPOCH.unix_millis(), 0);

        // Half a second past the Unix epoch.
        assert_eq!(NtpTimestamp(UNIX_EPOCH.0 + (1 << 31)).unix_millis(), 500);

        // A second before the Unix epoch.
        assert_eq!(NtpTimestamp(UNIX_EPOCH.0 - (1 << 32)).unix_millis(), -1000);
    }

    #[test]
    fn ntp_middle_bits() {
        assert_eq!(
            NtpTimestamp(0x1111_2222_3333_4444).middle_bits(),
            0x2222_3333
        );
    }

    #[test]
    fn local_udp_pair() {
        let pair = UdpPair::for_ip(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
        assert_eq!(pair.rtp_port & 1, 0);
        assert!((10_000..60_000).contains(&pair.rtp_port));
        assert_eq!(
            pair.rtcp_socket.local_addr().unwrap().port(),
            pair.rtp_port + 1
        );
    }

    #[test]
    fn elapsed_millis_rounds() {
        let t = Timestamp {
            timestamp: 90_045, // at 90 kHz, 45 ticks round up to the next ms
            clock_rate: NonZeroU32::new(90_000).unwrap(),
            start: 0,
        };
        assert_eq!(t.elapsed_millis(), 1001);
    }
}
