// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parsing of RTSP response headers the client cares about: `CSeq`,
//! `Session`, `Public`, `Transport`, and `RTP-Info`.

use std::net::IpAddr;

use bytes::Bytes;

use crate::KeepaliveMethod;

pub(crate) fn get_cseq(response: &rtsp_types::Response<Bytes>) -> Option<u32> {
    response
        .header(&rtsp_types::headers::CSEQ)
        .and_then(|cseq| u32::from_str_radix(cseq.as_str(), 10).ok())
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct SessionHeader {
    pub(crate) id: Box<str>,
    pub(crate) timeout_sec: u32,
}

/// Parses a `Session` header value:
/// [RFC 2326 section 12.37](https://datatracker.ietf.org/doc/html/rfc2326#section-12.37).
///
/// The id is the first semicolon-delimited token; a `timeout` parameter is
/// honored when present and well-formed.
pub(crate) fn parse_session(value: &str) -> SessionHeader {
    match value.split_once(';') {
        None => SessionHeader {
            id: value.trim().into(),
            timeout_sec: 60, // default
        },
        Some((id, params)) => {
            let timeout_sec = params
                .trim()
                .strip_prefix("timeout=")
                .and_then(|v| u32::from_str_radix(v.trim(), 10).ok())
                .unwrap_or(60);
            SessionHeader {
                id: id.trim().into(),
                timeout_sec,
            }
        }
    }
}

/// Chooses the keep-alive method from a `Public` header value.
///
/// `GET_PARAMETER` is preferred when the peer advertises it; every RTSP
/// server handles `OPTIONS`.
pub(crate) fn keepalive_from_public(value: &str) -> KeepaliveMethod {
    let supports_get_parameter = value
        .split(',')
        .any(|m| m.trim().eq_ignore_ascii_case("GET_PARAMETER"));
    if supports_get_parameter {
        KeepaliveMethod::GetParameter
    } else {
        KeepaliveMethod::Options
    }
}

/// One stream's entry in an `RTP-Info` header.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct RtpInfoEntry {
    pub(crate) url: String,
    pub(crate) seq: Option<u16>,
    pub(crate) rtptime: Option<u32>,
}

/// Parses an `RTP-Info` header value:
/// [RFC 2326 section 12.33](https://tools.ietf.org/html/rfc2326#section-12.33).
pub(crate) fn parse_rtp_info(value: &str) -> Result<Vec<RtpInfoEntry>, String> {
    let mut entries = Vec::new();
    for s in value.split(',') {
        let s = s.trim();
        if s.is_empty() {
            continue;
        }
        let mut parts = s.split(';');
        let url = parts
            .next()
            .expect("split always returns at least one part")
            .trim()
            .strip_prefix("url=")
            .ok_or_else(|| "RTP-Info missing stream URL".to_string())?
            .to_owned();
        let mut entry = RtpInfoEntry {
            url,
            ..Default::default()
        };
        for part in parts {
            let part = part.trim();
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| "RTP-Info param has no =".to_string())?;
            match key {
                "seq" => {
                    let seq = u16::from_str_radix(value, 10)
                        .map_err(|_| format!("bad seq {value:?}"))?;
                    entry.seq = Some(seq);
                }
                "rtptime" => {
                    let rtptime = u32::from_str_radix(value, 10)
                        .map_err(|_| format!("bad rtptime {value:?}"))?;
                    entry.rtptime = Some(rtptime);
                }
                _ => {}
            }
        }
        entries.push(entry);
    }
    Ok(entries)
}

/// The track index parsed from a `/trackID=N` suffix of a control URL.
pub(crate) fn parse_track_id(url: &str) -> Option<usize> {
    let (_, suffix) = url.rsplit_once("trackID=")?;
    let end = suffix
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(suffix.len());
    usize::from_str_radix(&suffix[..end], 10).ok()
}

/// Transport parameters from a `SETUP` response.
///
/// The `server_port` pair is what callers feed back through
/// [`crate::client::ClientHandle::connect_channel`] on UDP setups.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TransportResponse {
    pub channel_id: Option<u8>,
    pub ssrc: Option<u32>,
    pub source: Option<IpAddr>,
    pub server_port: Option<(u16, u16)>,
}

/// Parses a `Transport` header from a `SETUP` response.
pub fn parse_transport(value: &str) -> Result<TransportResponse, String> {
    let mut out = TransportResponse::default();
    for part in value.split(';') {
        let part = part.trim();
        if let Some(v) = part.strip_prefix("ssrc=") {
            let v = u32::from_str_radix(v, 16).map_err(|_| format!("unparseable ssrc {v}"))?;
            out.ssrc = Some(v);
        } else if let Some(interleaved) = part.strip_prefix("interleaved=") {
            let mut channels = interleaved.splitn(2, '-');
            let n = channels.next().expect("splitn returns at least one part");
            let n = u8::from_str_radix(n, 10).map_err(|_| format!("bad channel number {n}"))?;
            if let Some(m) = channels.next() {
                let m = u8::from_str_radix(m, 10)
                    .map_err(|_| format!("bad second channel number {m}"))?;
                if n.checked_add(1) != Some(m) {
                    return Err(format!("expected adjacent channels; got {n}-{m}"));
                }
            }
            out.channel_id = Some(n);
        } else if let Some(s) = part.strip_prefix("source=") {
            out.source = Some(
                s.parse()
                    .map_err(|_| format!("Transport header has unparseable source {s:?}"))?,
            );
        } else if let Some(s) = part.strip_prefix("server_port=") {
            let mut ports = s.splitn(2, '-');
            let n = ports.next().expect("splitn returns at least one part");
            let n =
                u16::from_str_radix(n, 10).map_err(|_| format!("bad port in Transport: {value}"))?;
            match ports.next() {
                Some(m) => {
                    let m =
                        u16::from_str_radix(m, 10).map_err(|_| format!("bad second port {m}"))?;
                    out.server_port = Some((n, m));
                }
                None => out.server_port = Some((n, n + 1)),
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cseq() {
        let response = crate::testutil::response(b"RTSP/1.0 200 OK\r\nCSeq: 5\r\n\r\n");
        assert_eq!(get_cseq(&response), Some(5));
        let response = crate::testutil::response(b"RTSP/1.0 200 OK\r\nCSeq: nope\r\n\r\n");
        assert_eq!(get_cseq(&response), None);
    }

    #[test]
    fn session_header() {
        assert_eq!(
            parse_session("234881042"),
            SessionHeader {
                id: "234881042".into(),
                timeout_sec: 60
            }
        );
        assert_eq!(
            parse_session("ABC123;timeout=30"),
            SessionHeader {
                id: "ABC123".into(),
                timeout_sec: 30
            }
        );
        // Only the first semicolon-delimited token is the id.
        assert_eq!(parse_session("X;foo=bar").id, "X".into());
    }

    #[test]
    fn rtp_info() {
        let entries =
            parse_rtp_info("url=rtsp://75.130.113.168:1025/11/trackID=0;seq=0;rtptime=3051549469 ")
                .unwrap();
        assert_eq!(
            entries,
            vec![RtpInfoEntry {
                url: "rtsp://75.130.113.168:1025/11/trackID=0".to_owned(),
                seq: Some(0),
                rtptime: Some(3051549469),
            }]
        );
    }

    #[test]
    fn rtp_info_two_streams() {
        let entries = parse_rtp_info(
            "url=rtsp://host/stream/trackID=0;seq=9921;rtptime=3450012,\
             url=rtsp://host/stream/trackID=1;seq=254;rtptime=1200",
        )
        .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(parse_track_id(&entries[0].url), Some(0));
        assert_eq!(parse_track_id(&entries[1].url), Some(1));
        assert_eq!(entries[1].seq, Some(254));
    }

    #[test]
    fn track_id() {
        assert_eq!(parse_track_id("rtsp://host/path/trackID=1"), Some(1));
        assert_eq!(parse_track_id("rtsp://host/path/trackID=0?x=y"), Some(0));
        assert_eq!(parse_track_id("rtsp://host/path"), None);
    }

    #[test]
    fn keepalive_choice() {
        assert_eq!(
            keepalive_from_public("OPTIONS, DESCRIBE, GET_PARAMETER"),
            KeepaliveMethod::GetParameter
        );
        assert_eq!(
            keepalive_from_public("OPTIONS, DESCRIBE, PLAY"),
            KeepaliveMethod::Options
        );
    }

    #[test]
    fn transport_udp() {
        let t = parse_transport("RTP/AVP;unicast;client_port=9000-9001;server_port=6256-6257")
            .unwrap();
        assert_eq!(t.server_port, Some((6256, 6257)));
        assert_eq!(t.channel_id, None);
    }

    #[test]
    fn transport_interleaved() {
        let t = parse_transport("RTP/AVP/TCP;unicast;interleaved=0-1;ssrc=4F92B8A6").unwrap();
        assert_eq!(t.channel_id, Some(0));
        assert_eq!(t.ssrc, Some(0x4F92_B8A6));
    }
}
