// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! SDP in and out of [`MediaInfo`]: `ANNOUNCE` bodies are decoded, `DESCRIBE`
//! bodies are emitted. Only the video and audio m-sections matter; anything
//! else a peer declares is skipped.

use base64::Engine as _;
use bytes::Bytes;
use url::Url;

use crate::codec::{AUDIO_PAYLOAD_TYPE, VIDEO_PAYLOAD_TYPE};
use crate::media::{AudioInfo, MediaInfo, VideoInfo};

/// Decodes an `ANNOUNCE` body into a [`MediaInfo`].
pub(crate) fn media_info_from_sdp(body: &[u8]) -> Result<MediaInfo, String> {
    let sdp = sdp_types::Session::parse(body).map_err(|e| format!("unparseable SDP: {e}"))?;
    let mut info = MediaInfo::default();
    for media in &sdp.medias {
        match media.media.as_str() {
            "video" => info.video = Some(parse_video(media)?),
            "audio" => info.audio = Some(parse_audio(media)?),
            other => log::debug!("skipping {other} m-section in SDP"),
        }
    }
    if info.video.is_none() && info.audio.is_none() {
        return Err("SDP has neither a video nor an audio m-section".into());
    }
    Ok(info)
}

/// The rtpmap and fmtp values belonging to the media's first payload type.
fn interesting_attributes<'m>(
    media: &'m sdp_types::Media,
) -> Result<(Option<&'m str>, Option<&'m str>), String> {
    let payload_type = media
        .fmt
        .split_ascii_whitespace()
        .next()
        .ok_or_else(|| "m-section with no payload type".to_string())?;
    let mut rtpmap = None;
    let mut fmtp = None;
    for a in &media.attributes {
        if a.attribute == "rtpmap" {
            let v = a
                .value
                .as_ref()
                .ok_or_else(|| "rtpmap attribute with no value".to_string())?;
            if let Some((pt, v)) = v.split_once(' ') {
                if pt == payload_type {
                    rtpmap = Some(v);
                }
            }
        } else if a.attribute == "fmtp" {
            let v = a
                .value
                .as_ref()
                .ok_or_else(|| "fmtp attribute with no value".to_string())?;
            if let Some((pt, v)) = v.split_once(' ') {
                if pt == payload_type {
                    fmtp = Some(v);
                }
            }
        }
    }
    Ok((rtpmap, fmtp))
}

fn clock_rate_from_rtpmap(rtpmap: &str) -> Result<(u32, Option<u16>), String> {
    // rtpmap-value (after the payload type) = encoding-name
    //   "/" clock-rate [ "/" channels ]
    let mut parts = rtpmap.split('/');
    let _encoding = parts.next();
    let clock_rate = parts
        .next()
        .and_then(|c| u32::from_str_radix(c.trim(), 10).ok())
        .ok_or_else(|| format!("rtpmap {rtpmap:?} has no clock rate"))?;
    let channels = parts.next().and_then(|c| u16::from_str_radix(c.trim(), 10).ok());
    Ok((clock_rate, channels))
}

fn parse_video(media: &sdp_types::Media) -> Result<VideoInfo, String> {
    let (rtpmap, fmtp) = interesting_attributes(media)?;
    let clock_rate = match rtpmap {
        Some(r) => clock_rate_from_rtpmap(r)?.0,
        None => 90_000,
    };
    let mut sps = None;
    let mut pps = None;
    if let Some(fmtp) = fmtp {
        for param in fmtp.split(';') {
            let param = param.trim();
            if let Some(sets) = param.strip_prefix("sprop-parameter-sets=") {
                for set in sets.split(',') {
                    let nal = base64::engine::general_purpose::STANDARD
                        .decode(set)
                        .map_err(|_| "sprop parameter set has invalid base64".to_string())?;
                    if nal.is_empty() {
                        return Err("empty sprop parameter set".into());
                    }
                    match nal[0] & 0x1f {
                        7 => sps = Some(Bytes::from(nal)),
                        8 => pps = Some(Bytes::from(nal)),
                        t => return Err(format!("unexpected NAL type {t} in sprop sets")),
                    }
                }
            }
        }
    }
    Ok(VideoInfo {
        timescale: clock_rate,
        length_size: 4,
        sps: sps.ok_or_else(|| "video m-section with no SPS".to_string())?,
        pps: pps.ok_or_else(|| "video m-section with no PPS".to_string())?,
    })
}

fn parse_audio(media: &sdp_types::Media) -> Result<AudioInfo, String> {
    let (rtpmap, fmtp) = interesting_attributes(media)?;
    let (clock_rate, channels) = match rtpmap {
        Some(r) => clock_rate_from_rtpmap(r)?,
        None => (48_000, None),
    };
    let mut config = None;
    if let Some(fmtp) = fmtp {
        for param in fmtp.split(';') {
            let param = param.trim();
            if let Some(hex_config) = param.strip_prefix("config=") {
                config = Some(Bytes::from(
                    hex::decode(hex_config)
                        .map_err(|_| "config has invalid hex encoding".to_string())?,
                ));
            }
        }
    }
    Ok(AudioInfo {
        timescale: clock_rate,
        config: config.ok_or_else(|| "audio m-section with no config".to_string())?,
        channels,
    })
}

/// Emits a `DESCRIBE` body for the presentation.
///
/// Stream-level options of the source are deliberately not reproduced: only
/// the video and audio tracks with their codec parameters and per-track
/// control URLs appear.
pub(crate) fn media_info_to_sdp(info: &MediaInfo, session_id: &str, url: &Url) -> String {
    use std::fmt::Write as _;

    let mut out = String::new();
    let _ = write!(
        out,
        "v=0\r\n\
         o=- {session_id} {session_id} IN IP4 0.0.0.0\r\n\
         s=-\r\n\
         a=control:{url}/\r\n\
         t=0 0\r\n"
    );
    if let Some(video) = &info.video {
        let b64 = base64::engine::general_purpose::STANDARD;
        let _ = write!(
            out,
            "m=video 0 RTP/AVP {pt}\r\n\
             a=control:trackID=0\r\n\
             a=rtpmap:{pt} H264/{clock}\r\n\
             a=fmtp:{pt} packetization-mode=1; sprop-parameter-sets={sps},{pps}\r\n",
            pt = VIDEO_PAYLOAD_TYPE,
            clock = video.timescale,
            sps = b64.encode(&video.sps),
            pps = b64.encode(&video.pps),
        );
    }
    if let Some(audio) = &info.audio {
        let channels = audio.channels.unwrap_or(2);
        let _ = write!(
            out,
            "m=audio 0 RTP/AVP {pt}\r\n\
             a=control:trackID=1\r\n\
             a=rtpmap:{pt} mpeg4-generic/{clock}/{channels}\r\n\
             a=fmtp:{pt} profile-level-id=1; mode=AAC-hbr; sizelength=13; indexlength=3; \
             indexdeltalength=3; config={config}\r\n",
            pt = AUDIO_PAYLOAD_TYPE,
            clock = audio.timescale,
            config = hex::encode(&audio.config),
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const ANNOUNCED: &[u8] = b"v=0\r\n\
        o=- 0 0 IN IP4 127.0.0.1\r\n\
        s=Big Buck Bunny\r\n\
        t=0 0\r\n\
        m=video 0 RTP/AVP 96\r\n\
        a=control:trackID=0\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=fmtp:96 packetization-mode=1; sprop-parameter-sets=Z0LAHtkDxWhAAAADAEAAAAwDxYuS,aMuMsg==\r\n\
        m=audio 0 RTP/AVP 97\r\n\
        a=control:trackID=1\r\n\
        a=rtpmap:97 mpeg4-generic/48000/2\r\n\
        a=fmtp:97 profile-level-id=1; mode=AAC-hbr; sizelength=13; indexlength=3; \
        indexdeltalength=3; config=1190\r\n";

    #[test]
    fn announce_round_trip() {
        let info = media_info_from_sdp(ANNOUNCED).unwrap();
        let video = info.video.as_ref().unwrap();
        assert_eq!(video.timescale, 90_000);
        assert_eq!(video.sps[0] & 0x1f, 7);
        assert_eq!(video.pps[0] & 0x1f, 8);
        let audio = info.audio.as_ref().unwrap();
        assert_eq!(audio.timescale, 48_000);
        assert_eq!(audio.channels, Some(2));
        assert_eq!(&audio.config[..], b"\x11\x90");

        let url = Url::parse("rtsp://127.0.0.1/stream").unwrap();
        let emitted = media_info_to_sdp(&info, "1234", &url);
        let reparsed = media_info_from_sdp(emitted.as_bytes()).unwrap();
        assert_eq!(
            reparsed.video.as_ref().unwrap().sps,
            info.video.as_ref().unwrap().sps
        );
        assert_eq!(
            reparsed.audio.as_ref().unwrap().config,
            info.audio.as_ref().unwrap().config
        );
        assert!(emitted.contains("a=control:trackID=0"));
        assert!(emitted.contains("a=control:trackID=1"));
    }

    #[test]
    fn missing_tracks_rejected() {
        media_info_from_sdp(b"v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\n").unwrap_err();
    }
}
