// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Timestamp reconciliation: widening 32-bit RTP timestamps, anchoring the
//! stream's first DTS, and keeping audio within bounds of video.

use std::num::NonZeroU32;

use crate::Timestamp;

/// Audio whose corrected DTS deviates from the latest video DTS by more than
/// this many milliseconds is clamped onto the video timeline.
const MAX_AUDIO_DEVIATION_MILLIS: i64 = 10_000;

/// Clamping this many times gives up on the stream entirely.
const MAX_AUDIO_SHIFTS: u32 = 6;

/// Only the first few clamps are logged; a stream that keeps drifting would
/// otherwise flood the log on every audio frame.
const LOGGED_AUDIO_SHIFTS: u32 = 3;

/// Creates [`Timestamp`]s (which don't wrap and can be converted to elapsed
/// media time) from 32-bit (wrapping) RTP timestamps.
#[derive(Debug)]
pub(crate) struct Timeline {
    timestamp: i64,
    clock_rate: NonZeroU32,
    start: Option<u32>,
}

impl Timeline {
    /// Creates a new timeline, erroring on a zero clock rate.
    ///
    /// `start` is the initial RTP timestamp when known (from `RTP-Info`); when
    /// absent, the first observed packet defines the origin.
    pub(crate) fn new(start: Option<u32>, clock_rate: u32) -> Result<Self, String> {
        let clock_rate = NonZeroU32::new(clock_rate)
            .ok_or_else(|| "clock_rate=0 rejected to prevent division by zero".to_string())?;
        Ok(Timeline {
            timestamp: i64::from(start.unwrap_or(0)),
            start,
            clock_rate,
        })
    }

    /// Advances to the given (wrapping) RTP timestamp.
    ///
    /// Timestamps that differ by more than `i32::MAX` from the previous
    /// timestamp are treated as backward jumps; both directions are tolerated.
    pub(crate) fn advance_to(&mut self, rtp_timestamp: u32) -> Result<Timestamp, String> {
        let timestamp = self.place_inner(rtp_timestamp)?;
        self.timestamp = timestamp.timestamp;
        Ok(timestamp)
    }

    /// Places `rtp_timestamp` on the timeline without advancing the timeline.
    ///
    /// This is useful for RTP timestamps in RTCP packets. They commonly refer
    /// to a time slightly before the most recent timestamp of the matching
    /// RTP stream.
    pub(crate) fn place(&mut self, rtp_timestamp: u32) -> Result<Timestamp, String> {
        self.place_inner(rtp_timestamp)
    }

    fn place_inner(&mut self, rtp_timestamp: u32) -> Result<Timestamp, String> {
        let start = match self.start {
            None => {
                self.start = Some(rtp_timestamp);
                self.timestamp = i64::from(rtp_timestamp);
                rtp_timestamp
            }
            Some(start) => start,
        };
        let delta = (rtp_timestamp as i32).wrapping_sub(self.timestamp as i32);
        let timestamp = self
            .timestamp
            .checked_add(i64::from(delta))
            .ok_or_else(|| {
                // It'd take ~2^31 packets to advance the time this far forward
                // or backward even with a hostile peer.
                format!(
                    "timestamp {} + delta {} won't fit in i64!",
                    self.timestamp, delta
                )
            })?;
        if timestamp.checked_sub(i64::from(start)).is_none() {
            return Err(format!(
                "timestamp {} + delta {} - start {} underflows i64!",
                self.timestamp, delta, start
            ));
        }
        Ok(Timestamp {
            timestamp,
            clock_rate: self.clock_rate,
            start,
        })
    }
}

/// The DTS of the first frame sent or received on a session.
///
/// Set once per session and never changed. Outbound frames have it subtracted
/// so the wire timeline starts at zero; inbound frames have it added back
/// (once learned from the peer's `FlFD` RTCP packet) so the consumer sees
/// absolute stream time.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct FirstDts(Option<i64>);

impl FirstDts {
    #[inline]
    pub(crate) fn get(&self) -> Option<i64> {
        self.0
    }

    /// Records `dts` as the anchor if none is set yet; returns the anchor.
    #[inline]
    pub(crate) fn anchor(&mut self, dts: i64) -> i64 {
        *self.0.get_or_insert(dts)
    }

    /// Learns the anchor from the peer. The first value wins.
    #[inline]
    pub(crate) fn learn(&mut self, dts: i64) {
        self.0.get_or_insert(dts);
    }
}

/// Keeps forwarded audio DTS within [`MAX_AUDIO_DEVIATION_MILLIS`] of video.
///
/// Some streamers restart their audio clock mid-stream or interleave audio
/// from a different epoch entirely. Rather than forward a timeline the
/// consumer can't make sense of, audio is clamped onto the video timeline and
/// the offset is remembered so subsequent audio frames land consistently.
#[derive(Debug, Default)]
pub(crate) struct AudioDriftCorrector {
    shift: i64,
    shift_count: u32,
}

/// Returned when the corrector has clamped [`MAX_AUDIO_SHIFTS`] times.
#[derive(Debug)]
pub(crate) struct TooManyAudioShifts {
    pub(crate) shift_count: u32,
}

impl AudioDriftCorrector {
    #[cfg(test)]
    pub(crate) fn shift(&self) -> i64 {
        self.shift
    }

    /// Corrects one audio DTS against the most recent video DTS.
    ///
    /// With no video reference yet, audio passes through (minus any
    /// previously established shift).
    pub(crate) fn correct(
        &mut self,
        audio_dts: i64,
        video_dts: Option<i64>,
    ) -> Result<i64, TooManyAudioShifts> {
        let corrected = audio_dts - self.shift;
        let Some(video_dts) = video_dts else {
            return Ok(corrected);
        };
        if (video_dts - corrected).abs() <= MAX_AUDIO_DEVIATION_MILLIS {
            return Ok(corrected);
        }
        self.shift = audio_dts - video_dts;
        self.shift_count += 1;
        if self.shift_count <= LOGGED_AUDIO_SHIFTS {
            log::warn!(
                "audio DTS {} deviates from video DTS {}; shifting audio by {} (adjustment #{})",
                audio_dts,
                video_dts,
                self.shift,
                self.shift_count
            );
        }
        if self.shift_count >= MAX_AUDIO_SHIFTS {
            return Err(TooManyAudioShifts {
                shift_count: self.shift_count,
            });
        }
        Ok(video_dts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeline() {
        // Don't allow a zero clock rate.
        Timeline::new(Some(0), 0).unwrap_err();

        // ...but do allow backward RTP timestamps in RTCP.
        let mut t = Timeline::new(Some(100), 90_000).unwrap();
        assert_eq!(t.place(99).unwrap().elapsed(), -1);
        assert_eq!(t.advance_to(101).unwrap().elapsed(), 1);

        // Normal usage.
        let mut t = Timeline::new(Some(42), 90_000).unwrap();
        assert_eq!(t.advance_to(83).unwrap().elapsed(), 83 - 42);
        assert_eq!(t.advance_to(453).unwrap().elapsed(), 453 - 42);

        // Wraparound is normal too.
        let mut t = Timeline::new(Some(u32::MAX), 90_000).unwrap();
        assert_eq!(t.advance_to(5).unwrap().elapsed(), 5 + 1);

        // No initial rtptime.
        let mut t = Timeline::new(None, 90_000).unwrap();
        assert_eq!(t.advance_to(218_250_000).unwrap().elapsed(), 0);
    }

    #[test]
    fn first_dts_set_once() {
        let mut f = FirstDts::default();
        assert_eq!(f.get(), None);
        assert_eq!(f.anchor(1_000), 1_000);
        assert_eq!(f.anchor(2_000), 1_000);
        f.learn(3_000);
        assert_eq!(f.get(), Some(1_000));
    }

    #[test]
    fn drift_passthrough() {
        let mut c = AudioDriftCorrector::default();
        assert_eq!(c.correct(500, None).unwrap(), 500);
        assert_eq!(c.correct(500, Some(600)).unwrap(), 500);
        assert_eq!(c.correct(10_600, Some(600)).unwrap(), 10_600);
    }

    #[test]
    fn drift_clamp() {
        let mut c = AudioDriftCorrector::default();
        let audio = 25_000;
        let video = 600;
        // |video - audio| > 10000: the frame is clamped onto the video
        // timeline and the new shift absorbs subsequent frames.
        assert_eq!(c.correct(audio, Some(video)).unwrap(), video);
        assert_eq!(c.shift(), audio - video);
        assert_eq!(c.correct(audio + 20, Some(video)).unwrap(), video + 20);
    }

    #[test]
    fn drift_gives_up() {
        let mut c = AudioDriftCorrector::default();
        for i in 0..5u32 {
            let jump = 100_000 * i64::from(i + 1);
            c.correct(jump, Some(0)).unwrap();
        }
        let err = c.correct(1_000_000, Some(0)).unwrap_err();
        assert_eq!(err.shift_count, 6);
    }
}
