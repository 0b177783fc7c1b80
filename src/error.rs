// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{fmt::Display, sync::Arc};

use crate::{ConnectionContext, RtspMessageContext};
use thiserror::Error;

/// An opaque `std::error::Error + Send + Sync + 'static` implementation.
///
/// The focus is on detailed human-readable error messages; in most cases they
/// have enough information to find the offending packet in Wireshark.
#[derive(Clone)]
pub struct Error(pub(crate) Arc<ErrorInt>);

impl Error {
    /// Returns true iff this error is the audio drift limit being exceeded.
    ///
    /// Embedders may wish to treat this as a cue to resubscribe rather than as
    /// a fatal stream error.
    pub fn is_audio_drift_exceeded(&self) -> bool {
        matches!(self.0.as_ref(), ErrorInt::AudioDriftExceeded { .. })
    }

    /// Returns true iff this error is a client call timing out.
    pub fn is_timeout(&self) -> bool {
        matches!(self.0.as_ref(), ErrorInt::Timeout)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Error)]
pub(crate) enum ErrorInt {
    /// The method's caller provided an invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Unparseable or unexpected RTSP message.
    #[error("RTSP framing error: {description}\n\nconn: {conn_ctx}\nmsg: {msg_ctx}")]
    RtspFramingError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        description: String,
    },

    #[error("Unable to connect to RTSP peer: {0}")]
    ConnectError(#[source] std::io::Error),

    #[error("Error reading from RTSP peer: {source}\n\nconn: {conn_ctx}\nmsg: {msg_ctx}")]
    RtspReadError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        source: std::io::Error,
    },

    #[error("Error writing to RTSP peer: {source}\n\nconn: {conn_ctx}")]
    WriteError {
        conn_ctx: ConnectionContext,
        source: std::io::Error,
    },

    #[error(
        "Audio DTS drifted away from video {shift_count} times; giving up\n\n\
             conn: {conn_ctx}"
    )]
    AudioDriftExceeded {
        conn_ctx: ConnectionContext,
        shift_count: u32,
    },

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("Timeout")]
    Timeout,
}
