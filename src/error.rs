//! Typed error taxonomy shared across the codec, session, and state layers.

use thiserror::Error;

/// A single wire frame was malformed: bad checkbit, a body shorter than its
/// declared length, or a msgpack payload that failed to decode.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid checkbit: tp={tp:#04x} checkbit={checkbit:#04x}")]
    BadCheckbit { tp: u8, checkbit: u8 },
    #[error("msgpack encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("msgpack decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Errors surfaced by a single `request()` call on the session layer.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("request timed out")]
    Timeout,
    #[error("peer returned an error: {0}")]
    PeerError(String),
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("connection closed before a response arrived")]
    ConnectionClosed,
}

/// Crate-wide error type for everything above the wire/session layers.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("capacity exceeded: {0}")]
    Capacity(String),
}
