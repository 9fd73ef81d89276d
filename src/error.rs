//! Error types for embermq.

use std::io;

use thiserror::Error;

/// Main error type for embermq.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// MQTT protocol and codec errors.
///
/// These are fatal for the current packet. The connection driver logs the
/// error and closes the connection, since framing cannot be recovered
/// mid-stream.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid command nibble: {0:#x}")]
    InvalidCommand(u8),

    #[error("Invalid remaining length encoding")]
    InvalidRemainingLength,

    #[error("Buffer too small: need {needed} bytes, have {have}")]
    BufferTooSmall { needed: usize, have: usize },

    #[error("Packet length {len} exceeds buffer capacity {capacity}")]
    AllocatedBufferTooSmall { len: usize, capacity: usize },

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("No packet started")]
    NoPacketStarted,

    #[error("Invalid UTF-8 string")]
    InvalidUtf8,

    #[error("First packet must be CONNECT")]
    FirstPacketNotConnect,
}

pub type Result<T> = std::result::Result<T, Error>;
