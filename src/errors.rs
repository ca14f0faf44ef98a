use std::sync::Arc;

use rmp::{
    decode::{MarkerReadError, NumValueReadError, ValueReadError},
    encode::{RmpWriteErr, ValueWriteError},
};

/// Internal error kinds reported through the `on_error` callback.
///
/// These mirror the connection lifecycle rather than the wire protocol:
/// a single kind may be produced by several different syscalls or decode
/// stages.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed connection string or other caller-supplied garbage.
    InvalidParameter,
    /// API misuse (e.g. `open()` on a connection that is not disconnected).
    BadCallSequence,
    /// Address resolving is still in progress.
    GetaddrInProgress,
    /// Address resolving failed.
    Getaddr,
    /// An errno-returning syscall failed, or the response callback failed.
    System,
    /// Connect or transmit-acknowledgement deadline expired.
    Timeout,
    /// Authentication rejected; the db code carries the server-side error.
    Auth,
    /// `recv` returned 0.
    ClosedByPeer,
    /// Framing or MsgPack decode failure on input.
    UnexpectedData,
    /// A lifecycle callback (`on_opened`/`on_closed`) failed.
    External,
    /// Flushed data has been stuck in the output buffer for too long.
    UncorkedDataJam,
}

/// Error produced while composing MsgPack or iproto data.
#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    #[error("MessagePack encoding error: {0}")]
    MessagePack(#[source] anyhow::Error),
    /// `finalize()` saw more items than the reserved container header can
    /// describe.
    #[error("{0} header size exceeded")]
    HeaderSizeExceeded(&'static str),
    #[error("no container to finalize")]
    NoOpenContainer,
    #[error("request size exceeded")]
    RequestSizeExceeded,
    #[error("too long string")]
    TooLongString,
}

impl<E> From<ValueWriteError<E>> for EncodingError
where
    E: RmpWriteErr + Send + Sync,
{
    fn from(v: ValueWriteError<E>) -> Self {
        Self::MessagePack(v.into())
    }
}

impl From<std::io::Error> for EncodingError {
    fn from(v: std::io::Error) -> Self {
        Self::MessagePack(v.into())
    }
}

/// Error produced while decoding MsgPack or iproto data.
///
/// May carry a hex dump of the failed region with the error position
/// marked; the dump is appended to the display output.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{rendered}")]
pub struct DecodingError {
    message: Arc<str>,
    /// Message plus the optional hex dump, as displayed.
    rendered: Arc<str>,
}

impl DecodingError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        let message: Arc<str> = message.into().into();
        Self {
            rendered: Arc::clone(&message),
            message,
        }
    }

    pub(crate) fn with_dump(message: impl Into<String>, dump: String) -> Self {
        let message = message.into();
        let rendered = format!("{message}\n{dump}").into();
        Self {
            message: message.into(),
            rendered,
        }
    }

    /// The failure description without the hex-dump context.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<ValueReadError> for DecodingError {
    fn from(v: ValueReadError) -> Self {
        Self::new(format!("MessagePack decoding error: {v}"))
    }
}

impl From<NumValueReadError> for DecodingError {
    fn from(v: NumValueReadError) -> Self {
        Self::new(format!("MessagePack decoding error: {v}"))
    }
}

impl From<MarkerReadError> for DecodingError {
    fn from(v: MarkerReadError) -> Self {
        Self::new(format!("MessagePack decoding error: {}", v.0))
    }
}
