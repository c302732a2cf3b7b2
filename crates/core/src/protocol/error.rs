use std::error::Error;
use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Error type returned by application callbacks.
///
/// A callback returning `Err` is treated as unrecoverable: the event that
/// triggered it is abandoned and the failure is propagated to the caller of
/// [`RequestParser::execute`](crate::codec::RequestParser::execute) or
/// [`Reactor::run`](crate::reactor::Reactor::run).
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Result returned by every callback slot.
pub type CallbackResult<T = ()> = Result<T, BoxError>;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("{event} callback failed: {source}")]
    Callback { event: &'static str, source: BoxError },

    #[error("malformed request: {reason}")]
    Malformed { reason: String },

    #[error("request head of {current_size} bytes exceeds the limit of {max_size}")]
    TooLarge { current_size: usize, max_size: usize },

    #[error("range {start}+{len} is out of bounds for a buffer of {buf_len} bytes")]
    OutOfBounds { start: usize, len: usize, buf_len: usize },
}

impl ParseError {
    pub fn callback(event: &'static str, source: BoxError) -> Self {
        Self::Callback { event, source }
    }

    pub fn malformed<S: ToString>(str: S) -> Self {
        Self::Malformed { reason: str.to_string() }
    }

    pub fn too_large(current_size: usize, max_size: usize) -> Self {
        Self::TooLarge { current_size, max_size }
    }

    pub fn out_of_bounds(start: usize, len: usize, buf_len: usize) -> Self {
        Self::OutOfBounds { start, len, buf_len }
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport initialization failed: {source}")]
    Init {
        #[source]
        source: io::Error,
    },

    #[error("invalid ipv4 address: {input}")]
    Address { input: String },

    #[error("bind {addr} failed: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("listen failed: {source}")]
    Listen {
        #[source]
        source: io::Error,
    },

    #[error("socket is not connected")]
    NotConnected,

    #[error("socket is already connected")]
    AlreadyConnected,

    #[error("socket is already listening")]
    AlreadyListening,

    #[error("a {op} request is already outstanding")]
    Busy { op: &'static str },

    #[error("socket is closing or closed")]
    Closed,

    #[error("only ipv4 addresses are supported, got {addr}")]
    UnsupportedFamily { addr: SocketAddr },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    #[error("{event} callback failed: {source}")]
    Callback { event: &'static str, source: BoxError },

    #[error("{event} callback re-entered its own handler")]
    Reentrant { event: &'static str },

    #[error("reactor was terminated by an earlier callback failure")]
    Terminated,
}

impl TransportError {
    pub fn init<E: Into<io::Error>>(e: E) -> Self {
        Self::Init { source: e.into() }
    }

    pub fn address<S: ToString>(input: S) -> Self {
        Self::Address { input: input.to_string() }
    }

    pub fn bind<E: Into<io::Error>>(addr: SocketAddr, e: E) -> Self {
        Self::Bind { addr, source: e.into() }
    }

    pub fn listen<E: Into<io::Error>>(e: E) -> Self {
        Self::Listen { source: e.into() }
    }

    pub fn busy(op: &'static str) -> Self {
        Self::Busy { op }
    }

    pub fn callback(event: &'static str, source: BoxError) -> Self {
        Self::Callback { event, source }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }

    /// Returns true if this error came out of an application callback.
    pub fn is_callback(&self) -> bool {
        matches!(self, Self::Callback { .. })
    }
}

/// The status reported to completion callbacks for operations cancelled by `close`.
pub(crate) fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "operation aborted by close")
}
