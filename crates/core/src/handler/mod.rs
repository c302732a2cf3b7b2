//! Callback slots through which parser and socket events reach application code.
//!
//! Each slot returns a [`CallbackResult`]. Returning `Err` is an unrecoverable
//! failure: the event in flight is abandoned and the error propagates out of
//! [`RequestParser::execute`](crate::codec::RequestParser::execute) or
//! [`Reactor::run`](crate::reactor::Reactor::run).
//!
//! Socket callbacks always run on the reactor thread, never from inside the call
//! that issued the operation, so a callback may freely start more I/O or close
//! the socket it was invoked for.

use std::io;

use bytes::BytesMut;

use crate::connection::{Connection, Listener, WriteRequest};
use crate::protocol::{CallbackResult, HeaderField, RequestLine};

/// Receives the events of [`RequestParser`](crate::codec::RequestParser).
pub trait ParserHandler {
    /// The request line is complete. Fires once per byte of minor version seen,
    /// which is exactly once for a well formed `HTTP/x.y` version.
    fn on_request_line(&mut self, line: &RequestLine<'_>) -> CallbackResult;

    /// One header line is complete.
    fn on_header(&mut self, field: &HeaderField<'_>) -> CallbackResult;

    /// The blank line ending the header block was seen. The parser is back in
    /// its initial state once this returns.
    fn on_message_complete(&mut self) -> CallbackResult;
}

impl<H: ParserHandler + ?Sized> ParserHandler for &mut H {
    fn on_request_line(&mut self, line: &RequestLine<'_>) -> CallbackResult {
        (**self).on_request_line(line)
    }

    fn on_header(&mut self, field: &HeaderField<'_>) -> CallbackResult {
        (**self).on_header(field)
    }

    fn on_message_complete(&mut self) -> CallbackResult {
        (**self).on_message_complete()
    }
}

/// A [`ParserHandler`] assembled from three closures.
#[derive(Debug)]
pub struct ParserHandlerFn<L, H, M> {
    on_request_line: L,
    on_header: H,
    on_message_complete: M,
}

impl<L, H, M> ParserHandler for ParserHandlerFn<L, H, M>
where
    L: FnMut(&RequestLine<'_>) -> CallbackResult,
    H: FnMut(&HeaderField<'_>) -> CallbackResult,
    M: FnMut() -> CallbackResult,
{
    fn on_request_line(&mut self, line: &RequestLine<'_>) -> CallbackResult {
        (self.on_request_line)(line)
    }

    fn on_header(&mut self, field: &HeaderField<'_>) -> CallbackResult {
        (self.on_header)(field)
    }

    fn on_message_complete(&mut self) -> CallbackResult {
        (self.on_message_complete)()
    }
}

pub fn make_parser_handler<L, H, M>(on_request_line: L, on_header: H, on_message_complete: M) -> ParserHandlerFn<L, H, M>
where
    L: FnMut(&RequestLine<'_>) -> CallbackResult,
    H: FnMut(&HeaderField<'_>) -> CallbackResult,
    M: FnMut() -> CallbackResult,
{
    ParserHandlerFn { on_request_line, on_header, on_message_complete }
}

/// Callback slots of a connected (or connecting) [`Connection`].
///
/// Every slot has a default so handlers only implement what they use. The
/// default `on_read` stops reading.
pub trait ConnectionHandler {
    /// Completion of `connect`, or of an accept that targeted this connection.
    fn on_connect(&mut self, _conn: &Connection, _status: io::Result<()>) -> CallbackResult {
        Ok(())
    }

    /// Completion of one write. The request, and the buffers it owns, are handed back.
    fn on_write(&mut self, _conn: &Connection, _req: WriteRequest, _status: io::Result<()>) -> CallbackResult {
        Ok(())
    }

    /// Data arrived in `buf[..n]`. `Ok(0)` means end of stream.
    ///
    /// The returned buffer is the target of the next read. Returning an empty
    /// buffer stops reading until [`Connection::read_start`] is called again.
    fn on_read(&mut self, _conn: &Connection, _buf: BytesMut, _nread: io::Result<usize>) -> CallbackResult<BytesMut> {
        Ok(BytesMut::new())
    }

    /// Completion of `shutdown`.
    fn on_finish(&mut self, _conn: &Connection, _status: io::Result<()>) -> CallbackResult {
        Ok(())
    }

    /// The handle is closed. Fires exactly once; the handler is dropped right after.
    fn on_close(&mut self, _conn: &Connection) -> CallbackResult {
        Ok(())
    }
}

/// Callback slots of a [`Listener`].
pub trait ListenerHandler {
    /// A peer is waiting. Return a freshly initialized, unconnected [`Connection`]
    /// to accept it into; its `on_connect` then reports the accept status.
    fn on_connection(&mut self, listener: &Listener) -> CallbackResult<Connection>;

    /// A failed accept, delivered only under
    /// [`AcceptErrorPolicy::Report`](crate::config::AcceptErrorPolicy::Report).
    fn on_accept_error(&mut self, _listener: &Listener, _error: io::Error) -> CallbackResult {
        Ok(())
    }

    /// The listener is closed. Fires exactly once.
    fn on_close(&mut self, _listener: &Listener) -> CallbackResult {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closure_handler_dispatches() {
        let mut lines = Vec::new();
        let mut headers = 0;
        let mut done = false;

        {
            let mut handler = make_parser_handler(
                |line: &RequestLine<'_>| {
                    lines.push(line.method().to_vec());
                    Ok(())
                },
                |_field: &HeaderField<'_>| {
                    headers += 1;
                    Ok(())
                },
                || {
                    done = true;
                    Ok(())
                },
            );

            handler.on_request_line(&RequestLine::new(b"GET", b"/", b'1', b'1')).unwrap();
            handler.on_header(&HeaderField::new(b"Host", b"x")).unwrap();
            handler.on_message_complete().unwrap();
        }

        assert_eq!(lines, vec![b"GET".to_vec()]);
        assert_eq!(headers, 1);
        assert!(done);
    }
}
