#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;

use bytes::BytesMut;
use micro_core::connection::{Connection, Listener};
use micro_core::handler::{ConnectionHandler, ListenerHandler};
use micro_core::protocol::{CallbackResult, TransportError};
use micro_core::reactor::ReactorHandle;
use tracing::Level;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().with_max_level(Level::DEBUG).try_init();
}

/// Accepts a single peer into the connection built by `make`, then closes the listener.
pub struct AcceptOnce<F> {
    make: F,
}

impl<F> ListenerHandler for AcceptOnce<F>
where
    F: FnMut(&Listener) -> CallbackResult<Connection>,
{
    fn on_connection(&mut self, listener: &Listener) -> CallbackResult<Connection> {
        let conn = (self.make)(listener)?;
        listener.close()?;
        Ok(conn)
    }
}

/// Listens on an ephemeral loopback port and returns it.
pub fn listen_once<F>(reactor: &ReactorHandle, make: F) -> Result<(Listener, u16), TransportError>
where
    F: FnMut(&Listener) -> CallbackResult<Connection> + 'static,
{
    let listener = Listener::new(reactor, AcceptOnce { make }, false)?;
    listener.listen("127.0.0.1", 0, 16)?;
    let port = listener.socket_name()?.port;
    Ok((listener, port))
}

#[derive(Debug, Clone, Default)]
pub struct Received {
    pub data: Rc<RefCell<Vec<u8>>>,
    pub reads: Rc<Cell<usize>>,
    pub closed: Rc<Cell<usize>>,
}

/// Reads everything the peer sends and closes on end of stream.
#[derive(Debug)]
pub struct Collect {
    received: Received,
}

impl Collect {
    pub fn new(received: &Received) -> Self {
        Self { received: received.clone() }
    }
}

impl ConnectionHandler for Collect {
    fn on_connect(&mut self, conn: &Connection, status: io::Result<()>) -> CallbackResult {
        match status {
            Ok(()) => conn.read_start(BytesMut::with_capacity(1024))?,
            Err(_) => conn.close()?,
        }
        Ok(())
    }

    fn on_read(&mut self, conn: &Connection, buf: BytesMut, nread: io::Result<usize>) -> CallbackResult<BytesMut> {
        match nread {
            Ok(n) if n > 0 => {
                self.received.data.borrow_mut().extend_from_slice(&buf[..n]);
                self.received.reads.set(self.received.reads.get() + 1);
                Ok(buf)
            }
            _ => {
                conn.close()?;
                Ok(BytesMut::new())
            }
        }
    }

    fn on_close(&mut self, _conn: &Connection) -> CallbackResult {
        self.received.closed.set(self.received.closed.get() + 1);
        Ok(())
    }
}
