mod common;

use std::cell::{Cell, RefCell};
use std::io;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use common::{Collect, Received, init_tracing, listen_once};
use micro_core::connection::{ConnState, Connection, ListenState, Listener, WriteRequest};
use micro_core::handler::{ConnectionHandler, ListenerHandler};
use micro_core::protocol::{AddressFamily, CallbackResult, SocketName, TransportError};
use micro_core::reactor::{Reactor, ReactorHandle};
use tokio::time::sleep;

type Names = Rc<RefCell<Option<(SocketName, SocketName)>>>;

struct RecordNames {
    names: Names,
}

impl ConnectionHandler for RecordNames {
    fn on_connect(&mut self, conn: &Connection, status: io::Result<()>) -> CallbackResult {
        status?;
        conn.set_no_delay(true)?;
        conn.set_keep_alive(true, 30)?;
        *self.names.borrow_mut() = Some((conn.socket_name()?, conn.peer_name()?));
        conn.close()?;
        Ok(())
    }
}

#[test]
fn socket_and_peer_names_mirror_each_other() {
    init_tracing();
    let reactor = Reactor::new().unwrap();
    let handle = reactor.handle();
    let server_names = Names::default();
    let client_names = Names::default();

    let (_listener, port) = listen_once(&handle, {
        let handle = handle.clone();
        let names = Rc::clone(&server_names);
        move |_listener: &Listener| Ok(Connection::new(&handle, RecordNames { names: Rc::clone(&names) })?)
    })
    .unwrap();

    let client = Connection::new(&handle, RecordNames { names: Rc::clone(&client_names) }).unwrap();
    client.set_no_delay(true).unwrap();
    client.set_keep_alive(true, 10).unwrap();
    client.connect("127.0.0.1", port).unwrap();
    reactor.run().unwrap();

    let (server_local, server_peer) = server_names.borrow().unwrap();
    let (client_local, client_peer) = client_names.borrow().unwrap();

    assert_eq!(client_peer, server_local);
    assert_eq!(server_peer, client_local);
    assert_eq!(server_local.port, port);
    assert_eq!(server_local.address, Ipv4Addr::LOCALHOST);
    assert_eq!(client_local.family, AddressFamily::Ipv4);
    assert_eq!(client.state(), ConnState::Closed);
}

struct Sender {
    send: Option<Box<dyn FnOnce(&Connection) -> Result<(), TransportError>>>,
}

impl ConnectionHandler for Sender {
    fn on_connect(&mut self, conn: &Connection, status: io::Result<()>) -> CallbackResult {
        status?;
        if let Some(send) = self.send.take() {
            send(conn)?;
        }
        conn.shutdown()?;
        Ok(())
    }

    fn on_finish(&mut self, conn: &Connection, status: io::Result<()>) -> CallbackResult {
        status?;
        conn.close()?;
        Ok(())
    }
}

fn deliver<F>(send: F) -> Vec<u8>
where
    F: FnOnce(&Connection) -> Result<(), TransportError> + 'static,
{
    let reactor = Reactor::new().unwrap();
    let handle = reactor.handle();
    let received = Received::default();

    let (_listener, port) = listen_once(&handle, {
        let handle = handle.clone();
        let received = received.clone();
        move |_listener: &Listener| Ok(Connection::new(&handle, Collect::new(&received))?)
    })
    .unwrap();

    let client = Connection::new(&handle, Sender { send: Some(Box::new(send)) }).unwrap();
    client.connect("127.0.0.1", port).unwrap();
    reactor.run().unwrap();

    assert_eq!(received.closed.get(), 1);
    received.data.take()
}

#[test]
fn two_buffer_and_vectored_writes_deliver_same_bytes() {
    init_tracing();
    let head = Bytes::from_static(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n");
    let body = Bytes::from_static(b"hello");

    let two = deliver({
        let (head, body) = (head.clone(), body.clone());
        move |conn| conn.write_two(head, body)
    });
    let vectored = deliver({
        let (head, body) = (head.clone(), body.clone());
        move |conn| conn.writev(vec![head, Bytes::new(), body])
    });

    assert_eq!(two, vectored);
    assert_eq!(two, [head.as_ref(), body.as_ref()].concat());
}

#[test]
fn large_vectored_write_arrives_in_order() {
    init_tracing();
    let bufs: Vec<Bytes> = (0..4u8).map(|i| Bytes::from(vec![b'a' + i; 256 * 1024])).collect();
    let expected: Vec<u8> = bufs.iter().flat_map(|buf| buf.iter().copied()).collect();

    let data = deliver({
        let bufs = bufs.clone();
        move |conn| {
            conn.write_request(WriteRequest::vectored(bufs))?;
            conn.write(Bytes::from_static(b"tail"))
        }
    });

    assert_eq!(data.len(), expected.len() + 4);
    assert_eq!(&data[..expected.len()], &expected[..]);
    assert_eq!(&data[expected.len()..], b"tail");
}

/// Stops reading after the first read and re-arms from a timer.
struct PausingReader {
    received: Received,
    reactor: ReactorHandle,
    /// Reads seen and read state when the timer fired
    paused: Rc<Cell<Option<(usize, bool)>>>,
}

impl ConnectionHandler for PausingReader {
    fn on_connect(&mut self, conn: &Connection, status: io::Result<()>) -> CallbackResult {
        status?;
        conn.read_start(BytesMut::with_capacity(64))?;
        Ok(())
    }

    fn on_read(&mut self, conn: &Connection, buf: BytesMut, nread: io::Result<usize>) -> CallbackResult<BytesMut> {
        let n = match nread {
            Ok(n) if n > 0 => n,
            _ => {
                conn.close()?;
                return Ok(BytesMut::new());
            }
        };

        self.received.data.borrow_mut().extend_from_slice(&buf[..n]);
        self.received.reads.set(self.received.reads.get() + 1);
        if self.received.reads.get() > 1 {
            return Ok(buf);
        }

        let conn = conn.clone();
        let reads = Rc::clone(&self.received.reads);
        let paused = Rc::clone(&self.paused);
        self.reactor.spawn(async move {
            sleep(Duration::from_millis(150)).await;
            paused.set(Some((reads.get(), conn.is_reading())));
            conn.read_start(BytesMut::with_capacity(64)).unwrap();
        })?;

        // back-pressure: no more reads until re-armed
        Ok(BytesMut::new())
    }
}

/// Writes "first", then "second" a little later, then half-closes and reads until end of stream.
struct SlowWriter {
    reactor: ReactorHandle,
}

impl ConnectionHandler for SlowWriter {
    fn on_connect(&mut self, conn: &Connection, status: io::Result<()>) -> CallbackResult {
        status?;
        conn.write(Bytes::from_static(b"first"))?;
        conn.read_start(BytesMut::with_capacity(64))?;
        Ok(())
    }

    fn on_write(&mut self, conn: &Connection, req: WriteRequest, status: io::Result<()>) -> CallbackResult {
        status?;
        if req.bufs()[0].as_ref() == b"first" {
            let conn = conn.clone();
            self.reactor.spawn(async move {
                sleep(Duration::from_millis(30)).await;
                conn.write(Bytes::from_static(b"second")).unwrap();
                conn.shutdown().unwrap();
            })?;
        }
        Ok(())
    }

    fn on_read(&mut self, conn: &Connection, buf: BytesMut, nread: io::Result<usize>) -> CallbackResult<BytesMut> {
        match nread {
            Ok(n) if n > 0 => Ok(buf),
            _ => {
                conn.close()?;
                Ok(BytesMut::new())
            }
        }
    }
}

#[test]
fn empty_read_buffer_pauses_reading() {
    init_tracing();
    let reactor = Reactor::new().unwrap();
    let handle = reactor.handle();
    let received = Received::default();
    let paused = Rc::new(Cell::new(None));

    let (_listener, port) = listen_once(&handle, {
        let handle = handle.clone();
        let received = received.clone();
        let paused = Rc::clone(&paused);
        move |_listener: &Listener| {
            let reader = PausingReader { received: received.clone(), reactor: handle.clone(), paused: Rc::clone(&paused) };
            Ok(Connection::new(&handle, reader)?)
        }
    })
    .unwrap();

    let client = Connection::new(&handle, SlowWriter { reactor: handle.clone() }).unwrap();
    client.connect("127.0.0.1", port).unwrap();
    reactor.run().unwrap();

    // "second" was sent while paused, yet no read was delivered until the re-arm
    assert_eq!(paused.get(), Some((1, false)));
    assert_eq!(received.data.take(), b"firstsecond");
    assert_eq!(client.state(), ConnState::Closed);
}

type Events = Rc<RefCell<Vec<String>>>;

struct CloseWhileWriting {
    events: Events,
}

impl ConnectionHandler for CloseWhileWriting {
    fn on_connect(&mut self, conn: &Connection, status: io::Result<()>) -> CallbackResult {
        status?;
        for _ in 0..3 {
            conn.write(Bytes::from(vec![b'x'; 64 * 1024]))?;
        }
        conn.shutdown()?;
        conn.close()?;
        conn.close()?;

        let after = match conn.write(Bytes::from_static(b"late")) {
            Err(TransportError::Closed) => "closed",
            _ => "unexpected",
        };
        self.events.borrow_mut().push(format!("write after close: {after}"));
        Ok(())
    }

    fn on_write(&mut self, _conn: &Connection, _req: WriteRequest, status: io::Result<()>) -> CallbackResult {
        self.events.borrow_mut().push(format!("write: {:?}", status.err().map(|e| e.kind())));
        Ok(())
    }

    fn on_finish(&mut self, _conn: &Connection, status: io::Result<()>) -> CallbackResult {
        self.events.borrow_mut().push(format!("finish: {:?}", status.err().map(|e| e.kind())));
        Ok(())
    }

    fn on_close(&mut self, _conn: &Connection) -> CallbackResult {
        self.events.borrow_mut().push("close".to_string());
        Ok(())
    }
}

#[test]
fn close_aborts_pending_operations_and_fires_once() {
    init_tracing();
    let reactor = Reactor::new().unwrap();
    let handle = reactor.handle();
    let received = Received::default();
    let events = Events::default();

    let (_listener, port) = listen_once(&handle, {
        let handle = handle.clone();
        let received = received.clone();
        move |_listener: &Listener| Ok(Connection::new(&handle, Collect::new(&received))?)
    })
    .unwrap();

    let client = Connection::new(&handle, CloseWhileWriting { events: Rc::clone(&events) }).unwrap();
    client.connect("127.0.0.1", port).unwrap();
    reactor.run().unwrap();

    let aborted = format!("{:?}", Some(io::ErrorKind::ConnectionAborted));
    assert_eq!(
        *events.borrow(),
        vec![
            "write after close: closed".to_string(),
            format!("write: {aborted}"),
            format!("write: {aborted}"),
            format!("write: {aborted}"),
            format!("finish: {aborted}"),
            "close".to_string(),
        ]
    );
    assert_eq!(received.closed.get(), 1);
}

struct RecordStatus {
    status: Rc<RefCell<Option<io::ErrorKind>>>,
    fail: bool,
}

impl ConnectionHandler for RecordStatus {
    fn on_connect(&mut self, conn: &Connection, status: io::Result<()>) -> CallbackResult {
        if self.fail {
            return Err("connect handler failed".into());
        }
        *self.status.borrow_mut() = status.err().map(|e| e.kind());
        conn.close()?;
        Ok(())
    }
}

fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[test]
fn refused_connect_is_reported_to_on_connect() {
    init_tracing();
    let reactor = Reactor::new().unwrap();
    let status = Rc::new(RefCell::new(None));

    let client = Connection::new(&reactor.handle(), RecordStatus { status: Rc::clone(&status), fail: false }).unwrap();
    client.connect("127.0.0.1", unused_port()).unwrap();
    reactor.run().unwrap();

    assert_eq!(*status.borrow(), Some(io::ErrorKind::ConnectionRefused));
    assert_eq!(client.state(), ConnState::Closed);
}

#[test]
fn callback_failure_terminates_reactor() {
    init_tracing();
    let reactor = Reactor::new().unwrap();
    let status = Rc::new(RefCell::new(None));

    let client = Connection::new(&reactor.handle(), RecordStatus { status: Rc::clone(&status), fail: true }).unwrap();
    client.connect("127.0.0.1", unused_port()).unwrap();

    let result = reactor.run();
    assert!(matches!(result, Err(TransportError::Callback { event: "connect", .. })), "{result:?}");
    assert!(matches!(reactor.run(), Err(TransportError::Terminated)));
    assert!(matches!(Connection::new(&reactor.handle(), Collect::new(&Received::default())), Err(TransportError::Terminated)));
}

/// Restarts reading before the first read arm ever ran, then collects.
struct RestartReading {
    inner: Collect,
}

impl ConnectionHandler for RestartReading {
    fn on_connect(&mut self, conn: &Connection, status: io::Result<()>) -> CallbackResult {
        status?;
        conn.read_start(BytesMut::with_capacity(64))?;
        conn.read_stop()?;
        conn.read_start(BytesMut::with_capacity(64))?;
        assert!(conn.is_reading());
        Ok(())
    }

    fn on_read(&mut self, conn: &Connection, buf: BytesMut, nread: io::Result<usize>) -> CallbackResult<BytesMut> {
        self.inner.on_read(conn, buf, nread)
    }

    fn on_close(&mut self, conn: &Connection) -> CallbackResult {
        self.inner.on_close(conn)
    }
}

#[test]
fn restart_in_same_turn_keeps_reading() {
    init_tracing();
    let reactor = Reactor::new().unwrap();
    let handle = reactor.handle();
    let received = Received::default();

    let (_listener, port) = listen_once(&handle, {
        let handle = handle.clone();
        let received = received.clone();
        move |_listener: &Listener| Ok(Connection::new(&handle, RestartReading { inner: Collect::new(&received) })?)
    })
    .unwrap();

    let send = |conn: &Connection| conn.write(Bytes::from_static(b"hello"));
    let client = Connection::new(&handle, Sender { send: Some(Box::new(send)) }).unwrap();
    client.connect("127.0.0.1", port).unwrap();
    reactor.run().unwrap();

    assert!(received.reads.get() >= 1);
    assert_eq!(received.data.take(), b"hello");
    assert_eq!(received.closed.get(), 1);
}

#[derive(Debug, Default)]
struct CountClose {
    closed: Rc<Cell<usize>>,
}

impl ListenerHandler for CountClose {
    fn on_connection(&mut self, _listener: &Listener) -> CallbackResult<Connection> {
        Err("no connections expected".into())
    }

    fn on_close(&mut self, _listener: &Listener) -> CallbackResult {
        self.closed.set(self.closed.get() + 1);
        Ok(())
    }
}

#[test]
fn unreferenced_listener_does_not_keep_loop_alive() {
    init_tracing();
    let reactor = Reactor::new().unwrap();
    let closed = Rc::new(Cell::new(0));

    let listener = Listener::new(&reactor.handle(), CountClose { closed: Rc::clone(&closed) }, true).unwrap();
    listener.listen("127.0.0.1", 0, 8).unwrap();
    listener.unref_handle();
    assert!(!listener.has_ref());

    reactor.run().unwrap();
    assert_eq!(listener.state(), ListenState::Listening);

    listener.close().unwrap();
    listener.close().unwrap();
    reactor.run().unwrap();
    assert_eq!(listener.state(), ListenState::Closed);
    assert_eq!(closed.get(), 1);
}

#[test]
fn misuse_is_reported_synchronously() {
    init_tracing();
    let reactor = Reactor::new().unwrap();
    let handle = reactor.handle();
    let closed = Rc::new(Cell::new(0));

    let listener = Listener::new(&handle, CountClose { closed: Rc::clone(&closed) }, false).unwrap();
    assert!(matches!(listener.listen("not-an-ip", 0, 8), Err(TransportError::Address { .. })));
    assert!(matches!(listener.socket_name(), Err(TransportError::NotConnected)));
    listener.listen("127.0.0.1", 0, 8).unwrap();
    assert!(matches!(listener.listen("127.0.0.1", 0, 8), Err(TransportError::AlreadyListening)));
    let port = listener.socket_name().unwrap().port;

    let second = Listener::new(&handle, CountClose { closed: Rc::clone(&closed) }, false).unwrap();
    assert!(matches!(second.listen("127.0.0.1", port, 8), Err(TransportError::Bind { .. })));

    let conn = Connection::new(&handle, Collect::new(&Received::default())).unwrap();
    assert!(matches!(conn.write(Bytes::from_static(b"x")), Err(TransportError::NotConnected)));
    assert!(matches!(conn.read_start(BytesMut::with_capacity(8)), Err(TransportError::NotConnected)));
    assert!(matches!(conn.socket_name(), Err(TransportError::NotConnected)));
    assert!(matches!(conn.connect("localhost", port), Err(TransportError::Address { .. })));
    conn.connect("127.0.0.1", port).unwrap();
    assert!(matches!(conn.connect("127.0.0.1", port), Err(TransportError::Busy { op: "connect" })));

    conn.close().unwrap();
    listener.close().unwrap();
    second.close().unwrap();
    assert!(matches!(conn.connect("127.0.0.1", port), Err(TransportError::Closed)));

    reactor.run().unwrap();
    assert_eq!(closed.get(), 2);
    assert_eq!(conn.state(), ConnState::Closed);
}

#[cfg(unix)]
#[test]
fn reuse_port_lets_two_listeners_share_a_port() {
    init_tracing();
    let reactor = Reactor::new().unwrap();
    let handle = reactor.handle();
    let closed = Rc::new(Cell::new(0));

    let first = Listener::new(&handle, CountClose { closed: Rc::clone(&closed) }, true).unwrap();
    first.listen("127.0.0.1", 0, 8).unwrap();
    let port = first.socket_name().unwrap().port;

    let second = Listener::new(&handle, CountClose { closed: Rc::clone(&closed) }, true).unwrap();
    second.listen("127.0.0.1", port, 8).unwrap();
    assert_eq!(second.socket_name().unwrap().port, port);
    assert_eq!(second.state(), ListenState::Listening);

    first.close().unwrap();
    second.close().unwrap();
    reactor.run().unwrap();
    assert_eq!(closed.get(), 2);
}
