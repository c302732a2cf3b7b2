use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::net::Shutdown;
use std::rc::Rc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::WriteRequest;
use crate::config::ConnectionConfig;
use crate::handler::ConnectionHandler;
use crate::protocol::{CallbackResult, SocketName, TransportError, aborted, resolve_ipv4};
use crate::reactor::{ActiveGuard, HandleCore, LoopHold, ReactorHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Initialized, not connected yet
    Idle,
    Connecting,
    Open,
    /// `close` was called, the close callback has not fired yet
    Closing,
    Closed,
}

enum WriteOp {
    Write(WriteRequest, ActiveGuard),
    Shutdown(ActiveGuard),
}

/// A TCP connection driven by a [`Reactor`](crate::reactor::Reactor).
///
/// A `Connection` is either connected out with [`connect`](Self::connect) or
/// handed to a [`Listener`](super::Listener) from
/// [`ListenerHandler::on_connection`](crate::handler::ListenerHandler::on_connection)
/// to receive an accepted peer. Every operation returns immediately; its
/// outcome is delivered later to the [`ConnectionHandler`].
///
/// Clones refer to the same connection. The handler is dropped right after
/// its `on_close`, so a handler may keep clones of its own connection.
#[derive(Clone)]
pub struct Connection {
    inner: Rc<ConnectionInner>,
}

struct ConnectionInner {
    core: Rc<HandleCore>,
    state: Cell<ConnState>,
    handler: RefCell<Option<Box<dyn ConnectionHandler>>>,
    stream: RefCell<Option<Rc<TcpStream>>>,
    writes: RefCell<Option<UnboundedSender<WriteOp>>>,
    /// Cancelled by `close`; every task of this connection watches it
    cancel: CancellationToken,
    /// Token of the current read arm, `None` while reads are stopped
    read_arm: RefCell<Option<CancellationToken>>,
    next_read: RefCell<Option<BytesMut>>,
    shutdown_pending: Cell<bool>,
    no_delay: Cell<Option<bool>>,
    keep_alive: Cell<Option<(bool, u32)>>,
    tasks: RefCell<Vec<JoinHandle<()>>>,
}

impl Connection {
    pub fn new<H>(reactor: &ReactorHandle, handler: H) -> Result<Self, TransportError>
    where
        H: ConnectionHandler + 'static,
    {
        if reactor.is_terminated() {
            return Err(TransportError::Terminated);
        }

        Ok(Self {
            inner: Rc::new(ConnectionInner {
                core: HandleCore::new(reactor),
                state: Cell::new(ConnState::Idle),
                handler: RefCell::new(Some(Box::new(handler))),
                stream: RefCell::new(None),
                writes: RefCell::new(None),
                cancel: CancellationToken::new(),
                read_arm: RefCell::new(None),
                next_read: RefCell::new(None),
                shutdown_pending: Cell::new(false),
                no_delay: Cell::new(None),
                keep_alive: Cell::new(None),
                tasks: RefCell::new(Vec::new()),
            }),
        })
    }

    /// Creates a connection with the socket options of `config` already requested.
    pub fn with_config<H>(reactor: &ReactorHandle, handler: H, config: &ConnectionConfig) -> Result<Self, TransportError>
    where
        H: ConnectionHandler + 'static,
    {
        let conn = Self::new(reactor, handler)?;
        conn.inner.no_delay.set(Some(config.no_delay()));
        if let Some(secs) = config.keep_alive_secs() {
            conn.inner.keep_alive.set(Some((true, secs)));
        }
        Ok(conn)
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        self.inner.state.get()
    }

    pub fn is_reading(&self) -> bool {
        self.inner.read_arm.borrow().is_some()
    }

    /// Returns true if both values refer to the same connection.
    pub fn ptr_eq(&self, other: &Connection) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Connects to `ip:port`. The outcome is reported to `on_connect`.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Address`] if `ip` is not a dotted-decimal IPv4 address
    /// - [`TransportError::Busy`] if a connect is already outstanding
    /// - [`TransportError::AlreadyConnected`] / [`TransportError::Closed`] depending on state
    pub fn connect(&self, ip: &str, port: u16) -> Result<(), TransportError> {
        match self.state() {
            ConnState::Idle => {}
            ConnState::Connecting => return Err(TransportError::busy("connect")),
            ConnState::Open => return Err(TransportError::AlreadyConnected),
            ConnState::Closing | ConnState::Closed => return Err(TransportError::Closed),
        }

        let addr = resolve_ipv4(ip, port)?;
        let guard = self.inner.core.activate();
        let conn = self.clone();
        let cancel = self.inner.cancel.clone();

        let task = self.inner.core.shared().spawn_local(async move {
            let result = select! {
                biased;
                _ = cancel.cancelled() => Err(aborted()),
                result = TcpStream::connect(addr) => result,
            };

            let status = match result {
                Ok(stream) => conn.attach(stream).map_err(io::Error::other),
                Err(e) => {
                    if conn.state() == ConnState::Connecting {
                        conn.inner.state.set(ConnState::Idle);
                    }
                    Err(e)
                }
            };

            debug!(%addr, ok = status.is_ok(), "connect finished");
            conn.dispatch("connect", |handler, conn| handler.on_connect(conn, status));
            drop(guard);
        })?;

        self.inner.state.set(ConnState::Connecting);
        self.track(task);
        Ok(())
    }

    /// Installs a stream accepted by a listener and reports it to `on_connect`.
    pub(crate) fn accept(&self, stream: TcpStream) {
        let status = self.attach(stream).map_err(io::Error::other);
        debug!(ok = status.is_ok(), "accept finished");
        self.dispatch("accept", |handler, conn| handler.on_connect(conn, status));
    }

    fn attach(&self, stream: TcpStream) -> Result<(), TransportError> {
        match self.state() {
            ConnState::Idle | ConnState::Connecting => {}
            ConnState::Open => return Err(TransportError::AlreadyConnected),
            ConnState::Closing | ConnState::Closed => return Err(TransportError::Closed),
        }

        if let Some(enable) = self.inner.no_delay.take() {
            stream.set_nodelay(enable)?;
        }
        if let Some((enable, delay_secs)) = self.inner.keep_alive.take() {
            apply_keep_alive(&stream, enable, delay_secs)?;
        }

        let stream = Rc::new(stream);
        let (tx, rx) = unbounded_channel();
        let task = self.inner.core.shared().spawn_local(write_loop(self.clone(), Rc::clone(&stream), rx))?;

        self.inner.stream.replace(Some(stream));
        self.inner.writes.replace(Some(tx));
        self.inner.state.set(ConnState::Open);
        self.track(task);
        Ok(())
    }

    /// Arms reading into `buf`.
    ///
    /// Each read clears the target buffer and fills its spare capacity, so the
    /// data of a read is `buf[..n]`. The buffer returned from `on_read` is the
    /// next target; a buffer without capacity stops reading. Calling this while
    /// reading replaces the next target.
    pub fn read_start(&self, buf: BytesMut) -> Result<(), TransportError> {
        let stream = self.stream()?;

        if buf.capacity() == 0 {
            return self.read_stop();
        }

        self.inner.next_read.replace(Some(buf));
        if self.is_reading() {
            return Ok(());
        }

        let arm = self.inner.cancel.child_token();
        let guard = self.inner.core.activate();
        let task = self.inner.core.shared().spawn_local(read_loop(self.clone(), stream, arm.clone(), guard))?;

        self.inner.read_arm.replace(Some(arm));
        self.track(task);
        Ok(())
    }

    /// Stops reading. No `on_read` fires until `read_start` is called again.
    pub fn read_stop(&self) -> Result<(), TransportError> {
        if let Some(arm) = self.inner.read_arm.take() {
            arm.cancel();
        }
        self.inner.next_read.take();
        Ok(())
    }

    pub fn write(&self, buf: Bytes) -> Result<(), TransportError> {
        self.write_request(WriteRequest::new(buf))
    }

    pub fn write_two(&self, first: Bytes, second: Bytes) -> Result<(), TransportError> {
        self.write_request(WriteRequest::two(first, second))
    }

    pub fn writev(&self, bufs: Vec<Bytes>) -> Result<(), TransportError> {
        self.write_request(WriteRequest::vectored(bufs))
    }

    /// Queues `req` behind earlier writes. `on_write` hands it back on completion.
    pub fn write_request(&self, req: WriteRequest) -> Result<(), TransportError> {
        let writes = self.writer()?;
        trace!(len = req.remaining(), "queue write");
        writes
            .send(WriteOp::Write(req, self.inner.core.activate()))
            .map_err(|_| TransportError::Closed)
    }

    /// Half-closes the write side once every earlier write has completed.
    /// The outcome is reported to `on_finish`.
    pub fn shutdown(&self) -> Result<(), TransportError> {
        let writes = self.writer()?;
        if self.inner.shutdown_pending.get() {
            return Err(TransportError::busy("shutdown"));
        }

        writes
            .send(WriteOp::Shutdown(self.inner.core.activate()))
            .map_err(|_| TransportError::Closed)?;
        self.inner.shutdown_pending.set(true);
        Ok(())
    }

    /// Closes the connection.
    ///
    /// Pending connect, write and shutdown operations complete with a
    /// `ConnectionAborted` status, then `on_close` fires exactly once. Closing
    /// a closing or closed connection does nothing.
    pub fn close(&self) -> Result<(), TransportError> {
        if matches!(self.state(), ConnState::Closing | ConnState::Closed) {
            debug!("close on a connection that is already closing");
            return Ok(());
        }

        let hold = LoopHold::new(self.inner.core.shared());
        self.inner.state.set(ConnState::Closing);
        self.inner.cancel.cancel();
        self.inner.read_arm.take();
        self.inner.next_read.take();
        self.inner.writes.take();
        let tasks = self.inner.tasks.take();

        let conn = self.clone();
        self.inner.core.shared().spawn_local(async move {
            for task in tasks {
                let _ = task.await;
            }

            conn.inner.stream.take();
            conn.inner.state.set(ConnState::Closed);
            debug!("connection closed");
            conn.dispatch("close", |handler, conn| handler.on_close(conn));

            if let Ok(mut handler) = conn.inner.handler.try_borrow_mut() {
                handler.take();
            }
            drop(hold);
        })?;
        Ok(())
    }

    /// Enables or disables TCP keep-alive with an initial probe delay in seconds.
    pub fn set_keep_alive(&self, enable: bool, delay_secs: u32) -> Result<(), TransportError> {
        self.ensure_not_closed()?;
        match self.inner.stream.borrow().as_deref() {
            Some(stream) => apply_keep_alive(stream, enable, delay_secs)?,
            None => self.inner.keep_alive.set(Some((enable, delay_secs))),
        }
        Ok(())
    }

    pub fn set_no_delay(&self, enable: bool) -> Result<(), TransportError> {
        self.ensure_not_closed()?;
        match self.inner.stream.borrow().as_deref() {
            Some(stream) => stream.set_nodelay(enable)?,
            None => self.inner.no_delay.set(Some(enable)),
        }
        Ok(())
    }

    /// Lets this connection keep the reactor alive while it has work in flight (the default).
    pub fn ref_handle(&self) {
        self.inner.core.set_referenced(true);
    }

    /// Stops this connection from keeping the reactor alive on its own.
    pub fn unref_handle(&self) {
        self.inner.core.set_referenced(false);
    }

    pub fn has_ref(&self) -> bool {
        self.inner.core.is_referenced()
    }

    pub fn socket_name(&self) -> Result<SocketName, TransportError> {
        SocketName::try_from(self.stream()?.local_addr()?)
    }

    pub fn peer_name(&self) -> Result<SocketName, TransportError> {
        SocketName::try_from(self.stream()?.peer_addr()?)
    }

    fn ensure_not_closed(&self) -> Result<(), TransportError> {
        match self.state() {
            ConnState::Closing | ConnState::Closed => Err(TransportError::Closed),
            _ => Ok(()),
        }
    }

    fn stream(&self) -> Result<Rc<TcpStream>, TransportError> {
        self.ensure_not_closed()?;
        self.inner.stream.borrow().clone().ok_or(TransportError::NotConnected)
    }

    fn writer(&self) -> Result<UnboundedSender<WriteOp>, TransportError> {
        self.ensure_not_closed()?;
        self.inner.writes.borrow().clone().ok_or(TransportError::NotConnected)
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.inner.tasks.borrow_mut();
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    fn finish_shutdown(&self, status: io::Result<()>, guard: ActiveGuard) {
        self.inner.shutdown_pending.set(false);
        debug!(ok = status.is_ok(), "shutdown finished");
        self.dispatch("shutdown", |handler, conn| handler.on_finish(conn, status));
        drop(guard);
    }

    /// Runs one handler callback. Returns `None` if the callback did not run or failed.
    fn dispatch<T, F>(&self, event: &'static str, f: F) -> Option<T>
    where
        F: FnOnce(&mut dyn ConnectionHandler, &Connection) -> CallbackResult<T>,
    {
        let shared = self.inner.core.shared();
        if shared.is_terminated() {
            return None;
        }

        let Ok(mut slot) = self.inner.handler.try_borrow_mut() else {
            shared.fail(TransportError::Reentrant { event });
            return None;
        };
        let handler = slot.as_mut()?;

        match f(&mut **handler, self) {
            Ok(value) => Some(value),
            Err(source) => {
                drop(slot);
                shared.fail(TransportError::callback(event, source));
                None
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("reading", &self.is_reading())
            .field("core", &self.inner.core)
            .finish()
    }
}

async fn read_loop(conn: Connection, stream: Rc<TcpStream>, arm: CancellationToken, guard: ActiveGuard) {
    loop {
        // a stopped arm must not consume a buffer meant for its successor
        if arm.is_cancelled() {
            return;
        }
        let Some(mut buf) = conn.inner.next_read.take() else {
            break;
        };
        buf.clear();

        let result = select! {
            biased;
            _ = arm.cancelled() => return,
            result = read_into(&stream, &mut buf) => result,
        };

        let finished = !matches!(result, Ok(n) if n > 0);
        trace!(?result, "read");
        let next = conn.dispatch("read", |handler, conn| handler.on_read(conn, buf, result));

        if arm.is_cancelled() {
            return;
        }
        match next {
            Some(next) if !finished && next.capacity() > 0 => {
                conn.inner.next_read.replace(Some(next));
            }
            Some(_) if !finished => {}
            _ => {
                conn.inner.next_read.take();
                break;
            }
        }
    }

    // reads ran out of buffers, hit end of stream or failed. An uncancelled
    // arm is still the current one, a replaced arm is always cancelled first.
    if !arm.is_cancelled() {
        conn.inner.read_arm.take();
    }
    drop(guard);
}

async fn read_into(stream: &TcpStream, buf: &mut BytesMut) -> io::Result<usize> {
    loop {
        stream.readable().await?;
        match stream.try_read_buf(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

async fn write_loop(conn: Connection, stream: Rc<TcpStream>, mut rx: UnboundedReceiver<WriteOp>) {
    let cancel = conn.inner.cancel.clone();

    loop {
        let op = select! {
            biased;
            _ = cancel.cancelled() => break,
            op = rx.recv() => match op {
                Some(op) => op,
                None => break,
            },
        };

        match op {
            WriteOp::Write(mut req, guard) => {
                let status = select! {
                    biased;
                    _ = cancel.cancelled() => Err(aborted()),
                    status = write_all(&stream, &mut req) => status,
                };
                trace!(ok = status.is_ok(), "write finished");
                conn.dispatch("write", |handler, conn| handler.on_write(conn, req, status));
                drop(guard);
            }
            WriteOp::Shutdown(guard) => {
                let status = if cancel.is_cancelled() { Err(aborted()) } else { SockRef::from(&*stream).shutdown(Shutdown::Write) };
                conn.finish_shutdown(status, guard);
            }
        }
    }

    rx.close();
    while let Ok(op) = rx.try_recv() {
        match op {
            WriteOp::Write(req, guard) => {
                conn.dispatch("write", |handler, conn| handler.on_write(conn, req, Err(aborted())));
                drop(guard);
            }
            WriteOp::Shutdown(guard) => conn.finish_shutdown(Err(aborted()), guard),
        }
    }
}

async fn write_all(stream: &TcpStream, req: &mut WriteRequest) -> io::Result<()> {
    while req.has_remaining() {
        stream.writable().await?;
        let written = stream.try_write_vectored(&req.io_slices());
        match written {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => req.advance(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn apply_keep_alive(stream: &TcpStream, enable: bool, delay_secs: u32) -> io::Result<()> {
    let socket = SockRef::from(stream);
    if enable {
        socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(Duration::from_secs(u64::from(delay_secs))))
    } else {
        socket.set_keepalive(false)
    }
}
