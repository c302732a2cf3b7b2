use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::select;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::config::{AcceptErrorPolicy, ListenConfig};
use crate::handler::ListenerHandler;
use crate::protocol::{CallbackResult, SocketName, TransportError, resolve_ipv4};
use crate::reactor::{ActiveGuard, HandleCore, LoopHold, ReactorHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenState {
    Idle,
    Listening,
    Closing,
    Closed,
}

/// A listening IPv4 TCP socket.
///
/// Every incoming peer is accepted into a fresh [`Connection`](super::Connection)
/// supplied by [`ListenerHandler::on_connection`]. The connection's own
/// `on_connect` then reports whether the accept succeeded.
#[derive(Clone)]
pub struct Listener {
    inner: Rc<ListenerInner>,
}

struct ListenerInner {
    core: Rc<HandleCore>,
    state: Cell<ListenState>,
    handler: RefCell<Option<Box<dyn ListenerHandler>>>,
    /// The socket until `listen` turns it into a listener
    socket: RefCell<Option<TcpSocket>>,
    local_addr: Cell<Option<SocketAddr>>,
    accept_errors: Cell<AcceptErrorPolicy>,
    cancel: CancellationToken,
    task: RefCell<Option<JoinHandle<()>>>,
}

impl Listener {
    /// Creates an IPv4 listening socket. `reuse_port` requests `SO_REUSEPORT`
    /// where the platform has it and is ignored elsewhere.
    pub fn new<H>(reactor: &ReactorHandle, handler: H, reuse_port: bool) -> Result<Self, TransportError>
    where
        H: ListenerHandler + 'static,
    {
        if reactor.is_terminated() {
            return Err(TransportError::Terminated);
        }

        let socket = TcpSocket::new_v4().map_err(TransportError::init)?;
        #[cfg(unix)]
        socket.set_reuseaddr(true).map_err(TransportError::init)?;
        request_reuse_port(&socket, reuse_port);

        Ok(Self {
            inner: Rc::new(ListenerInner {
                core: HandleCore::new(reactor),
                state: Cell::new(ListenState::Idle),
                handler: RefCell::new(Some(Box::new(handler))),
                socket: RefCell::new(Some(socket)),
                local_addr: Cell::new(None),
                accept_errors: Cell::new(AcceptErrorPolicy::default()),
                cancel: CancellationToken::new(),
                task: RefCell::new(None),
            }),
        })
    }

    /// Creates a listener from `config` and starts listening on its address.
    pub fn from_config<H>(reactor: &ReactorHandle, handler: H, config: &ListenConfig) -> Result<Self, TransportError>
    where
        H: ListenerHandler + 'static,
    {
        let listener = Self::new(reactor, handler, config.reuse_port())?;
        listener.set_accept_error_policy(config.accept_errors());
        listener.listen(config.address(), config.port(), config.backlog())?;
        Ok(listener)
    }

    #[inline]
    pub fn state(&self) -> ListenState {
        self.inner.state.get()
    }

    pub fn accept_error_policy(&self) -> AcceptErrorPolicy {
        self.inner.accept_errors.get()
    }

    pub fn set_accept_error_policy(&self, policy: AcceptErrorPolicy) {
        self.inner.accept_errors.set(policy);
    }

    /// Binds to `ip:port` and starts accepting with the given backlog.
    ///
    /// # Errors
    ///
    /// Resolution, bind and listen failures are reported as the distinct
    /// [`TransportError::Address`], [`TransportError::Bind`] and
    /// [`TransportError::Listen`] variants.
    pub fn listen(&self, ip: &str, port: u16, backlog: u32) -> Result<(), TransportError> {
        match self.state() {
            ListenState::Idle => {}
            ListenState::Listening => return Err(TransportError::AlreadyListening),
            ListenState::Closing | ListenState::Closed => return Err(TransportError::Closed),
        }

        let addr = resolve_ipv4(ip, port)?;
        let socket = self
            .inner
            .socket
            .take()
            .ok_or_else(|| TransportError::listen(io::Error::from(io::ErrorKind::InvalidInput)))?;

        if let Err(e) = socket.bind(addr) {
            self.inner.socket.replace(Some(socket));
            return Err(TransportError::bind(addr, e));
        }

        let shared = self.inner.core.shared();
        let listener = {
            let _enter = shared.enter();
            socket.listen(backlog).map_err(TransportError::listen)?
        };
        let local_addr = listener.local_addr()?;

        let guard = self.inner.core.activate();
        let task = shared.spawn_local(accept_loop(self.clone(), listener, guard))?;

        info!(%local_addr, backlog, "listening");
        self.inner.local_addr.set(Some(local_addr));
        self.inner.task.replace(Some(task));
        self.inner.state.set(ListenState::Listening);
        Ok(())
    }

    /// Stops accepting and closes the socket. `on_close` fires exactly once.
    pub fn close(&self) -> Result<(), TransportError> {
        if matches!(self.state(), ListenState::Closing | ListenState::Closed) {
            debug!("close on a listener that is already closing");
            return Ok(());
        }

        let hold = LoopHold::new(self.inner.core.shared());
        self.inner.state.set(ListenState::Closing);
        self.inner.cancel.cancel();
        self.inner.socket.take();
        let task = self.inner.task.take();

        let listener = self.clone();
        self.inner.core.shared().spawn_local(async move {
            if let Some(task) = task {
                let _ = task.await;
            }

            listener.inner.state.set(ListenState::Closed);
            debug!("listener closed");
            listener.dispatch("close", |handler, listener| handler.on_close(listener));

            if let Ok(mut handler) = listener.inner.handler.try_borrow_mut() {
                handler.take();
            }
            drop(hold);
        })?;
        Ok(())
    }

    pub fn ref_handle(&self) {
        self.inner.core.set_referenced(true);
    }

    pub fn unref_handle(&self) {
        self.inner.core.set_referenced(false);
    }

    pub fn has_ref(&self) -> bool {
        self.inner.core.is_referenced()
    }

    /// The bound address, available once listening.
    pub fn socket_name(&self) -> Result<SocketName, TransportError> {
        if matches!(self.state(), ListenState::Closing | ListenState::Closed) {
            return Err(TransportError::Closed);
        }
        let addr = self.inner.local_addr.get().ok_or(TransportError::NotConnected)?;
        SocketName::try_from(addr)
    }

    fn on_accepted(&self, stream: TcpStream, peer: SocketAddr) {
        trace!(%peer, "accepted");
        // without a target connection the stream is dropped, which closes it
        if let Some(conn) = self.dispatch("connection", |handler, listener| handler.on_connection(listener)) {
            conn.accept(stream);
        }
    }

    fn on_accept_failed(&self, e: io::Error) {
        match self.accept_error_policy() {
            AcceptErrorPolicy::Drop => debug!(cause = %e, "dropping failed accept"),
            AcceptErrorPolicy::Report => {
                self.dispatch("accept error", |handler, listener| handler.on_accept_error(listener, e));
            }
        }
    }

    fn dispatch<T, F>(&self, event: &'static str, f: F) -> Option<T>
    where
        F: FnOnce(&mut dyn ListenerHandler, &Listener) -> CallbackResult<T>,
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

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("state", &self.state())
            .field("local_addr", &self.inner.local_addr.get())
            .field("core", &self.inner.core)
            .finish()
    }
}

async fn accept_loop(listener: Listener, tcp: TcpListener, guard: ActiveGuard) {
    let cancel = listener.inner.cancel.clone();
    loop {
        let accepted = select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = tcp.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => listener.on_accepted(stream, peer),
            Err(e) => listener.on_accept_failed(e),
        }
    }
    drop(guard);
}

#[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos", target_os = "cygwin"))))]
fn request_reuse_port(socket: &TcpSocket, reuse_port: bool) {
    if reuse_port && let Err(e) = socket.set_reuseport(true) {
        debug!(cause = %e, "SO_REUSEPORT not available, ignoring");
    }
}

#[cfg(not(all(unix, not(any(target_os = "solaris", target_os = "illumos", target_os = "cygwin")))))]
fn request_reuse_port(_socket: &TcpSocket, reuse_port: bool) {
    if reuse_port {
        debug!("SO_REUSEPORT not supported on this platform, ignoring");
    }
}
