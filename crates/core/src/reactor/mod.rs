//! The single-threaded event loop that drives every socket.
//!
//! A [`Reactor`] owns a tokio current-thread runtime and a [`LocalSet`]. Socket
//! handles spawn their I/O as local tasks, so handler callbacks always run on
//! the thread that called [`Reactor::run`] and never from inside the call that
//! started an operation.
//!
//! # Liveness
//!
//! `run` returns once nothing keeps the loop alive. A handle counts while it is
//! *active* (listening, reading, connecting, or with a write or shutdown in
//! flight) and *referenced* (see `ref_handle`/`unref_handle` on the handle
//! types). A closing handle counts until its close callback has fired, whatever
//! its ref state. Tasks started through [`ReactorHandle::spawn`] never count.
//!
//! # Failure
//!
//! A callback returning `Err` is fatal: dispatch stops, `run` returns the error,
//! and the reactor refuses to run again.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};

use tokio::runtime::{EnterGuard, Handle, Runtime};
use tokio::sync::Notify;
use tokio::task::{JoinHandle, LocalSet};
use tracing::{debug, error};

use crate::protocol::TransportError;

pub struct Reactor {
    // dropped before the runtime so task teardown still sees its driver
    local: Rc<LocalSet>,
    runtime: Runtime,
    shared: Rc<LoopShared>,
}

impl Reactor {
    pub fn new() -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(TransportError::init)?;

        let local = Rc::new(LocalSet::new());
        let shared = Rc::new(LoopShared {
            local: Rc::downgrade(&local),
            runtime: runtime.handle().clone(),
            alive: Cell::new(0),
            wake: Notify::new(),
            fatal: RefCell::new(None),
            terminated: Cell::new(false),
        });

        Ok(Self { local, runtime, shared })
    }

    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle { shared: Rc::clone(&self.shared) }
    }

    /// Drives the loop until no referenced active handle and no closing handle is left.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Callback`] or [`TransportError::Reentrant`] when a
    ///   callback failed during this run
    /// - [`TransportError::Terminated`] when an earlier run already failed
    pub fn run(&self) -> Result<(), TransportError> {
        if let Some(e) = self.shared.take_fatal() {
            return Err(e);
        }
        if self.shared.terminated.get() {
            return Err(TransportError::Terminated);
        }

        let shared = Rc::clone(&self.shared);
        debug!(alive = shared.alive.get(), "reactor run");
        let result = self.local.block_on(&self.runtime, async move {
            loop {
                if let Some(e) = shared.take_fatal() {
                    return Err(e);
                }
                if shared.alive.get() == 0 {
                    return Ok(());
                }
                shared.wake.notified().await;
            }
        });
        debug!(ok = result.is_ok(), "reactor stopped");
        result
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.get()
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor").field("shared", &self.shared).finish()
    }
}

/// A cloneable reference to a [`Reactor`], used to create sockets on it and to
/// spawn caller tasks such as timeouts.
#[derive(Clone, Debug)]
pub struct ReactorHandle {
    pub(crate) shared: Rc<LoopShared>,
}

impl ReactorHandle {
    /// Spawns a local task onto the reactor. The task does not keep `run` from
    /// returning; it resumes on the next `run` if it is still pending.
    pub fn spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>, TransportError>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.shared.spawn_local(future)
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.get()
    }
}

pub(crate) struct LoopShared {
    local: Weak<LocalSet>,
    runtime: Handle,
    /// Number of handles currently keeping the loop alive
    alive: Cell<usize>,
    wake: Notify,
    fatal: RefCell<Option<TransportError>>,
    terminated: Cell<bool>,
}

impl LoopShared {
    pub(crate) fn spawn_local<F>(&self, future: F) -> Result<JoinHandle<F::Output>, TransportError>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let local = self.local.upgrade().ok_or(TransportError::Terminated)?;
        Ok(local.spawn_local(future))
    }

    /// Enters the runtime context, which tokio needs to register new sockets.
    pub(crate) fn enter(&self) -> EnterGuard<'_> {
        self.runtime.enter()
    }

    #[inline]
    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.get()
    }

    /// Records a fatal callback failure and stops dispatch. The first failure wins.
    pub(crate) fn fail(&self, e: TransportError) {
        error!(cause = %e, "callback failed, terminating reactor");
        let mut fatal = self.fatal.borrow_mut();
        if fatal.is_none() && !self.terminated.get() {
            *fatal = Some(e);
        }
        self.terminated.set(true);
        self.wake.notify_one();
    }

    fn take_fatal(&self) -> Option<TransportError> {
        self.fatal.borrow_mut().take()
    }

    fn retain(&self) {
        self.alive.set(self.alive.get() + 1);
    }

    fn release(&self) {
        let alive = self.alive.get().saturating_sub(1);
        self.alive.set(alive);
        if alive == 0 {
            self.wake.notify_one();
        }
    }
}

impl fmt::Debug for LoopShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopShared")
            .field("alive", &self.alive.get())
            .field("terminated", &self.terminated.get())
            .finish()
    }
}

/// Ref and active-operation bookkeeping of one socket handle.
#[derive(Debug)]
pub(crate) struct HandleCore {
    shared: Rc<LoopShared>,
    referenced: Cell<bool>,
    active: Cell<usize>,
    /// Whether this handle is currently counted in `LoopShared::alive`
    counted: Cell<bool>,
}

impl HandleCore {
    pub(crate) fn new(reactor: &ReactorHandle) -> Rc<Self> {
        Rc::new(Self {
            shared: Rc::clone(&reactor.shared),
            referenced: Cell::new(true),
            active: Cell::new(0),
            counted: Cell::new(false),
        })
    }

    #[inline]
    pub(crate) fn shared(&self) -> &Rc<LoopShared> {
        &self.shared
    }

    pub(crate) fn set_referenced(&self, referenced: bool) {
        self.referenced.set(referenced);
        self.sync();
    }

    pub(crate) fn is_referenced(&self) -> bool {
        self.referenced.get()
    }

    #[cfg(test)]
    fn is_active(&self) -> bool {
        self.active.get() > 0
    }

    /// Marks one operation as in flight until the returned guard is dropped.
    pub(crate) fn activate(self: &Rc<Self>) -> ActiveGuard {
        self.active.set(self.active.get() + 1);
        self.sync();
        ActiveGuard { core: Rc::clone(self) }
    }

    fn sync(&self) {
        let wanted = self.referenced.get() && self.active.get() > 0;
        if wanted == self.counted.get() {
            return;
        }

        self.counted.set(wanted);
        if wanted {
            self.shared.retain();
        } else {
            self.shared.release();
        }
    }
}

#[derive(Debug)]
pub(crate) struct ActiveGuard {
    core: Rc<HandleCore>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.core.active.set(self.core.active.get().saturating_sub(1));
        self.core.sync();
    }
}

/// Keeps the loop alive while a handle is closing, regardless of its ref state.
#[derive(Debug)]
pub(crate) struct LoopHold {
    shared: Rc<LoopShared>,
}

impl LoopHold {
    pub(crate) fn new(shared: &Rc<LoopShared>) -> Self {
        shared.retain();
        Self { shared: Rc::clone(shared) }
    }
}

impl Drop for LoopHold {
    fn drop(&mut self) {
        self.shared.release();
    }
}
