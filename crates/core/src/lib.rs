//! A callback-driven HTTP/1.1 request head parser and TCP transport.
//!
//! This crate is the core an HTTP server is layered on. It does two things:
//!
//! - [`codec::RequestParser`] turns a byte stream, delivered in arbitrary
//!   chunks, into request-line, header and message-complete events without
//!   copying tokens that lie inside one chunk.
//! - [`connection::Connection`] and [`connection::Listener`] expose
//!   non-blocking IPv4 TCP sockets whose completions are delivered to handler
//!   callbacks on a single-threaded [`reactor::Reactor`].
//!
//! Routing, bodies, responses and TLS are left to the layers above.
//!
//! # Example
//!
//! ```no_run
//! use bytes::{Bytes, BytesMut};
//! use micro_core::connection::{Connection, Listener};
//! use micro_core::handler::{ConnectionHandler, ListenerHandler};
//! use micro_core::protocol::CallbackResult;
//! use micro_core::reactor::{Reactor, ReactorHandle};
//! use std::io;
//!
//! struct Echo;
//!
//! impl ConnectionHandler for Echo {
//!     fn on_connect(&mut self, conn: &Connection, status: io::Result<()>) -> CallbackResult {
//!         match status {
//!             Ok(()) => conn.read_start(BytesMut::with_capacity(4096))?,
//!             Err(_) => conn.close()?,
//!         }
//!         Ok(())
//!     }
//!
//!     fn on_read(&mut self, conn: &Connection, buf: BytesMut, nread: io::Result<usize>) -> CallbackResult<BytesMut> {
//!         match nread {
//!             Ok(n) if n > 0 => {
//!                 conn.write(Bytes::copy_from_slice(&buf[..n]))?;
//!                 Ok(buf)
//!             }
//!             _ => {
//!                 conn.close()?;
//!                 Ok(BytesMut::new())
//!             }
//!         }
//!     }
//! }
//!
//! struct Acceptor(ReactorHandle);
//!
//! impl ListenerHandler for Acceptor {
//!     fn on_connection(&mut self, _listener: &Listener) -> CallbackResult<Connection> {
//!         Ok(Connection::new(&self.0, Echo)?)
//!     }
//! }
//!
//! let reactor = Reactor::new().unwrap();
//! let listener = Listener::new(&reactor.handle(), Acceptor(reactor.handle()), true).unwrap();
//! listener.listen("127.0.0.1", 8080, 511).unwrap();
//! reactor.run().unwrap();
//! ```
//!
//! # Architecture
//!
//! - [`codec`]: the incremental request head parser
//! - [`connection`]: TCP connections, listeners and write requests
//! - [`reactor`]: the event loop and its liveness rules
//! - [`handler`]: callback traits and closure adapters
//! - [`protocol`]: token views, socket names and errors
//! - [`config`]: serde-backed configuration
//!
//! # Callback failures
//!
//! Every callback returns a [`protocol::CallbackResult`]. An `Err` is fatal:
//! parser failures abort the current `execute` call, socket callback failures
//! stop the reactor and come out of [`reactor::Reactor::run`].

pub mod codec;
pub mod config;
pub mod connection;
pub mod handler;
pub mod protocol;
pub mod reactor;

mod utils;
pub(crate) use utils::ensure;
