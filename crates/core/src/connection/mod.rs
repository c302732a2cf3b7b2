//! TCP transport: connections, listeners and write requests.
//!
//! # Components
//!
//! - [`Connection`]: a connected stream socket. Reads are armed with a caller
//!   buffer and re-armed with whatever buffer `on_read` returns; writes are
//!   performed in submission order; `shutdown` waits for earlier writes.
//! - [`Listener`]: an IPv4 listening socket that accepts each peer into an
//!   application-supplied `Connection`.
//! - [`WriteRequest`]: one, two or N buffers written as a unit and handed back
//!   on completion.
//!
//! Every operation returns immediately. Results arrive through the
//! [`handler`](crate::handler) traits while [`Reactor::run`](crate::reactor::Reactor::run)
//! is driving the loop.

mod tcp_connection;
mod tcp_listener;
mod write_request;

pub use tcp_connection::ConnState;
pub use tcp_connection::Connection;
pub use tcp_listener::ListenState;
pub use tcp_listener::Listener;
pub use write_request::WriteRequest;
