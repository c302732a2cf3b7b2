//! Protocol types shared by the parser and the transport.
//!
//! - [`RequestLine`] / [`HeaderField`]: borrowed token views handed to parser callbacks
//! - [`SocketName`] / [`AddressFamily`]: results of socket and peer name queries
//! - [`ParseError`] / [`TransportError`]: error taxonomy
//! - [`BoxError`] / [`CallbackResult`]: what application callbacks return

mod request_line;
pub use request_line::HeaderField;
pub use request_line::RequestLine;

mod address;
pub use address::AddressFamily;
pub use address::SocketName;
pub use address::resolve_ipv4;

mod error;
pub use error::BoxError;
pub use error::CallbackResult;
pub use error::ParseError;
pub use error::TransportError;
pub(crate) use error::aborted;
