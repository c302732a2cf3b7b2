//! Request head parsing.
//!
//! [`RequestParser`] is a push parser: the caller owns the buffers and feeds
//! them in as they arrive, and the parser reports the request line, each header
//! and the end of the head through a [`ParserHandler`](crate::handler::ParserHandler).
//!
//! ```
//! use micro_core::codec::{MalformedPolicy, ParserState, RequestParser};
//! use micro_core::handler::make_parser_handler;
//!
//! let mut headers = 0;
//! let mut handler = make_parser_handler(
//!     |_line: &micro_core::protocol::RequestLine<'_>| Ok(()),
//!     |_field: &micro_core::protocol::HeaderField<'_>| {
//!         headers += 1;
//!         Ok(())
//!     },
//!     || Ok(()),
//! );
//!
//! let mut parser = RequestParser::with_policy(MalformedPolicy::Strict);
//! parser.execute(b"GET / HTTP/1.1\r\nHost: a\r\nAccept: */*\r\n\r\n", &mut handler).unwrap();
//! assert_eq!(parser.state(), ParserState::Method);
//! drop(handler);
//! assert_eq!(headers, 2);
//! ```

mod request_parser;

pub use request_parser::DEFAULT_MAX_HEAD_BYTES;
pub use request_parser::MalformedPolicy;
pub use request_parser::ParserState;
pub use request_parser::RequestParser;
