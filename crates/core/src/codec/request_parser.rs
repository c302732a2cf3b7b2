//! Incremental HTTP/1.1 request head parser.
//!
//! The parser walks its input one byte at a time through seven states:
//!
//! ```text
//! METHOD -> PATH -> VERSION_MAJOR -> VERSION_MINOR -> HEADER_KEY <-> HEADER_VALUE
//!    ^                                                   |
//!    +----------------------- BODY <---------------------+  (blank line)
//! ```
//!
//! State survives across [`RequestParser::execute`] calls, so a request head may
//! arrive in any number of chunks. Tokens that end inside the chunk being parsed
//! are handed to the [`ParserHandler`] as sub-slices of that chunk. A token still
//! open when a chunk ends is carried over in a small spill buffer, together with
//! any finished token of the same line it must be reported with. A head longer
//! than the parser's limit is rejected, which also bounds the spill buffer.
//!
//! Body bytes are never interpreted: after the blank line the parser is back in
//! `METHOD`, and the caller decides what the following bytes are.

use bytes::BytesMut;
use serde::Deserialize;
use tracing::trace;

use crate::ensure;
use crate::handler::ParserHandler;
use crate::protocol::{HeaderField, ParseError, RequestLine};

/// Default limit on the size of one request head, request line included.
pub const DEFAULT_MAX_HEAD_BYTES: usize = 8 * 1024;

/// The parser states, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    Method,
    Path,
    VersionMajor,
    VersionMinor,
    HeaderKey,
    HeaderValue,
    /// Entered on the blank line; left again before the next byte is looked at.
    Body,
}

impl ParserState {
    #[inline]
    fn collects_token(self) -> bool {
        matches!(self, ParserState::Method | ParserState::Path | ParserState::HeaderKey | ParserState::HeaderValue)
    }
}

/// What the parser does with input that does not look like a request head.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedPolicy {
    /// Keep consuming bytes in whatever state the parser is in. Pathological
    /// input may be misparsed but never raises an error.
    #[default]
    Permissive,
    /// Reject empty method or path tokens, non-digit version bytes and
    /// multi-digit minor versions with [`ParseError::Malformed`].
    Strict,
}

/// Location of a token: in the chunk being parsed, or in the spill buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Span {
    #[default]
    Empty,
    Input(usize, usize),
    Spill(usize, usize),
}

/// Start of the token currently being collected.
#[derive(Debug, Clone, Copy, Default)]
struct Mark {
    /// Offset in the current chunk
    start: usize,
    /// Offset in the spill buffer where earlier chunks' bytes of this token begin
    spilled: Option<usize>,
}

impl Mark {
    #[inline]
    fn at(start: usize) -> Self {
        Self { start, spilled: None }
    }
}

/// An incremental request head parser.
///
/// One parser serves one connection; it resets itself after every message.
///
/// ```
/// use micro_core::codec::RequestParser;
/// use micro_core::handler::make_parser_handler;
///
/// let mut paths = Vec::new();
/// let mut handler = make_parser_handler(
///     |line: &micro_core::protocol::RequestLine<'_>| {
///         paths.push(line.path().to_vec());
///         Ok(())
///     },
///     |_field: &micro_core::protocol::HeaderField<'_>| Ok(()),
///     || Ok(()),
/// );
///
/// let mut parser = RequestParser::new();
/// parser.execute(b"GET /a HT", &mut handler).unwrap();
/// parser.execute(b"TP/1.1\r\nHost: x\r\n\r\n", &mut handler).unwrap();
/// drop(handler);
///
/// assert_eq!(paths, vec![b"/a".to_vec()]);
/// ```
#[derive(Debug)]
pub struct RequestParser {
    state: ParserState,
    policy: MalformedPolicy,
    max_head_bytes: usize,
    /// Bytes of the current head seen in earlier chunks
    head_carried: usize,
    /// Offset in the current chunk where the current head starts
    head_start: usize,
    version_major: u8,
    version_minor: u8,
    method: Span,
    path: Span,
    header_key: Span,
    mark: Mark,
    /// A CR was seen and the byte after it decides what it meant
    pending_cr: bool,
    /// Nothing but a possible CR has been read on the current header line
    line_start: bool,
    /// The first byte of a header value may be an absorbed space
    skip_space: bool,
    /// The request line event already fired for the current line
    line_emitted: bool,
    spill: BytesMut,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::with_policy(MalformedPolicy::Permissive)
    }

    pub fn with_policy(policy: MalformedPolicy) -> Self {
        Self::with_limits(policy, DEFAULT_MAX_HEAD_BYTES)
    }

    /// Creates a parser rejecting request heads longer than `max_head_bytes`.
    pub fn with_limits(policy: MalformedPolicy, max_head_bytes: usize) -> Self {
        Self {
            state: ParserState::Method,
            policy,
            max_head_bytes,
            head_carried: 0,
            head_start: 0,
            version_major: 0,
            version_minor: 0,
            method: Span::Empty,
            path: Span::Empty,
            header_key: Span::Empty,
            mark: Mark::default(),
            pending_cr: false,
            line_start: false,
            skip_space: false,
            line_emitted: false,
            spill: BytesMut::new(),
        }
    }

    #[inline]
    pub fn state(&self) -> ParserState {
        self.state
    }

    #[inline]
    pub fn policy(&self) -> MalformedPolicy {
        self.policy
    }

    #[inline]
    pub fn max_head_bytes(&self) -> usize {
        self.max_head_bytes
    }

    /// Drops any partially parsed message and returns to [`ParserState::Method`].
    pub fn reset(&mut self) {
        self.start_message(0);
        self.version_major = 0;
        self.version_minor = 0;
    }

    /// Feeds one chunk of input, firing handler callbacks as events complete.
    ///
    /// Every byte of `input` is consumed. Slices handed to the handler are only
    /// valid for the duration of the callback.
    ///
    /// # Errors
    ///
    /// - [`ParseError::Callback`] if a callback fails; the remaining input is not parsed
    /// - [`ParseError::Malformed`] under [`MalformedPolicy::Strict`]
    /// - [`ParseError::TooLarge`] once the current head outgrows the limit, in
    ///   either policy; the partial message is dropped as by [`reset`](Self::reset)
    pub fn execute<H>(&mut self, input: &[u8], handler: &mut H) -> Result<(), ParseError>
    where
        H: ParserHandler + ?Sized,
    {
        self.mark.start = 0;
        self.head_start = 0;
        let result = self.scan(input, handler).and_then(|()| self.check_head_len(input.len()));
        if let Err(ParseError::TooLarge { .. }) = result {
            self.reset();
            return result;
        }

        self.head_carried = self.head_len(input.len());
        self.spill_chunk(input);
        result
    }

    /// Same as [`execute`](Self::execute) over `buf[start..start + len]`.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::OutOfBounds`] if the range does not fit in `buf`,
    /// otherwise whatever `execute` returns.
    pub fn execute_at<H>(&mut self, buf: &[u8], start: usize, len: usize, handler: &mut H) -> Result<(), ParseError>
    where
        H: ParserHandler + ?Sized,
    {
        let end = start
            .checked_add(len)
            .filter(|end| *end <= buf.len())
            .ok_or_else(|| ParseError::out_of_bounds(start, len, buf.len()))?;
        self.execute(&buf[start..end], handler)
    }

    fn scan<H>(&mut self, input: &[u8], handler: &mut H) -> Result<(), ParseError>
    where
        H: ParserHandler + ?Sized,
    {
        let mut i = 0;
        while i < input.len() {
            let byte = input[i];
            match self.state {
                ParserState::Method => {
                    if byte == b' ' {
                        self.method = self.finish_token(input, i);
                        self.enter(ParserState::Path, i + 1);
                    }
                }

                ParserState::Path => {
                    if byte == b' ' {
                        self.path = self.finish_token(input, i);
                        self.enter(ParserState::VersionMajor, i + 1);
                    }
                }

                ParserState::VersionMajor => match byte {
                    b'.' => self.state = ParserState::VersionMinor,
                    b'H' | b'T' | b'P' | b'/' => {}
                    _ => {
                        self.check_digit(byte, "major version")?;
                        self.version_major = byte;
                    }
                },

                ParserState::VersionMinor => {
                    if self.pending_cr {
                        self.pending_cr = false;
                        if byte == b'\n' {
                            self.check_head_len(i + 1)?;
                            self.finish_request_line(i + 1)?;
                            i += 1;
                            continue;
                        }
                        // a CR without LF counts as a version byte, then this byte is looked at again
                        self.minor_version(b'\r', input, handler)?;
                        continue;
                    }
                    if byte == b'\r' {
                        self.pending_cr = true;
                    } else {
                        self.minor_version(byte, input, handler)?;
                    }
                }

                ParserState::HeaderKey => {
                    if self.pending_cr {
                        self.pending_cr = false;
                        if byte == b'\n' {
                            self.check_head_len(i + 1)?;
                            self.complete_message(i + 1, handler)?;
                            i += 1;
                            continue;
                        }
                        // the CR belongs to the key
                        self.line_start = false;
                        continue;
                    }
                    if byte == b'\r' && self.line_start {
                        self.pending_cr = true;
                    } else if byte == b':' {
                        self.header_key = self.finish_token(input, i);
                        self.enter(ParserState::HeaderValue, i + 1);
                        self.skip_space = true;
                    } else {
                        self.line_start = false;
                    }
                }

                ParserState::HeaderValue => {
                    if self.skip_space {
                        self.skip_space = false;
                        if byte == b' ' {
                            self.mark = Mark::at(i + 1);
                            i += 1;
                            continue;
                        }
                    }
                    if self.pending_cr {
                        self.pending_cr = false;
                        if byte == b'\n' {
                            self.check_head_len(i + 1)?;
                            let value = self.finish_before_cr(input, i);
                            self.emit_header(value, input, handler)?;
                            self.header_key = Span::Empty;
                            self.spill.clear();
                            self.enter_header_line(i + 1);
                            i += 1;
                            continue;
                        }
                        // the CR belongs to the value
                        continue;
                    }
                    if byte == b'\r' {
                        self.pending_cr = true;
                    }
                }

                ParserState::Body => {
                    self.start_message(i);
                    continue;
                }
            }
            i += 1;
        }

        Ok(())
    }

    #[inline]
    fn enter(&mut self, state: ParserState, at: usize) {
        self.state = state;
        self.mark = Mark::at(at);
    }

    fn enter_header_line(&mut self, at: usize) {
        self.enter(ParserState::HeaderKey, at);
        self.line_start = true;
    }

    fn start_message(&mut self, at: usize) {
        self.enter(ParserState::Method, at);
        self.head_carried = 0;
        self.head_start = at;
        self.method = Span::Empty;
        self.path = Span::Empty;
        self.header_key = Span::Empty;
        self.pending_cr = false;
        self.line_start = false;
        self.skip_space = false;
        self.line_emitted = false;
        self.spill.clear();
    }

    /// Length of the current head up to offset `end` of the current chunk.
    #[inline]
    fn head_len(&self, end: usize) -> usize {
        self.head_carried + end.saturating_sub(self.head_start)
    }

    fn check_head_len(&self, end: usize) -> Result<(), ParseError> {
        let len = self.head_len(end);
        ensure!(len <= self.max_head_bytes, ParseError::too_large(len, self.max_head_bytes));
        Ok(())
    }

    /// Closes the token being collected at `end` (exclusive).
    fn finish_token(&mut self, input: &[u8], end: usize) -> Span {
        let mark = std::mem::take(&mut self.mark);
        match mark.spilled {
            None => Span::Input(mark.start, end),
            Some(from) => {
                self.spill.extend_from_slice(&input[mark.start..end]);
                Span::Spill(from, self.spill.len())
            }
        }
    }

    /// Closes the token being collected just before the CR preceding the LF at `lf`.
    fn finish_before_cr(&mut self, input: &[u8], lf: usize) -> Span {
        if lf > 0 {
            return self.finish_token(input, lf - 1);
        }

        // the CR ended the previous chunk, so it is the last spilled byte
        match self.finish_token(input, 0) {
            Span::Spill(from, to) if to > from => Span::Spill(from, to - 1),
            span => span,
        }
    }

    /// Moves everything that must outlive `input` into the spill buffer.
    fn spill_chunk(&mut self, input: &[u8]) {
        for span in [&mut self.method, &mut self.path, &mut self.header_key] {
            if let Span::Input(start, end) = *span {
                let from = self.spill.len();
                self.spill.extend_from_slice(&input[start..end]);
                *span = Span::Spill(from, self.spill.len());
            }
        }

        if self.state.collects_token() {
            let from = self.mark.spilled.unwrap_or(self.spill.len());
            self.spill.extend_from_slice(&input[self.mark.start..]);
            self.mark.spilled = Some(from);
        }
    }

    fn resolve<'a>(&'a self, span: Span, input: &'a [u8]) -> &'a [u8] {
        match span {
            Span::Empty => &[],
            Span::Input(start, end) => &input[start..end],
            Span::Spill(start, end) => &self.spill[start..end],
        }
    }

    fn check_digit(&self, byte: u8, what: &str) -> Result<(), ParseError> {
        if self.policy == MalformedPolicy::Strict {
            ensure!(byte.is_ascii_digit(), ParseError::malformed(format!("{what} byte 0x{byte:02x} is not a digit")));
        }
        Ok(())
    }

    fn minor_version<H>(&mut self, byte: u8, input: &[u8], handler: &mut H) -> Result<(), ParseError>
    where
        H: ParserHandler + ?Sized,
    {
        if self.policy == MalformedPolicy::Strict {
            ensure!(!self.line_emitted, ParseError::malformed("minor version has more than one digit"));
            self.check_digit(byte, "minor version")?;
            ensure!(!self.resolve(self.method, input).is_empty(), ParseError::malformed("empty method"));
            ensure!(!self.resolve(self.path, input).is_empty(), ParseError::malformed("empty path"));
        }

        self.version_minor = byte;
        self.line_emitted = true;

        let line = RequestLine::new(
            self.resolve(self.method, input),
            self.resolve(self.path, input),
            self.version_major,
            self.version_minor,
        );
        trace!(method = ?line.method(), path = ?line.path(), "parsed request line");
        handler.on_request_line(&line).map_err(|source| ParseError::callback("request line", source))
    }

    fn finish_request_line(&mut self, next: usize) -> Result<(), ParseError> {
        if self.policy == MalformedPolicy::Strict {
            ensure!(self.line_emitted, ParseError::malformed("missing minor version"));
        }

        self.method = Span::Empty;
        self.path = Span::Empty;
        self.spill.clear();
        self.enter_header_line(next);
        Ok(())
    }

    fn emit_header<H>(&self, value: Span, input: &[u8], handler: &mut H) -> Result<(), ParseError>
    where
        H: ParserHandler + ?Sized,
    {
        let field = HeaderField::new(self.resolve(self.header_key, input), self.resolve(value, input));
        trace!(name = ?field.name(), "parsed header");
        handler.on_header(&field).map_err(|source| ParseError::callback("header", source))
    }

    fn complete_message<H>(&mut self, next: usize, handler: &mut H) -> Result<(), ParseError>
    where
        H: ParserHandler + ?Sized,
    {
        self.state = ParserState::Body;
        trace!("parsed message head");
        handler.on_message_complete().map_err(|source| ParseError::callback("message complete", source))?;
        self.start_message(next);
        Ok(())
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}
