//! Borrowed views over the tokens of a request head.
//!
//! The views returned to [`ParserHandler`](crate::handler::ParserHandler) callbacks
//! point either into the caller's input chunk or into the parser's spill buffer,
//! so they only live for the duration of the callback. Copy out (or convert with
//! the `to_*` helpers) anything that must outlive it.

use http::{HeaderName, HeaderValue, Method, Uri, Version};

use crate::protocol::ParseError;

/// The request line `METHOD SP PATH SP HTTP/<major>.<minor>`.
///
/// Version components are the raw bytes seen on the wire, e.g. `b'1'`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLine<'a> {
    method: &'a [u8],
    path: &'a [u8],
    version_major: u8,
    version_minor: u8,
}

impl<'a> RequestLine<'a> {
    pub fn new(method: &'a [u8], path: &'a [u8], version_major: u8, version_minor: u8) -> Self {
        Self { method, path, version_major, version_minor }
    }

    #[inline]
    pub fn method(&self) -> &'a [u8] {
        self.method
    }

    #[inline]
    pub fn path(&self) -> &'a [u8] {
        self.path
    }

    #[inline]
    pub fn version_major(&self) -> u8 {
        self.version_major
    }

    #[inline]
    pub fn version_minor(&self) -> u8 {
        self.version_minor
    }

    /// Converts the method token into an [`http::Method`].
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Malformed`] if the token is not a valid method.
    pub fn to_method(&self) -> Result<Method, ParseError> {
        Method::from_bytes(self.method).map_err(ParseError::malformed)
    }

    /// Converts the path token into an [`http::Uri`].
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Malformed`] if the token is not a valid request target.
    pub fn to_uri(&self) -> Result<Uri, ParseError> {
        Uri::try_from(self.path).map_err(ParseError::malformed)
    }

    /// Maps the captured version digits onto an [`http::Version`], if they name one.
    pub fn to_version(&self) -> Option<Version> {
        match (self.version_major, self.version_minor) {
            (b'0', b'9') => Some(Version::HTTP_09),
            (b'1', b'0') => Some(Version::HTTP_10),
            (b'1', b'1') => Some(Version::HTTP_11),
            (b'2', b'0') => Some(Version::HTTP_2),
            (b'3', b'0') => Some(Version::HTTP_3),
            _ => None,
        }
    }
}

/// One `KEY: VALUE` header line, without the line terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderField<'a> {
    name: &'a [u8],
    value: &'a [u8],
}

impl<'a> HeaderField<'a> {
    pub fn new(name: &'a [u8], value: &'a [u8]) -> Self {
        Self { name, value }
    }

    #[inline]
    pub fn name(&self) -> &'a [u8] {
        self.name
    }

    #[inline]
    pub fn value(&self) -> &'a [u8] {
        self.value
    }

    /// Copies the field into an owned `http` header pair.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Malformed`] if the name or value contains bytes
    /// that are not allowed in a header.
    pub fn to_header_pair(&self) -> Result<(HeaderName, HeaderValue), ParseError> {
        let name = HeaderName::from_bytes(self.name).map_err(ParseError::malformed)?;
        let value = HeaderValue::from_bytes(self.value).map_err(ParseError::malformed)?;
        Ok((name, value))
    }
}
