//! Incremental HTTP/1.1 request-header parser.
//!
//! The server reads from the socket in arbitrarily sized chunks, so this is a
//! push parser: [`HttpHeaderParser::feed`] consumes whatever bytes have
//! arrived and reports whether the header block is complete. Chunk boundaries
//! carry no meaning: a request line split across five reads parses exactly
//! like the same bytes fed at once.
//!
//! Output follows the CGI convention: the request line populates
//! `REQUEST_METHOD`, `SERVER_PROTOCOL`, `REQUEST_URI`, `PATH_INFO`,
//! `SCRIPT_NAME`, and `QUERY_STRING`; each `Name: Value` header becomes
//! `HTTP_<NAME>` with dashes replaced by underscores, except `Content-Length`
//! and `Content-Type`, which map to `CONTENT_LENGTH` and `CONTENT_TYPE`
//! without the prefix.
//!
//! The parser counts every header byte it consumes, across all chunks; the
//! cumulative count exceeding the configured ceiling fails the parse before
//! anything is buffered unboundedly.

use thiserror::Error;

use crate::headers::{self, HeaderMap};

/// Errors produced while parsing an HTTP request header block.
#[derive(Debug, Error)]
pub enum HttpParseError {
    /// The cumulative header byte count exceeded the configured ceiling
    /// before the terminating blank line was seen.
    #[error("request header block exceeds the {max} byte limit")]
    HeaderTooLarge { max: usize },

    /// The request line did not have the `METHOD SP target SP version` shape.
    #[error("malformed request line: {0:?}")]
    MalformedRequestLine(String),

    /// A header line had no colon separator.
    #[error("malformed header line: {0:?}")]
    MalformedHeaderLine(String),

    /// `feed` was called again after a previous call failed.
    #[error("parser already failed; connection must be dropped")]
    Poisoned,
}

/// Result of one [`HttpHeaderParser::feed`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// The header block is not complete yet; feed more bytes.
    NeedMore,
    /// The blank line was seen; headers are ready and any further bytes are
    /// body leftover.
    Done,
}

#[derive(Debug, PartialEq, Eq)]
enum State {
    RequestLine,
    Headers,
    Done,
    Failed,
}

/// Incremental parser over one request's header block.
#[derive(Debug)]
pub struct HttpHeaderParser {
    state: State,
    line: Vec<u8>,
    headers: HeaderMap,
    consumed: usize,
    max_header_size: usize,
    leftover: Vec<u8>,
}

impl HttpHeaderParser {
    pub fn new(max_header_size: usize) -> Self {
        Self {
            state: State::RequestLine,
            line: Vec::new(),
            headers: HeaderMap::new(),
            consumed: 0,
            max_header_size,
            leftover: Vec::new(),
        }
    }

    /// Consumes one chunk of bytes from the connection.
    ///
    /// Bytes arriving after the terminating blank line (within this chunk or
    /// later ones) accumulate as body leftover and are not counted against
    /// the header ceiling.
    ///
    /// # Errors
    ///
    /// - [`HttpParseError::HeaderTooLarge`] once the cumulative header bytes
    ///   exceed the ceiling.
    /// - [`HttpParseError::MalformedRequestLine`] /
    ///   [`HttpParseError::MalformedHeaderLine`] on syntax errors.
    /// - [`HttpParseError::Poisoned`] if a previous call already failed.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<ParseStatus, HttpParseError> {
        if self.state == State::Failed {
            return Err(HttpParseError::Poisoned);
        }

        for &byte in chunk {
            if self.state == State::Done {
                self.leftover.push(byte);
                continue;
            }

            self.consumed += 1;
            if self.consumed > self.max_header_size {
                self.state = State::Failed;
                return Err(HttpParseError::HeaderTooLarge {
                    max: self.max_header_size,
                });
            }

            if byte == b'\n' {
                if let Err(e) = self.finish_line() {
                    self.state = State::Failed;
                    return Err(e);
                }
            } else {
                self.line.push(byte);
            }
        }

        Ok(if self.state == State::Done {
            ParseStatus::Done
        } else {
            ParseStatus::NeedMore
        })
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// The headers parsed so far. Complete once [`Self::is_done`] is true.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Consumes the parser, yielding the header map and any body bytes that
    /// followed the blank line.
    pub fn into_parts(self) -> (HeaderMap, Vec<u8>) {
        (self.headers, self.leftover)
    }

    fn finish_line(&mut self) -> Result<(), HttpParseError> {
        // Tolerate both CRLF and bare LF line endings.
        if self.line.last() == Some(&b'\r') {
            self.line.pop();
        }
        let line = std::mem::take(&mut self.line);
        let line = String::from_utf8_lossy(&line).into_owned();

        match self.state {
            State::RequestLine => self.parse_request_line(&line),
            State::Headers => {
                if line.is_empty() {
                    self.state = State::Done;
                    Ok(())
                } else {
                    self.parse_header_line(&line)
                }
            }
            State::Done | State::Failed => unreachable!("lines are not parsed in terminal states"),
        }
    }

    fn parse_request_line(&mut self, line: &str) -> Result<(), HttpParseError> {
        let mut tokens = line.split_whitespace();
        let (method, target, protocol) = match (tokens.next(), tokens.next(), tokens.next()) {
            (Some(m), Some(t), Some(p)) if tokens.next().is_none() => (m, t, p),
            _ => return Err(HttpParseError::MalformedRequestLine(line.to_string())),
        };

        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, query),
            None => (target, ""),
        };

        self.headers.insert(headers::REQUEST_METHOD, method);
        self.headers.insert(headers::SERVER_PROTOCOL, protocol);
        self.headers.insert(headers::REQUEST_URI, target);
        self.headers.insert(headers::PATH_INFO, percent_unescape(path));
        self.headers.insert(headers::SCRIPT_NAME, "");
        self.headers.insert(headers::QUERY_STRING, query);
        self.state = State::Headers;
        Ok(())
    }

    fn parse_header_line(&mut self, line: &str) -> Result<(), HttpParseError> {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HttpParseError::MalformedHeaderLine(line.to_string()))?;

        let normalized = name.trim().to_ascii_uppercase().replace('-', "_");
        let key = match normalized.as_str() {
            headers::CONTENT_LENGTH | headers::CONTENT_TYPE => normalized,
            _ => format!("HTTP_{normalized}"),
        };
        self.headers.insert(key, value.trim());
        Ok(())
    }
}

/// Decodes `%XX` escapes; malformed escapes pass through untouched.
///
/// `+` is left alone: it only means space inside a query string, and this
/// helper is applied to the path portion.
fn percent_unescape(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hi = (bytes[i + 1] as char).to_digit(16);
            let lo = (bytes[i + 2] as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
