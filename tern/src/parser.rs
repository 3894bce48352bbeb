// src/parser.rs
use crate::http::Method;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Nothing resembling a request line was received.
    Incomplete,
    InvalidFormat,
}

/// The parts of a request the dispatcher acts on. Headers are skipped, only
/// the blank line that ends them is located.
#[derive(Debug)]
pub struct Request<'a> {
    pub method: Method,
    /// Method token exactly as sent, for error messages.
    pub method_name: &'a str,
    /// Request target without the query string, still percent-encoded.
    pub path: &'a str,
    pub query: Option<&'a str>,
    /// Bytes after `\r\n\r\n`; `None` when the delimiter never arrived.
    pub body: Option<&'a [u8]>,
}

const BODY_DELIMITER: &[u8] = b"\r\n\r\n";

/// Parses the request line of `buf` and locates the body.
pub fn parse_request(buf: &[u8]) -> Result<Request<'_>, ParseError> {
    if buf.is_empty() {
        return Err(ParseError::Incomplete);
    }

    // Request line ends at the first CRLF (or the end of what we have)
    let line_end = find(buf, b"\r\n").unwrap_or(buf.len());
    let line = &buf[..line_end];

    // METHOD SP TARGET [SP VERSION]
    let space1 = line
        .iter()
        .position(|&b| b == b' ')
        .ok_or(ParseError::InvalidFormat)?;
    if space1 == 0 {
        return Err(ParseError::InvalidFormat);
    }
    let method_bytes = &line[..space1];
    let method_name = std::str::from_utf8(method_bytes).map_err(|_| ParseError::InvalidFormat)?;

    let rest = &line[space1 + 1..];
    let space2 = rest.iter().position(|&b| b == b' ').unwrap_or(rest.len());
    let target = std::str::from_utf8(&rest[..space2]).map_err(|_| ParseError::InvalidFormat)?;

    let (path, query) = match target.find('?') {
        Some(idx) => (&target[..idx], Some(&target[idx + 1..])),
        None => (target, None),
    };

    let body = find(buf, BODY_DELIMITER).map(|pos| &buf[pos + BODY_DELIMITER.len()..]);

    Ok(Request {
        method: Method::from_bytes(method_bytes),
        method_name,
        path,
        query,
        body,
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
