//! Stateless HTTP/1.x head grammar.
//!
//! Line scanning works on raw bytes so that a line split across two reads can
//! be resumed; validation works on the 7-bit text copied out of those lines.

use memchr::memchr_iter;

use crate::error::HttpError;
use crate::http::Method;

/// Longest accepted request line, terminator excluded.
pub const MAX_REQUEST_LINE: usize = 300;
/// Longest accepted request URI.
pub const MAX_URI: usize = 255;
/// Longest accepted (possibly folded) header line, terminator excluded.
pub const MAX_HEADER_LINE: usize = 8 * 1024;
/// Most header lines a single request may carry.
pub const MAX_HEADERS: usize = 50;

/// Locate the CR of the CR-LF that terminates the line starting at `from`.
///
/// With `folding` set, a CR-LF followed by SP or HT continues the line. A
/// non-empty line whose CR-LF sits at the very end of `buf` is undecided and
/// reported as not terminated yet, since the next read may start with a fold.
pub fn find_line_end(buf: &[u8], from: usize, folding: bool) -> Option<usize> {
    if from >= buf.len() {
        return None;
    }
    for offset in memchr_iter(b'\r', &buf[from..]) {
        let cr = from + offset;
        if cr + 1 >= buf.len() {
            return None;
        }
        if buf[cr + 1] != b'\n' {
            continue;
        }
        if folding && cr > from {
            match buf.get(cr + 2) {
                None => return None,
                Some(b' ') | Some(b'\t') => continue,
                Some(_) => {}
            }
        }
        return Some(cr);
    }
    None
}

/// Copy the next line out of `buf` into `out` and advance `pos` past its
/// terminator.
///
/// Only 7-bit bytes are copied; anything else is dropped. CR-LF pairs inside a
/// folded line are removed, leaving the continuation whitespace in place.
/// Returns `false` and consumes nothing when no terminator is present yet.
pub fn read_line(buf: &[u8], pos: &mut usize, folding: bool, out: &mut String) -> bool {
    let Some(end) = find_line_end(buf, *pos, folding) else {
        return false;
    };
    let line = &buf[*pos..end];
    let mut i = 0;
    while i < line.len() {
        let b = line[i];
        if b == b'\r' && line.get(i + 1) == Some(&b'\n') {
            i += 2;
            continue;
        }
        if b.is_ascii() {
            out.push(b as char);
        }
        i += 1;
    }
    *pos = end + 2;
    true
}

/// RFC 7230 `tchar`.
fn is_token_char(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^' | b'_'
                | b'`' | b'|' | b'~'
        )
}

pub fn is_token(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(is_token_char)
}

/// A validated `METHOD SP URI SP HTTP/1.<minor>` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    pub method_name: String,
    pub uri: String,
    pub minor_version: u32,
}

/// Validate a request line. Errors here are recoverable: the line itself was
/// fully consumed, so the stream is still aligned on a line boundary.
pub fn parse_request_line(line: &str) -> Result<RequestLine, HttpError> {
    if line.len() > MAX_REQUEST_LINE {
        return Err(HttpError::uri_too_long("request line too long", false));
    }

    let mut parts = line.split(' ');
    let (Some(method), Some(uri), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(HttpError::bad_request("malformed request line", false));
    };

    if !is_token(method) {
        return Err(HttpError::bad_request("malformed method", false));
    }
    if uri.is_empty() || !uri.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(HttpError::bad_request("malformed request URI", false));
    }
    if uri.len() > MAX_URI {
        return Err(HttpError::uri_too_long("request URI too long", false));
    }

    let minor = version
        .strip_prefix("HTTP/1.")
        .filter(|d| !d.is_empty() && d.bytes().all(|b| b.is_ascii_digit()))
        .ok_or_else(|| HttpError::bad_request("unsupported protocol version", false))?;
    let minor_version = minor
        .parse::<u32>()
        .map_err(|_| HttpError::bad_request("unsupported protocol version", false))?;

    Ok(RequestLine {
        method: Method::from_bytes(method.as_bytes()),
        method_name: method.to_string(),
        uri: uri.to_string(),
        minor_version,
    })
}

/// Validate `token ":" value`. The name comes back lowercased and the value
/// trimmed. Errors here are fatal: the head is only partially consumed.
pub fn parse_header_line(line: &str) -> Result<(String, String), HttpError> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| HttpError::bad_request("malformed header line", true))?;
    if !is_token(name) {
        return Err(HttpError::bad_request("malformed header name", true));
    }
    let value = value.trim_matches(|c| c == ' ' || c == '\t');
    Ok((name.to_ascii_lowercase(), value.to_string()))
}

/// An inclusive byte range resolved against a resource length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
    pub length: u64,
}

/// Parse a single `Range` header value against `resource_len`.
///
/// Accepts `bytes=S-E`, `bytes=S-` and `bytes=-N`. The end is clamped to the
/// last byte of the resource. Anything unparsable, multi-range, or empty after
/// clamping yields `None`, meaning the full resource is served.
pub fn parse_range(value: &str, resource_len: u64) -> Option<ByteRange> {
    if resource_len == 0 {
        return None;
    }
    let spec = value.trim().strip_prefix("bytes=")?.trim();
    if spec.contains(',') {
        return None;
    }
    let (first, last) = spec.split_once('-')?;
    let (first, last) = (first.trim(), last.trim());
    let last_byte = resource_len - 1;

    let (start, end) = match (first.is_empty(), last.is_empty()) {
        (true, true) => return None,
        (true, false) => {
            let suffix = parse_offset(last)?;
            if suffix == 0 {
                return None;
            }
            (resource_len.saturating_sub(suffix), last_byte)
        }
        (false, true) => (parse_offset(first)?, last_byte),
        (false, false) => (parse_offset(first)?, parse_offset(last)?.min(last_byte)),
    };

    if end < start {
        return None;
    }
    Some(ByteRange {
        start,
        end,
        length: end - start + 1,
    })
}

fn parse_offset(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
