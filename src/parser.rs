// src/parser.rs
//
// Resumable HTTP/1.1 request parser. A line sub-machine extracts one
// CRLF-terminated line at a time from the unscanned region of the read
// buffer; the outer machine walks REQUEST_LINE -> HEADER -> CONTENT. All
// cursors live in the `Conn`, so parsing picks up exactly where the previous
// read event stopped regardless of fragmentation.
use std::path::Path;

use tracing::{debug, trace};

use crate::conn::{Conn, Method, ParsePhase};
use crate::resolve;

/// Outcome of one scan of a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    /// A full line was extracted; both terminator bytes were NULed in place.
    Ok,
    /// The buffer ended mid-line; the cursor stays put for the next read.
    Open,
    /// A bare `\n` without a preceding `\r`.
    Bad,
}

/// Classification of a request-handling pass, consumed by the response
/// builder. `Incomplete` means re-arm for more input; everything else is
/// terminal for this request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Incomplete,
    /// Target resolved to a readable regular file (200).
    FileRequest,
    /// Malformed request, unsupported method, or directory target (400).
    BadRequest,
    /// Target does not exist under the document root (404).
    NoResource,
    /// Target is not world-readable (403).
    Forbidden,
    /// Resolution or response construction failed (500).
    InternalError,
}

/// Extract one line from `checked_idx..read_idx`.
///
/// A `\r` as the final buffered byte leaves the cursor on the `\r` so the
/// next read resumes without re-scanning consumed bytes.
pub fn parse_line(conn: &mut Conn) -> LineStatus {
    while conn.checked_idx < conn.read_idx {
        match conn.read_buf[conn.checked_idx] {
            b'\r' => {
                if conn.checked_idx + 1 == conn.read_idx {
                    return LineStatus::Open;
                }
                if conn.read_buf[conn.checked_idx + 1] == b'\n' {
                    conn.read_buf[conn.checked_idx] = 0;
                    conn.checked_idx += 1;
                    conn.read_buf[conn.checked_idx] = 0;
                    conn.checked_idx += 1;
                    return LineStatus::Ok;
                }
                return LineStatus::Bad;
            }
            b'\n' => {
                if conn.checked_idx > 0 && conn.read_buf[conn.checked_idx - 1] == b'\r' {
                    conn.read_buf[conn.checked_idx - 1] = 0;
                    conn.read_buf[conn.checked_idx] = 0;
                    conn.checked_idx += 1;
                    return LineStatus::Ok;
                }
                return LineStatus::Bad;
            }
            _ => conn.checked_idx += 1,
        }
    }
    LineStatus::Open
}

/// The current line, excluding its two terminator bytes. `None` if it is not
/// valid UTF-8.
fn line_text(conn: &Conn, start: usize) -> Option<String> {
    let end = conn.checked_idx.saturating_sub(2).max(start);
    std::str::from_utf8(&conn.read_buf[start..end])
        .ok()
        .map(str::to_owned)
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

/// `GET <abs-path-or-absolute-URL> HTTP/1.1`. Anything else is a bad request.
fn parse_request_line(conn: &mut Conn, text: &str) -> bool {
    let mut parts = text.split_ascii_whitespace();
    let (Some(method), Some(raw_url), Some(version)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    if parts.next().is_some() {
        return false;
    }

    if !method.eq_ignore_ascii_case("GET") {
        return false;
    }
    if !version.eq_ignore_ascii_case("HTTP/1.1") {
        return false;
    }

    let mut url = raw_url;
    if strip_prefix_ci(url, "http://").is_some() {
        // Absolute URL: skip the authority, keep the path.
        url = match url[7..].find('/') {
            Some(i) => &url[7 + i..],
            None => return false,
        };
    }
    if !url.starts_with('/') {
        return false;
    }

    conn.method = Method::Get;
    conn.url = url.to_string();
    conn.version = version.to_string();
    conn.phase = ParsePhase::Header;
    true
}

enum HeaderStep {
    More,
    Complete,
}

/// One header line. An empty line ends the header section.
fn parse_header(conn: &mut Conn, text: &str) -> HeaderStep {
    if text.is_empty() {
        if conn.content_length != 0 {
            conn.phase = ParsePhase::Content;
            return HeaderStep::More;
        }
        return HeaderStep::Complete;
    }

    if let Some(value) = strip_prefix_ci(text, "Connection:") {
        if value.trim().eq_ignore_ascii_case("keep-alive") {
            conn.keep_alive = true;
        }
    } else if let Some(value) = strip_prefix_ci(text, "Content-Length:") {
        conn.content_length = value.trim().parse().unwrap_or(0);
    } else if let Some(value) = strip_prefix_ci(text, "Host:") {
        conn.host = value.trim().to_string();
    } else {
        debug!(header = %text, "ignoring unrecognized header");
    }
    HeaderStep::More
}

/// Drive the state machine over everything buffered so far. Terminal
/// classifications go through request resolution before returning.
pub fn process_read(conn: &mut Conn, doc_root: &Path) -> RequestStatus {
    loop {
        if conn.phase == ParsePhase::Content {
            // Body completeness is purely length-based; no line scanning and
            // no validation of the body bytes themselves.
            let buffered = conn.read_idx - conn.checked_idx;
            if buffered >= conn.content_length {
                return resolve::do_request(conn, doc_root);
            }
            return RequestStatus::Incomplete;
        }

        match parse_line(conn) {
            LineStatus::Open => return RequestStatus::Incomplete,
            LineStatus::Bad => return RequestStatus::BadRequest,
            LineStatus::Ok => {}
        }

        let line_start = conn.start_line;
        conn.start_line = conn.checked_idx;
        let Some(text) = line_text(conn, line_start) else {
            return RequestStatus::BadRequest;
        };
        trace!(fd = conn.fd, line = %text, "got http line");

        match conn.phase {
            ParsePhase::RequestLine => {
                if !parse_request_line(conn, &text) {
                    return RequestStatus::BadRequest;
                }
            }
            ParsePhase::Header => match parse_header(conn, &text) {
                HeaderStep::More => {}
                HeaderStep::Complete => return resolve::do_request(conn, doc_root),
            },
            ParsePhase::Content => unreachable!("content phase handled above"),
        }
    }
}
