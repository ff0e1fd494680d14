//! HTTP/1.1 request execution over a pooled connection.
//!
//! Writes the request (request line, headers, blank line, body) and parses
//! the response, delivering the head first and then body chunks in receive
//! order. Content-Length, chunked transfer encoding, and close-delimited
//! bodies are all handled; `HEAD`, 204, and 304 responses never read a
//! body.

use bytes::Bytes;
use http::Method;

use crate::error::{Error, Result};
use crate::http::conn::{Connection, Stream, classify_io};
use crate::http::headers::{find_header, header_contains_token, merge_response_headers};

/// Cap on the total size of the response status line plus headers.
pub(crate) const MAX_HEADER_BYTES: usize = 256 * 1024;

const READ_CHUNK: usize = 16 * 1024;

pub(crate) struct RequestSpec<'a> {
    pub method: &'a str,
    pub path: &'a str,
    /// Value for the `Host` header when the caller did not provide one.
    pub authority: &'a str,
    pub headers: &'a [(String, String)],
    pub body: Option<&'a [u8]>,
}

#[derive(Debug, Clone)]
pub(crate) struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

/// Receives the parsed response. `on_head` runs before the first body
/// chunk; chunks arrive in receive order, at most one call at a time.
pub(crate) trait ResponseSink {
    fn on_head(&mut self, head: &ResponseHead) -> Result<()>;
    fn on_body(&mut self, chunk: Bytes) -> Result<()>;
}

/// Execute one exchange on `conn`. On any transport error the connection
/// is marked `Closing` before the error propagates; deciding whether to
/// retry is the caller's business.
pub(crate) fn execute(
    conn: &mut Connection,
    spec: &RequestSpec<'_>,
    sink: &mut dyn ResponseSink,
) -> Result<ResponseHead> {
    let result = exchange(conn, spec, sink);
    if result.is_err() {
        conn.mark_closing();
    }
    result
}

fn exchange(
    conn: &mut Connection,
    spec: &RequestSpec<'_>,
    sink: &mut dyn ResponseSink,
) -> Result<ResponseHead> {
    let method = Method::from_bytes(spec.method.as_bytes())
        .map_err(|_| Error::argument(format!("invalid HTTP method '{}'", spec.method)))?;

    write_request(conn, spec)?;

    if request_asks_close(spec.headers) {
        conn.reusable = false;
    }

    let mut cursor = Cursor::new(&mut conn.stream);

    // Skip interim 1xx responses; 101 never occurs because we do not
    // request upgrades.
    let (version_keep_alive, status) = loop {
        let line = cursor.read_line()?;
        let (keep_alive, status) = parse_status_line(&line)?;
        if (100..200).contains(&status) {
            let mut sink_bytes = 0usize;
            read_raw_headers(&mut cursor, &mut sink_bytes)?;
            continue;
        }
        break (keep_alive, status);
    };

    let mut header_bytes = 0usize;
    let raw_headers = read_raw_headers(&mut cursor, &mut header_bytes)?;

    if !version_keep_alive
        || header_contains_token(&raw_headers, "Connection", "close")
    {
        conn.reusable = false;
    }

    let head = ResponseHead {
        status,
        headers: merge_response_headers(raw_headers.clone()),
    };
    sink.on_head(&head)?;

    let framing = response_framing(&method, status, &raw_headers)?;
    match framing {
        Framing::None => {}
        Framing::Length(remaining) => cursor.emit_exact(remaining, sink)?,
        Framing::Chunked => read_chunked_body(&mut cursor, sink)?,
        Framing::UntilClose => {
            conn.reusable = false;
            cursor.emit_until_eof(sink)?;
        }
    }

    // Bytes past the framed body mean the server is off protocol; do not
    // trust the connection for another exchange.
    if cursor.has_buffered() {
        conn.reusable = false;
    }

    Ok(head)
}

fn write_request(conn: &mut Connection, spec: &RequestSpec<'_>) -> Result<()> {
    let path = if spec.path.is_empty() { "/" } else { spec.path };
    if !path.starts_with('/') {
        return Err(Error::argument(format!(
            "request path '{path}' must start with '/'"
        )));
    }

    let mut head = String::with_capacity(256);
    head.push_str(spec.method);
    head.push(' ');
    head.push_str(&conn.request_target(path));
    head.push_str(" HTTP/1.1\r\n");

    let mut has_host = false;
    let mut has_content_length = false;
    for (name, value) in spec.headers {
        if name.contains(['\r', '\n']) || value.contains(['\r', '\n']) {
            return Err(Error::argument(format!("invalid header '{name}'")));
        }
        if name.eq_ignore_ascii_case("host") {
            has_host = true;
        }
        if name.eq_ignore_ascii_case("content-length") {
            has_content_length = true;
        }
    }

    if !has_host {
        head.push_str("Host: ");
        head.push_str(spec.authority);
        head.push_str("\r\n");
    }

    for (name, value) in spec.headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }

    // A present body always gets an accurate Content-Length; an absent
    // body yields no body framing at all.
    if let Some(body) = spec.body
        && !has_content_length
    {
        head.push_str("Content-Length: ");
        head.push_str(&body.len().to_string());
        head.push_str("\r\n");
    }

    head.push_str("\r\n");

    use std::io::Write as _;
    conn.stream
        .write_all(head.as_bytes())
        .map_err(|e| classify_io("write request head", e))?;
    if let Some(body) = spec.body
        && !body.is_empty()
    {
        conn.stream
            .write_all(body)
            .map_err(|e| classify_io("write request body", e))?;
    }
    conn.stream
        .flush()
        .map_err(|e| classify_io("flush request", e))?;
    Ok(())
}

fn request_asks_close(headers: &[(String, String)]) -> bool {
    find_header(headers, "Connection")
        .is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")))
}

/// Returns `(keep_alive_by_default, status)`.
fn parse_status_line(line: &str) -> Result<(bool, u16)> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    let keep_alive = match version {
        "HTTP/1.1" => true,
        "HTTP/1.0" => false,
        _ => {
            return Err(protocol_error(format!(
                "unsupported version in status line '{line}'"
            )));
        }
    };

    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .filter(|s| (100..=599).contains(s))
        .ok_or_else(|| protocol_error(format!("malformed status line '{line}'")))?;

    Ok((keep_alive, status))
}

fn read_raw_headers(
    cursor: &mut Cursor<'_>,
    total_bytes: &mut usize,
) -> Result<Vec<(String, String)>> {
    let mut headers: Vec<(String, String)> = Vec::new();

    loop {
        let line = cursor.read_line()?;
        *total_bytes += line.len() + 2;
        if *total_bytes > MAX_HEADER_BYTES {
            return Err(protocol_error("response header block exceeds 256 KiB"));
        }
        if line.is_empty() {
            return Ok(headers);
        }

        if line.starts_with(' ') || line.starts_with('\t') {
            // Obsolete line folding: append to the previous value.
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }

        let Some((name, value)) = line.split_once(':') else {
            return Err(protocol_error(format!("malformed header line '{line}'")));
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
}

enum Framing {
    None,
    Length(u64),
    Chunked,
    UntilClose,
}

fn response_framing(
    method: &Method,
    status: u16,
    headers: &[(String, String)],
) -> Result<Framing> {
    if *method == Method::HEAD || status == 204 || status == 304 {
        return Ok(Framing::None);
    }

    if header_contains_token(headers, "Transfer-Encoding", "chunked") {
        return Ok(Framing::Chunked);
    }

    if let Some(raw) = find_header(headers, "Content-Length") {
        let length: u64 = raw
            .trim()
            .parse()
            .map_err(|_| protocol_error(format!("invalid Content-Length '{raw}'")))?;
        return Ok(Framing::Length(length));
    }

    Ok(Framing::UntilClose)
}

fn read_chunked_body(cursor: &mut Cursor<'_>, sink: &mut dyn ResponseSink) -> Result<()> {
    loop {
        let line = cursor.read_line()?;
        let size_str = line.split(';').next().unwrap_or_default().trim();
        let size = u64::from_str_radix(size_str, 16)
            .map_err(|_| protocol_error(format!("invalid chunk size '{line}'")))?;

        if size == 0 {
            // Trailers are consumed and discarded.
            let mut trailer_bytes = 0usize;
            read_raw_headers(cursor, &mut trailer_bytes)?;
            return Ok(());
        }

        cursor.emit_exact(size, sink)?;

        let terminator = cursor.read_line()?;
        if !terminator.is_empty() {
            return Err(protocol_error("missing CRLF after chunk data"));
        }
    }
}

fn protocol_error(message: impl Into<String>) -> Error {
    Error::connection("HTTP_PROTOCOL_ERROR", message)
}

/// Buffered reader over the connection stream. Reads are sized so that
/// body bytes are forwarded in at most 16 KiB chunks.
struct Cursor<'s> {
    stream: &'s mut Stream,
    buf: Vec<u8>,
    pos: usize,
}

impl<'s> Cursor<'s> {
    fn new(stream: &'s mut Stream) -> Self {
        Self {
            stream,
            buf: Vec::with_capacity(READ_CHUNK),
            pos: 0,
        }
    }

    fn has_buffered(&self) -> bool {
        self.pos < self.buf.len()
    }

    /// Read more bytes from the stream. Returns the number read; zero
    /// means EOF.
    fn fill(&mut self) -> Result<usize> {
        use std::io::Read as _;

        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        }

        let mut chunk = [0u8; READ_CHUNK];
        let n = self
            .stream
            .read(&mut chunk)
            .map_err(|e| classify_io("read response", e))?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Read one CRLF-terminated line, excluding the terminator.
    fn read_line(&mut self) -> Result<String> {
        loop {
            if let Some(offset) = self.buf[self.pos..].iter().position(|&b| b == b'\n') {
                let end = self.pos + offset;
                let mut line = &self.buf[self.pos..end];
                if line.ends_with(b"\r") {
                    line = &line[..line.len() - 1];
                }
                let line = String::from_utf8_lossy(line).into_owned();
                self.pos = end + 1;
                return Ok(line);
            }

            if self.buf.len() - self.pos > MAX_HEADER_BYTES {
                return Err(protocol_error("response line exceeds the header cap"));
            }

            if self.fill()? == 0 {
                return Err(Error::connection(
                    "SOCKET_CLOSED",
                    "connection closed before the response completed",
                ));
            }
        }
    }

    /// Forward exactly `n` body bytes to the sink.
    fn emit_exact(&mut self, mut n: u64, sink: &mut dyn ResponseSink) -> Result<()> {
        while n > 0 {
            if self.pos == self.buf.len() && self.fill()? == 0 {
                return Err(Error::connection(
                    "SOCKET_CLOSED",
                    format!("connection closed with {n} body bytes outstanding"),
                ));
            }

            let available = self.buf.len() - self.pos;
            let take = (available as u64).min(n) as usize;
            let chunk = Bytes::copy_from_slice(&self.buf[self.pos..self.pos + take]);
            self.pos += take;
            n -= take as u64;
            sink.on_body(chunk)?;
        }
        Ok(())
    }

    /// Forward body bytes to the sink until the peer closes the stream.
    fn emit_until_eof(&mut self, sink: &mut dyn ResponseSink) -> Result<()> {
        loop {
            if self.pos < self.buf.len() {
                let chunk = Bytes::copy_from_slice(&self.buf[self.pos..]);
                self.pos = self.buf.len();
                sink.on_body(chunk)?;
            }
            if self.fill()? == 0 {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_lines_parse_and_validate() {
        assert_eq!(parse_status_line("HTTP/1.1 200 OK").unwrap(), (true, 200));
        assert_eq!(parse_status_line("HTTP/1.0 404 Not Found").unwrap(), (false, 404));
        assert_eq!(parse_status_line("HTTP/1.1 599 Weird").unwrap(), (true, 599));

        assert!(parse_status_line("HTTP/2 200 OK").is_err());
        assert!(parse_status_line("HTTP/1.1 600 Too Big").is_err());
        assert!(parse_status_line("HTTP/1.1 abc").is_err());
        assert!(parse_status_line("garbage").is_err());
    }

    #[test]
    fn framing_prefers_chunked_over_length() {
        let headers = vec![
            ("Transfer-Encoding".to_string(), "chunked".to_string()),
            ("Content-Length".to_string(), "10".to_string()),
        ];
        assert!(matches!(
            response_framing(&Method::GET, 200, &headers).unwrap(),
            Framing::Chunked
        ));
    }

    #[test]
    fn head_and_no_content_have_no_body() {
        let headers = vec![("Content-Length".to_string(), "10".to_string())];
        assert!(matches!(
            response_framing(&Method::HEAD, 200, &headers).unwrap(),
            Framing::None
        ));
        assert!(matches!(
            response_framing(&Method::GET, 204, &headers).unwrap(),
            Framing::None
        ));
        assert!(matches!(
            response_framing(&Method::GET, 304, &headers).unwrap(),
            Framing::None
        ));
    }

    #[test]
    fn missing_length_reads_until_close() {
        assert!(matches!(
            response_framing(&Method::GET, 200, &[]).unwrap(),
            Framing::UntilClose
        ));
    }

    #[test]
    fn bad_content_length_is_a_protocol_error() {
        let headers = vec![("Content-Length".to_string(), "ten".to_string())];
        assert!(response_framing(&Method::GET, 200, &headers).is_err());
    }
}
