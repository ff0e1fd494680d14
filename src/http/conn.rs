//! A single pooled HTTP/1.1 connection.
//!
//! Connections are owned exclusively by their pool and handed to one
//! request at a time. Lifecycle: `Idle` in the pool, `InUse` while a
//! request runs, `Closing` once the transport is known-bad, `Dead` when
//! the socket is dropped.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::{ClientConnection, StreamOwned};

use crate::error::{Error, Result};
use crate::http::endpoint::Endpoint;
use crate::http::proxy::ProxyOptions;
use crate::runtime::Runtime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    Idle,
    InUse,
    Closing,
    Dead,
}

#[derive(Debug)]
pub(crate) enum Stream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.read(buf),
            Self::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.write(buf),
            Self::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(s) => s.flush(),
            Self::Tls(s) => s.flush(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Connection {
    pub(crate) stream: Stream,
    pub(crate) state: ConnState,
    pub(crate) last_used_at: Instant,
    /// Cleared when either side signals `Connection: close` or the
    /// response framing cannot guarantee a clean boundary.
    pub(crate) reusable: bool,
    /// Set for plain-HTTP requests routed through a proxy, which must use
    /// absolute-form request targets.
    absolute_base: Option<String>,
}

impl Connection {
    /// Establish a connection to `endpoint`, optionally through a proxy,
    /// completing the TLS handshake before returning.
    pub(crate) fn open(
        endpoint: &Endpoint,
        tls: Option<&Arc<rustls::ClientConfig>>,
        proxy: Option<&ProxyOptions>,
        connect_timeout: Duration,
        read_timeout: Option<Duration>,
    ) -> Result<Connection> {
        let (dial_host, dial_port) = match proxy {
            Some(p) => (p.host.as_str(), p.port),
            None => (endpoint.host(), endpoint.port()),
        };

        let tcp = connect_tcp(dial_host, dial_port, connect_timeout, proxy.is_some())?;
        tcp.set_nodelay(true)
            .map_err(|e| Error::from_io("configure socket", e))?;
        tcp.set_read_timeout(read_timeout)
            .map_err(|e| Error::from_io("configure socket", e))?;
        tcp.set_write_timeout(read_timeout)
            .map_err(|e| Error::from_io("configure socket", e))?;

        let mut absolute_base = None;
        let tcp = match (proxy, endpoint.is_tls()) {
            (Some(p), true) => {
                let mut tcp = tcp;
                establish_tunnel(&mut tcp, endpoint, p)?;
                tcp
            }
            (Some(_), false) => {
                absolute_base = Some(format!("http://{}", endpoint.authority()));
                tcp
            }
            (None, _) => tcp,
        };

        let stream = match tls {
            Some(config) => Stream::Tls(Box::new(handshake(endpoint, config, tcp)?)),
            None => Stream::Plain(tcp),
        };

        Ok(Connection {
            stream,
            state: ConnState::InUse,
            last_used_at: Instant::now(),
            reusable: true,
            absolute_base,
        })
    }

    /// The request target to write for `path` on this connection.
    pub(crate) fn request_target(&self, path: &str) -> String {
        match &self.absolute_base {
            Some(base) => format!("{base}{path}"),
            None => path.to_string(),
        }
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_used_at.elapsed()
    }

    pub(crate) fn mark_idle(&mut self) {
        self.state = ConnState::Idle;
        self.last_used_at = Instant::now();
    }

    pub(crate) fn mark_closing(&mut self) {
        self.state = ConnState::Closing;
        self.reusable = false;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.state = ConnState::Dead;
    }
}

fn connect_tcp(
    host: &str,
    port: u16,
    timeout: Duration,
    via_proxy: bool,
) -> Result<TcpStream> {
    let addrs = Runtime::acquire().resolver().resolve(host, port)?;

    let deadline = Instant::now() + timeout;
    let mut last_err: Option<io::Error> = None;
    for addr in addrs {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match TcpStream::connect_timeout(&addr, remaining) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }

    let context = format!("connect to {host}:{port}");
    match last_err {
        Some(e) if via_proxy => {
            let err = Error::from_io(&context, e);
            Err(Error::proxy("PROXY_CONNECT_FAILED", err.to_string()))
        }
        Some(e) => Err(Error::from_io(&context, e)),
        None => Err(Error::timeout("SOCKET_CONNECT_TIMEOUT", context)),
    }
}

/// Send a `CONNECT` request and consume the proxy's response head.
fn establish_tunnel(tcp: &mut TcpStream, endpoint: &Endpoint, proxy: &ProxyOptions) -> Result<()> {
    let authority = format!("{}:{}", endpoint.host(), endpoint.port());
    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some(auth) = proxy.authorization_value() {
        request.push_str("Proxy-Authorization: ");
        request.push_str(&auth);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");

    tcp.write_all(request.as_bytes())
        .and_then(|()| tcp.flush())
        .map_err(|e| Error::proxy("PROXY_CONNECT_FAILED", format!("CONNECT write: {e}")))?;

    // Read the response head byte by byte so no tunneled bytes are
    // consumed past the blank line.
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match tcp.read(&mut byte) {
            Ok(0) => {
                return Err(Error::proxy(
                    "PROXY_CONNECT_FAILED",
                    "proxy closed the connection during CONNECT",
                ));
            }
            Ok(_) => head.push(byte[0]),
            Err(e) => {
                return Err(Error::proxy(
                    "PROXY_CONNECT_FAILED",
                    format!("CONNECT read: {e}"),
                ));
            }
        }
        if head.len() > 16 * 1024 {
            return Err(Error::proxy(
                "PROXY_CONNECT_FAILED",
                "oversized CONNECT response head",
            ));
        }
    }

    let status_line = head
        .split(|&b| b == b'\n')
        .next()
        .unwrap_or_default();
    let status = std::str::from_utf8(status_line)
        .ok()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| Error::proxy("PROXY_CONNECT_FAILED", "malformed CONNECT response"))?;

    match status {
        200..=299 => Ok(()),
        407 => Err(Error::proxy(
            "PROXY_AUTH_REQUIRED",
            format!("proxy rejected credentials (HTTP {status})"),
        )),
        _ => Err(Error::proxy(
            "PROXY_CONNECT_REJECTED",
            format!("proxy refused CONNECT (HTTP {status})"),
        )),
    }
}

fn handshake(
    endpoint: &Endpoint,
    config: &Arc<rustls::ClientConfig>,
    mut tcp: TcpStream,
) -> Result<StreamOwned<ClientConnection, TcpStream>> {
    let server_name = rustls::pki_types::ServerName::try_from(endpoint.host().to_string())
        .map_err(|e| Error::tls("TLS_INVALID_SERVER_NAME", format!("{}: {e}", endpoint.host())))?;

    let mut conn = ClientConnection::new(Arc::clone(config), server_name).map_err(|e| {
        Error::Tls {
            symbol: "TLS_CTX_ERROR",
            message: format!("failed to start TLS session: {e}"),
            source: Some(Box::new(e)),
        }
    })?;

    while conn.is_handshaking() {
        conn.complete_io(&mut tcp).map_err(|e| classify_io("TLS handshake", e))?;
    }

    Ok(StreamOwned::new(conn, tcp))
}

/// Map an I/O error, surfacing embedded TLS failures as `Error::Tls`.
///
/// rustls reports alert and certificate failures as `io::Error`s wrapping a
/// `rustls::Error` once the stream is in use.
pub(crate) fn classify_io(context: &str, err: io::Error) -> Error {
    let is_tls = err
        .get_ref()
        .is_some_and(|inner| inner.is::<rustls::Error>());
    if is_tls {
        return Error::Tls {
            symbol: "TLS_NEGOTIATION_FAILURE",
            message: format!("{context}: {err}"),
            source: Some(Box::new(err)),
        };
    }
    Error::from_io(context, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn local_endpoint(port: u16) -> Endpoint {
        Endpoint::parse(&format!("http://127.0.0.1:{port}")).unwrap()
    }

    #[test]
    fn open_connects_and_is_in_use() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let conn = Connection::open(
            &local_endpoint(port),
            None,
            None,
            Duration::from_secs(5),
            Some(Duration::from_secs(5)),
        )
        .unwrap();

        assert_eq!(conn.state, ConnState::InUse);
        assert!(conn.reusable);
        assert_eq!(conn.request_target("/x"), "/x");
    }

    #[test]
    fn connect_refused_maps_to_connection_error() {
        // Bind then drop to find a port with nothing listening.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let err = Connection::open(
            &local_endpoint(port),
            None,
            None,
            Duration::from_secs(1),
            None,
        )
        .unwrap_err();

        assert!(matches!(err, Error::Connection { .. }), "{err}");
    }

    #[test]
    fn plain_http_through_proxy_uses_absolute_form() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let proxy = ProxyOptions::new("127.0.0.1", port);

        let conn = Connection::open(
            &Endpoint::parse("http://origin.example:8080").unwrap(),
            None,
            Some(&proxy),
            Duration::from_secs(5),
            None,
        )
        .unwrap();

        assert_eq!(
            conn.request_target("/data"),
            "http://origin.example:8080/data"
        );
    }
}
