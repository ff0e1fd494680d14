use std::{error::Error as StdError, fmt, io};

use bytes::Bytes;
use http::StatusCode;

pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a CBOR codec failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecErrorKind {
    OutOfBytes,
    ExtraBytes,
    UnknownType,
    UnexpectedBreak,
    UnexpectedAdditionalInfo,
}

impl CodecErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OutOfBytes => "out of bytes",
            Self::ExtraBytes => "extra bytes",
            Self::UnknownType => "unknown type",
            Self::UnexpectedBreak => "unexpected break stop code",
            Self::UnexpectedAdditionalInfo => "unexpected additional information",
        }
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub enum Error {
    /// Malformed input to an API: bad endpoint, invalid checksum algorithm,
    /// missing required option.
    Argument {
        message: String,
    },

    /// DNS failure, connection refused, or a socket error before or during
    /// the exchange. `symbol` is a stable diagnostic token operators can
    /// grep for.
    Connection {
        symbol: &'static str,
        message: String,
        source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    },

    /// Connect or read timeout exceeded.
    Timeout {
        symbol: &'static str,
        message: String,
    },

    /// TLS handshake or certificate validation failure.
    Tls {
        symbol: &'static str,
        message: String,
        source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    },

    /// Proxy connection or authentication failure.
    Proxy {
        symbol: &'static str,
        message: String,
    },

    /// HTTP response with status >= 400. Carries the raw response so the
    /// caller can inspect the service's error document.
    Service {
        status: StatusCode,
        headers: Vec<(String, String)>,
        body: Bytes,
    },

    /// CBOR encode/decode failure.
    Codec {
        kind: CodecErrorKind,
        message: String,
    },
}

impl Error {
    pub fn argument(message: impl Into<String>) -> Self {
        Self::Argument {
            message: message.into(),
        }
    }

    pub fn connection(symbol: &'static str, message: impl Into<String>) -> Self {
        Self::Connection {
            symbol,
            message: message.into(),
            source: None,
        }
    }

    pub fn timeout(symbol: &'static str, message: impl Into<String>) -> Self {
        Self::Timeout {
            symbol,
            message: message.into(),
        }
    }

    pub fn tls(symbol: &'static str, message: impl Into<String>) -> Self {
        Self::Tls {
            symbol,
            message: message.into(),
            source: None,
        }
    }

    pub fn proxy(symbol: &'static str, message: impl Into<String>) -> Self {
        Self::Proxy {
            symbol,
            message: message.into(),
        }
    }

    pub fn service(status: StatusCode, headers: Vec<(String, String)>, body: Bytes) -> Self {
        Self::Service {
            status,
            headers,
            body,
        }
    }

    pub fn codec(kind: CodecErrorKind, message: impl Into<String>) -> Self {
        Self::Codec {
            kind,
            message: message.into(),
        }
    }

    /// Classify an I/O error raised while connecting or exchanging bytes.
    ///
    /// Timeouts map to `Timeout`; everything else becomes `Connection` with
    /// a symbol derived from the error kind.
    pub(crate) fn from_io(context: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout {
                symbol: "SOCKET_TIMEOUT",
                message: format!("{context}: timed out"),
            },
            kind => Self::Connection {
                symbol: io_symbol(kind),
                message: format!("{context}: {err}"),
                source: Some(Box::new(err)),
            },
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Service { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// The diagnostic symbol for transport-level failures.
    pub fn symbol(&self) -> Option<&'static str> {
        match self {
            Self::Connection { symbol, .. }
            | Self::Timeout { symbol, .. }
            | Self::Tls { symbol, .. }
            | Self::Proxy { symbol, .. } => Some(symbol),
            _ => None,
        }
    }

    /// Whether a retry of the same request may succeed. Used by the
    /// meta-request engine for per-part retries.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::Timeout { .. } => true,
            Self::Service { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::REQUEST_TIMEOUT
                    || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Argument { .. }
            | Self::Tls { .. }
            | Self::Proxy { .. }
            | Self::Codec { .. } => false,
        }
    }
}

pub(crate) fn io_symbol(kind: io::ErrorKind) -> &'static str {
    match kind {
        io::ErrorKind::ConnectionRefused => "SOCKET_CONNECT_REFUSED",
        io::ErrorKind::ConnectionReset => "SOCKET_CONNECTION_RESET",
        io::ErrorKind::ConnectionAborted => "SOCKET_CONNECT_ABORTED",
        io::ErrorKind::NotConnected => "SOCKET_NOT_CONNECTED",
        io::ErrorKind::AddrNotAvailable => "DNS_NO_ADDRESSES",
        io::ErrorKind::BrokenPipe => "SOCKET_BROKEN_PIPE",
        io::ErrorKind::UnexpectedEof => "SOCKET_CLOSED",
        _ => "SOCKET_ERROR",
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Argument { message } => write!(f, "invalid argument: {message}"),
            Self::Connection {
                symbol, message, ..
            } => write!(f, "connection error ({symbol}): {message}"),
            Self::Timeout { symbol, message } => write!(f, "timeout ({symbol}): {message}"),
            Self::Tls {
                symbol, message, ..
            } => write!(f, "tls error ({symbol}): {message}"),
            Self::Proxy { symbol, message } => write!(f, "proxy error ({symbol}): {message}"),
            Self::Service { status, body, .. } => {
                let snippet = String::from_utf8_lossy(&body[..body.len().min(256)]);
                if snippet.is_empty() {
                    write!(f, "service error: HTTP {status}")
                } else {
                    write!(f, "service error: HTTP {status}: {snippet}")
                }
            }
            Self::Codec { kind, message } => write!(f, "{}: {message}", kind.as_str()),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection { source, .. } | Self::Tls { source, .. } => {
                source.as_deref().map(|e| e as &(dyn StdError + 'static))
            }
            _ => None,
        }
    }
}
