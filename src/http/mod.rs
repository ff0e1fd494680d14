//! HTTP/1.1 client: endpoints, TLS, proxying, pooled connections.

pub(crate) mod conn;
pub(crate) mod endpoint;
pub(crate) mod exec;
pub(crate) mod headers;
mod pool;
mod proxy;
pub(crate) mod tls;

pub use endpoint::{Endpoint, Scheme};
pub use pool::{ConnectionPool, PoolManager, PoolOptions};
pub use proxy::ProxyOptions;

use bytes::Bytes;

use crate::error::Result;

/// A buffered HTTP response.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    /// Merged response headers in first-seen order; `Set-Cookie` entries
    /// are preserved separately.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpResponse {
    /// First value for `name`, comparing case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        headers::find_header(&self.headers, name)
    }

    pub fn successful(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Ordered destination for streamed response bytes.
///
/// The pool invokes `on_chunk` on the calling thread, in receive order,
/// never concurrently for one request. Returning an error aborts the
/// transfer and surfaces the error from the request call.
pub trait ChunkSink {
    fn on_chunk(&mut self, chunk: &[u8]) -> Result<()>;
}

impl<F> ChunkSink for F
where
    F: FnMut(&[u8]) -> Result<()>,
{
    fn on_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self(chunk)
    }
}

impl ChunkSink for Vec<u8> {
    fn on_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.extend_from_slice(chunk);
        Ok(())
    }
}
