//! Per-endpoint connection pool and the endpoint→pool manager.
//!
//! A pool owns every connection to its endpoint: at most `max_connections`
//! exist at once, idle connections past `max_connection_idle_ms` are closed
//! before reuse, and no connection is ever shared by two requests. Public
//! request entry points run their socket I/O on runtime workers while the
//! caller parks; `perform` is the inline variant used by code already
//! running on a worker.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::bridge::{CancelOnDrop, CancelToken, Event, Exchange, canceled_error};
use crate::error::{Error, Result};
use crate::http::conn::{Connection, ConnState};
use crate::http::endpoint::Endpoint;
use crate::http::exec::{self, RequestSpec, ResponseHead, ResponseSink};
use crate::http::proxy::ProxyOptions;
use crate::http::{ChunkSink, HttpResponse};
use crate::runtime::Runtime;

/// Pool configuration. Defaults match the documented option table.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub max_connections: usize,
    pub max_connection_idle_ms: u64,
    pub connect_timeout_ms: u64,
    /// Bounds idle time between response bytes. Zero disables the timeout.
    pub read_timeout_ms: u64,
    pub ssl_verify_peer: bool,
    pub ssl_ca_bundle: Option<std::path::PathBuf>,
    pub proxy: Option<ProxyOptions>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_connections: 25,
            max_connection_idle_ms: 60_000,
            connect_timeout_ms: 60_000,
            read_timeout_ms: 60_000,
            ssl_verify_peer: true,
            ssl_ca_bundle: None,
            proxy: None,
        }
    }
}

/// Handle to a per-endpoint pool. Clones share the same pool.
#[derive(Clone, Debug)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    endpoint: Endpoint,
    authority: String,
    options: PoolOptions,
    tls: Option<Arc<rustls::ClientConfig>>,
    state: Mutex<PoolState>,
    available: Condvar,
}

#[derive(Debug)]
struct PoolState {
    idle: VecDeque<Connection>,
    /// Connections in `{Idle, InUse}` — never exceeds `max_connections`.
    total: usize,
}

impl ConnectionPool {
    /// Create a pool for `endpoint` (`scheme://host[:port]`).
    pub fn new(endpoint: &str, options: PoolOptions) -> Result<ConnectionPool> {
        Self::for_endpoint(Endpoint::parse(endpoint)?, options)
    }

    pub(crate) fn for_endpoint(endpoint: Endpoint, options: PoolOptions) -> Result<ConnectionPool> {
        if options.max_connections == 0 {
            return Err(Error::argument("max_connections must be at least 1"));
        }

        let tls = if endpoint.is_tls() {
            Some(crate::http::tls::client_config(
                options.ssl_verify_peer,
                options.ssl_ca_bundle.as_deref(),
            )?)
        } else {
            None
        };

        Ok(ConnectionPool {
            inner: Arc::new(PoolInner {
                authority: endpoint.authority(),
                endpoint,
                options,
                tls,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    total: 0,
                }),
                available: Condvar::new(),
            }),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Execute a request and buffer the whole response body.
    ///
    /// Blocks the calling thread, parked on a condvar, while a runtime
    /// worker drives the socket.
    pub fn request(
        &self,
        method: &str,
        path: &str,
        headers: &[(String, String)],
        body: Option<&[u8]>,
    ) -> Result<HttpResponse> {
        let exchange: Exchange<(), HttpResponse> = Exchange::new();
        let mut guard = CancelOnDrop::new(exchange.cancel_token());

        let worker_side = exchange.clone();
        let pool = self.clone();
        let method = method.to_string();
        let path = path.to_string();
        let headers = headers.to_vec();
        let body: Option<Bytes> = body.map(Bytes::copy_from_slice);

        Runtime::acquire().spawn(move || {
            let cancel = worker_side.cancel_token();
            let mut sink = BufferedSink {
                body: Vec::new(),
                cancel,
            };
            let outcome = pool
                .perform(&method, &path, &headers, body.as_deref(), &mut sink)
                .map(|head| HttpResponse {
                    status: head.status,
                    headers: head.headers,
                    body: Bytes::from(std::mem::take(&mut sink.body)),
                });
            worker_side.finish(outcome);
        });

        let outcome = exchange.wait();
        guard.disarm();
        outcome
    }

    /// Execute a request, delivering the body through `sink` chunk by
    /// chunk. Chunks are forwarded on the calling thread, in receive
    /// order, one at a time; headers are available before the first chunk.
    pub fn request_streaming(
        &self,
        method: &str,
        path: &str,
        headers: &[(String, String)],
        body: Option<&[u8]>,
        sink: &mut dyn ChunkSink,
    ) -> Result<(u16, Vec<(String, String)>)> {
        let exchange: Exchange<ResponseHead, ()> = Exchange::new();
        let mut guard = CancelOnDrop::new(exchange.cancel_token());

        let worker_side = exchange.clone();
        let pool = self.clone();
        let method = method.to_string();
        let path = path.to_string();
        let headers = headers.to_vec();
        let body: Option<Bytes> = body.map(Bytes::copy_from_slice);

        Runtime::acquire().spawn(move || {
            let mut forward = ForwardSink {
                exchange: worker_side.clone(),
            };
            let outcome = pool
                .perform(&method, &path, &headers, body.as_deref(), &mut forward)
                .map(|_| ());
            worker_side.finish(outcome);
        });

        let mut head: Option<ResponseHead> = None;
        let mut sink_error: Option<Error> = None;
        loop {
            match exchange.recv() {
                Event::Head(h) => head = Some(h),
                Event::Chunk(chunk) => {
                    if sink_error.is_none()
                        && let Err(e) = sink.on_chunk(&chunk)
                    {
                        // Stop the worker; the connection is abandoned in
                        // Closing state.
                        exchange.cancel_token().cancel();
                        sink_error = Some(e);
                    }
                }
                Event::Done(outcome) => {
                    guard.disarm();
                    if let Some(e) = sink_error {
                        return Err(e);
                    }
                    outcome?;
                    let head = head.ok_or_else(|| {
                        Error::connection(
                            "HTTP_PROTOCOL_ERROR",
                            "response completed without a status line",
                        )
                    })?;
                    return Ok((head.status, head.headers));
                }
            }
        }
    }

    /// Inline request execution for callers already on a worker thread.
    pub(crate) fn perform(
        &self,
        method: &str,
        path: &str,
        headers: &[(String, String)],
        body: Option<&[u8]>,
        sink: &mut dyn ResponseSink,
    ) -> Result<ResponseHead> {
        #[cfg(feature = "tracing")]
        let _guard = tracing::debug_span!(
            "http.request",
            method,
            path,
            endpoint = %self.inner.endpoint,
        )
        .entered();

        let mut conn = self.acquire()?;
        let spec = RequestSpec {
            method,
            path,
            authority: &self.inner.authority,
            headers,
            body,
        };

        match exec::execute(&mut conn, &spec, sink) {
            Ok(head) => {
                let reuse = conn.reusable;
                self.release(conn, reuse);
                Ok(head)
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(error = %e, "request failed");
                self.release(conn, false);
                Err(e)
            }
        }
    }

    /// Check out a connection: reuse a fresh idle one, open a new one
    /// under the cap, or wait until a slot frees up. The connect timeout
    /// bounds the whole acquisition.
    fn acquire(&self) -> Result<Connection> {
        let options = &self.inner.options;
        let connect_timeout = Duration::from_millis(options.connect_timeout_ms.max(1));
        let max_idle = Duration::from_millis(options.max_connection_idle_ms);
        let deadline = Instant::now() + connect_timeout;

        let mut state = lock(&self.inner.state);
        loop {
            while let Some(mut conn) = state.idle.pop_front() {
                if conn.idle_for() > max_idle {
                    conn.mark_closing();
                    state.total -= 1;
                    drop(conn);
                    continue;
                }
                conn.state = ConnState::InUse;
                return Ok(conn);
            }

            if state.total < options.max_connections {
                state.total += 1;
                drop(state);

                let read_timeout = match options.read_timeout_ms {
                    0 => None,
                    ms => Some(Duration::from_millis(ms)),
                };
                let opened = Connection::open(
                    &self.inner.endpoint,
                    self.inner.tls.as_ref(),
                    options.proxy.as_ref(),
                    deadline.saturating_duration_since(Instant::now()),
                    read_timeout,
                );
                return match opened {
                    Ok(conn) => Ok(conn),
                    Err(e) => {
                        lock(&self.inner.state).total -= 1;
                        self.inner.available.notify_one();
                        Err(e)
                    }
                };
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::timeout(
                    "CONNECTION_ACQUIRE_TIMEOUT",
                    format!(
                        "no connection to {} became available within {}ms",
                        self.inner.endpoint, options.connect_timeout_ms
                    ),
                ));
            }

            state = match self.inner.available.wait_timeout(state, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn release(&self, mut conn: Connection, reuse: bool) {
        let mut state = lock(&self.inner.state);
        if reuse && conn.reusable && conn.state == ConnState::InUse {
            conn.mark_idle();
            state.idle.push_back(conn);
        } else {
            conn.mark_closing();
            state.total -= 1;
            drop(conn);
        }
        drop(state);
        self.inner.available.notify_one();
    }

    #[cfg(test)]
    pub(crate) fn shares_state_with(&self, other: &ConnectionPool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct BufferedSink {
    body: Vec<u8>,
    cancel: CancelToken,
}

impl ResponseSink for BufferedSink {
    fn on_head(&mut self, _head: &ResponseHead) -> Result<()> {
        if self.cancel.is_canceled() {
            return Err(canceled_error("buffered request"));
        }
        Ok(())
    }

    fn on_body(&mut self, chunk: Bytes) -> Result<()> {
        if self.cancel.is_canceled() {
            return Err(canceled_error("buffered request"));
        }
        self.body.extend_from_slice(&chunk);
        Ok(())
    }
}

struct ForwardSink {
    exchange: Exchange<ResponseHead, ()>,
}

impl ResponseSink for ForwardSink {
    fn on_head(&mut self, head: &ResponseHead) -> Result<()> {
        if self.exchange.is_canceled() {
            return Err(canceled_error("streaming request"));
        }
        self.exchange.set_head(head.clone());
        Ok(())
    }

    fn on_body(&mut self, chunk: Bytes) -> Result<()> {
        if self.exchange.is_canceled() {
            return Err(canceled_error("streaming request"));
        }
        self.exchange.push_chunk(chunk);
        Ok(())
    }
}

/// Lazily-populated map from endpoint key to pool.
///
/// The mutex is held only across lookup and insert; pool construction
/// (TLS context, validation) happens outside it. Racing creators for the
/// same key all end up with the pool that won the insert.
#[derive(Debug)]
pub struct PoolManager {
    defaults: PoolOptions,
    pools: Mutex<HashMap<Endpoint, ConnectionPool>>,
}

impl PoolManager {
    pub fn new(defaults: PoolOptions) -> Self {
        Self {
            defaults,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// The pool for `endpoint`, created from the stored defaults on first
    /// lookup. Subsequent lookups for an equal endpoint key return the
    /// same pool.
    pub fn pool_for(&self, endpoint: &str) -> Result<ConnectionPool> {
        let key = Endpoint::parse(endpoint)?;

        if let Some(pool) = lock(&self.pools).get(&key) {
            return Ok(pool.clone());
        }

        let pool = ConnectionPool::for_endpoint(key.clone(), self.defaults.clone())?;
        Ok(lock(&self.pools).entry(key).or_insert(pool).clone())
    }
}

impl Default for PoolManager {
    fn default() -> Self {
        Self::new(PoolOptions::default())
    }
}
