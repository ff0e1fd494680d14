//! Process-global runtime shared by every pool and S3 client.
//!
//! The runtime owns the worker threads that drive socket I/O and part-level
//! parallelism, plus a small DNS cache. It is initialized lazily on first
//! use and never torn down: the worker threads are daemon-like and the OS
//! reclaims them at process exit. Explicit teardown would have to wait for
//! every outstanding pool handle, which callers may hold arbitrarily long.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs as _};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex, OnceLock, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Shared worker pool and DNS resolver.
///
/// `Runtime::acquire()` is safe to call from any thread; concurrent first
/// callers all observe the same fully-initialized instance.
pub struct Runtime {
    queue: Sender<Job>,
    worker_count: usize,
    resolver: Resolver,
}

impl Runtime {
    /// Returns the singleton runtime, initializing it on first call.
    pub fn acquire() -> &'static Runtime {
        RUNTIME.get_or_init(Self::init)
    }

    fn init() -> Runtime {
        let worker_count = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .max(2);

        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));

        for i in 0..worker_count {
            let rx = Arc::clone(&rx);
            let _ = thread::Builder::new()
                .name(format!("stevedore-io-{i}"))
                .spawn(move || worker_loop(&rx));
        }

        Runtime {
            queue: tx,
            worker_count,
            resolver: Resolver::new(),
        }
    }

    /// Number of I/O worker threads.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Dispatch a job onto the worker pool.
    ///
    /// Jobs must not themselves park waiting for other jobs; the pool is
    /// fixed-size and nested waits can exhaust it. Blocking on sockets is
    /// fine, that is what the workers are for.
    pub(crate) fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        // Send only fails if every worker has exited, which cannot happen
        // while the runtime is alive.
        let _ = self.queue.send(Box::new(job));
    }

    pub(crate) fn resolver(&self) -> &Resolver {
        &self.resolver
    }
}

fn worker_loop(rx: &Mutex<Receiver<Job>>) {
    loop {
        let job = match rx.lock() {
            Ok(guard) => guard.recv(),
            Err(_) => return,
        };
        match job {
            Ok(job) => job(),
            Err(_) => return,
        }
    }
}

const DNS_CACHE_TTL: Duration = Duration::from_secs(60);

/// Blocking DNS resolver with a positive cache.
pub(crate) struct Resolver {
    cache: Mutex<HashMap<(String, u16), (Instant, Vec<SocketAddr>)>>,
}

impl Resolver {
    fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        let key = (host.to_string(), port);

        if let Ok(cache) = self.cache.lock()
            && let Some((at, addrs)) = cache.get(&key)
            && at.elapsed() < DNS_CACHE_TTL
        {
            return Ok(addrs.clone());
        }

        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::Connection {
                symbol: "DNS_QUERY_FAILED",
                message: format!("failed to resolve {host}:{port}: {e}"),
                source: Some(Box::new(e)),
            })?
            .collect();

        if addrs.is_empty() {
            return Err(Error::connection(
                "DNS_NO_ADDRESSES",
                format!("no addresses for {host}:{port}"),
            ));
        }

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, (Instant::now(), addrs.clone()));
        }

        Ok(addrs)
    }
}
