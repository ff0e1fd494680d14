//! A high-throughput client stack for object storage over HTTP/1.1.
//!
//! Three cooperating subsystems:
//!
//! - [`http`] — a pooled HTTP/1.1 client with TLS, per-endpoint pooling,
//!   streaming responses, and proxy support;
//! - [`s3`] — an S3 meta-request engine that splits large GETs and PUTs
//!   into parts, transfers them in parallel with per-part retry, and
//!   reads/writes files directly with positional I/O;
//! - [`cbor`] — an RFC 8949 codec over a typed value tree.
//!
//! ## Quick start
//!
//! ```no_run
//! # fn demo() -> Result<(), stevedore::Error> {
//! use stevedore::http::{ConnectionPool, PoolOptions};
//!
//! let pool = ConnectionPool::new("https://example.com", PoolOptions::default())?;
//! let resp = pool.request("GET", "/", &[], None)?;
//! println!("{} {} bytes", resp.status, resp.body.len());
//! # Ok(())
//! # }
//! ```
//!
//! Every blocking entry point parks the calling thread on a condition
//! variable while runtime worker threads drive the sockets; response
//! chunks and progress callbacks are delivered back on the calling
//! thread, serialized per request.

pub mod cbor;
pub mod http;
pub mod s3;

mod bridge;
mod error;
mod runtime;

pub use error::{CodecErrorKind, Error, Result};
pub use runtime::Runtime;
