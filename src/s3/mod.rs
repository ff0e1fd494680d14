//! S3 meta-request engine: multipart GET/PUT with parallel part
//! transfers, per-part retry, and direct file I/O.

mod checksum;
mod client;
mod credentials;
mod meta;
mod sign;
mod xml;

pub use checksum::ChecksumAlgorithm;
pub use client::{GetObject, PutObject, S3Client, S3ClientBuilder};
pub use credentials::{
    Credentials, CredentialsProvider, DynCredentialsProvider, EnvProvider, StaticProvider,
};
pub use xml::{ErrorDocument, parse_error_document};

use bytes::Bytes;

use crate::http::headers::find_header;

/// Whether a GetObject validates the object's stored checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumMode {
    #[default]
    Disabled,
    Enabled,
}

/// The outcome of an S3 meta-request.
#[derive(Debug)]
pub struct S3Response {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    /// Buffered body, when the operation produces one and no file target
    /// or chunk sink consumed it.
    pub body: Option<Bytes>,
    /// Name of the checksum algorithm that was validated against the
    /// stored object checksum, when validation ran.
    pub checksum_validated: Option<String>,
}

impl S3Response {
    pub fn successful(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// First value for `name`, comparing case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}
