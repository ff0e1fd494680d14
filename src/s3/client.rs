use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::http::{ChunkSink, Endpoint, PoolManager, PoolOptions};
use crate::s3::checksum::ChecksumAlgorithm;
use crate::s3::credentials::{CredentialsProvider, DynCredentialsProvider};
use crate::s3::meta::{self, GetPlan, GetSink, PutPlan, PutSource, Target};
use crate::s3::sign::aws_percent_encode_path;
use crate::s3::{ChecksumMode, S3Response};

const DEFAULT_PART_SIZE: u64 = 8 * 1024 * 1024;
const MIN_MEMORY_LIMIT: u64 = 1024 * 1024 * 1024;

/// High-throughput S3 client.
///
/// One client owns one pool manager; every operation decomposes into part
/// requests scheduled across those pools. Clients are cheap to clone and
/// safe to share across threads.
///
/// ```no_run
/// # fn demo() -> Result<(), stevedore::Error> {
/// use stevedore::s3::{Credentials, S3Client, StaticProvider};
///
/// let client = S3Client::builder()
///     .region("us-east-1")
///     .credentials(StaticProvider::new(Credentials::new("AKID", "SECRET")?))
///     .build()?;
///
/// let resp = client.get_object("my-bucket", "big/object.bin").send()?;
/// println!("{} bytes", resp.body.map(|b| b.len()).unwrap_or(0));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct S3Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    region: String,
    credentials: DynCredentialsProvider,
    endpoint: Option<Endpoint>,
    part_size: u64,
    multipart_threshold: u64,
    memory_limit: u64,
    concurrency: usize,
    pools: PoolManager,
}

pub struct S3ClientBuilder {
    region: Option<String>,
    credentials: Option<DynCredentialsProvider>,
    endpoint: Option<String>,
    throughput_target_gbps: f64,
    part_size: u64,
    multipart_upload_threshold: Option<u64>,
    memory_limit_in_bytes: Option<u64>,
    max_active_connections_override: Option<usize>,
}

impl S3Client {
    pub fn builder() -> S3ClientBuilder {
        S3ClientBuilder {
            region: None,
            credentials: None,
            endpoint: None,
            throughput_target_gbps: 10.0,
            part_size: DEFAULT_PART_SIZE,
            multipart_upload_threshold: None,
            memory_limit_in_bytes: None,
            max_active_connections_override: None,
        }
    }

    /// Start a GetObject request.
    pub fn get_object(&self, bucket: impl Into<String>, key: impl Into<String>) -> GetObject {
        GetObject {
            client: self.clone(),
            bucket: bucket.into(),
            key: key.into(),
            response_file: None,
            checksum_mode: ChecksumMode::Disabled,
            on_progress: None,
        }
    }

    /// Start a PutObject request.
    pub fn put_object(&self, bucket: impl Into<String>, key: impl Into<String>) -> PutObject {
        PutObject {
            client: self.clone(),
            bucket: bucket.into(),
            key: key.into(),
            body: None,
            content_type: None,
            content_length: None,
            checksum_algorithm: None,
            on_progress: None,
        }
    }

    /// Resolve where requests for `bucket`/`key` go: virtual-hosted style
    /// against the regional endpoint, path style for custom endpoints and
    /// non-DNS-compatible bucket names.
    fn target_for(&self, bucket: &str, key: &str) -> Result<Target> {
        if bucket.is_empty() {
            return Err(Error::argument("bucket must not be empty"));
        }
        if key.is_empty() {
            return Err(Error::argument("key must not be empty"));
        }

        let inner = &self.inner;
        let (endpoint_url, host, canonical_uri) = match &inner.endpoint {
            Some(endpoint) => (
                endpoint.to_string(),
                endpoint.authority(),
                aws_percent_encode_path(&format!("/{bucket}/{key}")),
            ),
            None if is_dns_compatible_bucket(bucket) => {
                let host = format!("{bucket}.s3.{}.amazonaws.com", inner.region);
                (
                    format!("https://{host}"),
                    host,
                    aws_percent_encode_path(&format!("/{key}")),
                )
            }
            None => {
                let host = format!("s3.{}.amazonaws.com", inner.region);
                (
                    format!("https://{host}"),
                    host,
                    aws_percent_encode_path(&format!("/{bucket}/{key}")),
                )
            }
        };

        Ok(Target {
            pool: inner.pools.pool_for(&endpoint_url)?,
            host,
            canonical_uri,
            region: inner.region.clone(),
        })
    }

    fn get_plan(&self, bucket: &str, key: &str, checksum_mode: ChecksumMode) -> Result<GetPlan> {
        Ok(GetPlan {
            target: self.target_for(bucket, key)?,
            credentials: self.inner.credentials.credentials()?,
            part_size: self.inner.part_size,
            concurrency: self.inner.concurrency,
            memory_limit: self.inner.memory_limit,
            validate_checksum: checksum_mode == ChecksumMode::Enabled,
        })
    }
}

impl S3ClientBuilder {
    /// AWS region, e.g. `us-east-1`. Required.
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Credentials provider. Required. A fresh snapshot is resolved per
    /// operation.
    pub fn credentials(mut self, provider: impl CredentialsProvider + 'static) -> Self {
        self.credentials = Some(Arc::new(provider));
        self
    }

    pub fn credentials_provider(mut self, provider: DynCredentialsProvider) -> Self {
        self.credentials = Some(provider);
        self
    }

    /// Custom endpoint (S3-compatible stores, test servers). Requests use
    /// path-style addressing.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Transfer throughput to size the part fan-out for, in gigabits per
    /// second.
    pub fn throughput_target_gbps(mut self, gbps: f64) -> Self {
        self.throughput_target_gbps = gbps;
        self
    }

    pub fn part_size(mut self, bytes: u64) -> Self {
        self.part_size = bytes;
        self
    }

    /// Bodies at or below this size upload with a single PUT. Defaults to
    /// the part size.
    pub fn multipart_upload_threshold(mut self, bytes: u64) -> Self {
        self.multipart_upload_threshold = Some(bytes);
        self
    }

    /// Budget for in-flight part buffers. Must be at least 1 GiB.
    pub fn memory_limit_in_bytes(mut self, bytes: u64) -> Self {
        self.memory_limit_in_bytes = Some(bytes);
        self
    }

    /// Hard cap on concurrent part requests, overriding the throughput
    /// derivation.
    pub fn max_active_connections_override(mut self, connections: usize) -> Self {
        self.max_active_connections_override = Some(connections);
        self
    }

    pub fn build(self) -> Result<S3Client> {
        let region = self
            .region
            .filter(|r| !r.is_empty())
            .ok_or_else(|| Error::argument("region is required"))?;
        let credentials = self
            .credentials
            .ok_or_else(|| Error::argument("a credentials provider is required"))?;

        let endpoint = match self.endpoint {
            Some(raw) => Some(Endpoint::parse(&raw)?),
            None => None,
        };

        if self.part_size == 0 {
            return Err(Error::argument("part_size must be at least 1 byte"));
        }

        let memory_limit = match self.memory_limit_in_bytes {
            Some(limit) if limit < MIN_MEMORY_LIMIT => {
                return Err(Error::argument(
                    "memory_limit_in_bytes must be at least 1 GiB",
                ));
            }
            Some(limit) => limit,
            None => MIN_MEMORY_LIMIT,
        };

        let concurrency = match self.max_active_connections_override {
            Some(connections) if connections == 0 => {
                return Err(Error::argument(
                    "max_active_connections_override must be at least 1",
                ));
            }
            Some(connections) => connections,
            None => derived_concurrency(self.throughput_target_gbps),
        };

        let pools = PoolManager::new(PoolOptions {
            max_connections: concurrency,
            ..PoolOptions::default()
        });

        Ok(S3Client {
            inner: Arc::new(ClientInner {
                multipart_threshold: self.multipart_upload_threshold.unwrap_or(self.part_size),
                part_size: self.part_size,
                region,
                credentials,
                endpoint,
                memory_limit,
                concurrency,
                pools,
            }),
        })
    }
}

/// Rough CRT-style sizing: a connection is worth ~0.4 Gbps against S3, so
/// widen the fan-out with the throughput target.
fn derived_concurrency(throughput_target_gbps: f64) -> usize {
    let conns = (throughput_target_gbps * 2.5).ceil();
    if conns.is_nan() || conns < 4.0 {
        4
    } else if conns > 64.0 {
        64
    } else {
        conns as usize
    }
}

fn is_dns_compatible_bucket(bucket: &str) -> bool {
    let bytes = bucket.as_bytes();
    if bytes.len() < 3 || bytes.len() > 63 {
        return false;
    }

    let is_allowed = |b: u8| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'-');
    if !bytes.iter().all(|&b| is_allowed(b)) {
        return false;
    }

    let edge_ok = |b: u8| matches!(b, b'a'..=b'z' | b'0'..=b'9');
    if !edge_ok(bytes[0]) || !edge_ok(bytes[bytes.len() - 1]) {
        return false;
    }

    bucket.parse::<IpAddr>().is_err()
}

/// Builder for a GetObject meta-request.
pub struct GetObject {
    client: S3Client,
    bucket: String,
    key: String,
    response_file: Option<PathBuf>,
    checksum_mode: ChecksumMode,
    on_progress: Option<Box<dyn FnMut(u64)>>,
}

impl GetObject {
    /// Write the object straight to `path` with positional writes instead
    /// of buffering it.
    pub fn response_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.response_file = Some(path.into());
        self
    }

    /// Validate the stored object checksum while data streams through.
    pub fn checksum_mode(mut self, mode: ChecksumMode) -> Self {
        self.checksum_mode = mode;
        self
    }

    /// Observe cumulative transferred bytes; invoked on the calling
    /// thread, at least once per completed part.
    pub fn on_progress(mut self, callback: impl FnMut(u64) + 'static) -> Self {
        self.on_progress = Some(Box::new(callback));
        self
    }

    /// Fetch the object. The body is buffered unless a response file was
    /// configured.
    pub fn send(mut self) -> Result<S3Response> {
        let plan = self
            .client
            .get_plan(&self.bucket, &self.key, self.checksum_mode)?;
        let sink = match self.response_file.take() {
            Some(path) => GetSink::File(path),
            None => GetSink::Buffered,
        };
        meta::get_object(plan, sink, progress_box(&mut self.on_progress))
    }

    /// Fetch the object, delivering the body to `sink` in byte order.
    pub fn send_to(mut self, sink: &mut dyn ChunkSink) -> Result<S3Response> {
        if self.response_file.is_some() {
            return Err(Error::argument(
                "response_file and a chunk sink are mutually exclusive",
            ));
        }
        let plan = self
            .client
            .get_plan(&self.bucket, &self.key, self.checksum_mode)?;
        meta::get_object(plan, GetSink::Chunks(sink), progress_box(&mut self.on_progress))
    }
}

/// Builder for a PutObject meta-request.
pub struct PutObject {
    client: S3Client,
    bucket: String,
    key: String,
    body: Option<PutSource>,
    content_type: Option<String>,
    content_length: Option<u64>,
    checksum_algorithm: Option<String>,
    on_progress: Option<Box<dyn FnMut(u64)>>,
}

impl PutObject {
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(PutSource::Bytes(body.into()));
        self
    }

    /// Upload from a file with positional reads; parts never stage
    /// through an intermediate buffer of the whole object.
    pub fn body_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.body = Some(PutSource::File(path.into()));
        self
    }

    pub fn content_type(mut self, value: impl Into<String>) -> Self {
        self.content_type = Some(value.into());
        self
    }

    /// Override the body length (useful when the file is still being
    /// written up to a known size).
    pub fn content_length(mut self, len: u64) -> Self {
        self.content_length = Some(len);
        self
    }

    /// Full-object checksum algorithm: `CRC32`, `CRC32C`, `SHA1`, or
    /// `SHA256`. Anything else fails before network I/O.
    pub fn checksum_algorithm(mut self, name: impl Into<String>) -> Self {
        self.checksum_algorithm = Some(name.into());
        self
    }

    pub fn on_progress(mut self, callback: impl FnMut(u64) + 'static) -> Self {
        self.on_progress = Some(Box::new(callback));
        self
    }

    pub fn send(mut self) -> Result<S3Response> {
        // Validated before credentials resolution or any connection work.
        let checksum = self
            .checksum_algorithm
            .as_deref()
            .map(ChecksumAlgorithm::parse)
            .transpose()?;

        let body = self
            .body
            .take()
            .ok_or_else(|| Error::argument("put_object requires a body"))?;

        let inner = &self.client.inner;
        let plan = PutPlan {
            target: self.client.target_for(&self.bucket, &self.key)?,
            credentials: inner.credentials.credentials()?,
            part_size: inner.part_size,
            multipart_threshold: inner.multipart_threshold,
            concurrency: inner.concurrency,
            memory_limit: inner.memory_limit,
            content_type: self.content_type.clone(),
            checksum,
        };

        meta::put_object(
            plan,
            body,
            self.content_length,
            progress_box(&mut self.on_progress),
        )
    }
}

fn progress_box<'a>(
    slot: &'a mut Option<Box<dyn FnMut(u64)>>,
) -> Option<Box<dyn FnMut(u64) + 'a>> {
    slot.as_mut()
        .map(|cb| Box::new(move |n| cb(n)) as Box<dyn FnMut(u64) + 'a>)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::s3::credentials::{Credentials, StaticProvider};

    fn test_client() -> S3Client {
        S3Client::builder()
            .region("us-east-1")
            .credentials(StaticProvider::new(
                Credentials::new("AKID", "SECRET").unwrap(),
            ))
            .build()
            .unwrap()
    }

    #[test]
    fn builder_requires_region_and_credentials() {
        let err = S3Client::builder().build().unwrap_err();
        assert!(matches!(err, Error::Argument { .. }));

        let err = S3Client::builder().region("us-east-1").build().unwrap_err();
        assert!(matches!(err, Error::Argument { .. }));
    }

    #[test]
    fn memory_limit_must_be_at_least_one_gib() {
        let err = S3Client::builder()
            .region("us-east-1")
            .credentials(StaticProvider::new(
                Credentials::new("AKID", "SECRET").unwrap(),
            ))
            .memory_limit_in_bytes(512 * 1024 * 1024)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Argument { .. }));
    }

    #[test]
    fn dns_compatible_buckets_use_virtual_hosted_style() {
        let client = test_client();

        let target = client.target_for("my-bucket", "path/to/key.txt").unwrap();
        assert_eq!(target.host, "my-bucket.s3.us-east-1.amazonaws.com");
        assert_eq!(target.canonical_uri, "/path/to/key.txt");

        let target = client.target_for("Bad_Bucket", "key").unwrap();
        assert_eq!(target.host, "s3.us-east-1.amazonaws.com");
        assert_eq!(target.canonical_uri, "/Bad_Bucket/key");
    }

    #[test]
    fn custom_endpoints_use_path_style() {
        let client = S3Client::builder()
            .region("us-east-1")
            .credentials(StaticProvider::new(
                Credentials::new("AKID", "SECRET").unwrap(),
            ))
            .endpoint("http://127.0.0.1:9000")
            .build()
            .unwrap();

        let target = client.target_for("bucket", "a+b.txt").unwrap();
        assert_eq!(target.host, "127.0.0.1:9000");
        assert_eq!(target.canonical_uri, "/bucket/a%2Bb.txt");
    }

    #[test]
    fn empty_bucket_or_key_is_rejected() {
        let client = test_client();
        assert!(client.target_for("", "key").is_err());
        assert!(client.target_for("bucket", "").is_err());
    }

    #[test]
    fn invalid_checksum_algorithm_fails_before_any_io() {
        // An unroutable endpoint: reaching the network would hang or
        // error with a transport failure, not an argument error.
        let client = S3Client::builder()
            .region("us-east-1")
            .credentials(StaticProvider::new(
                Credentials::new("AKID", "SECRET").unwrap(),
            ))
            .endpoint("http://192.0.2.1:1")
            .build()
            .unwrap();

        let err = client
            .put_object("bucket", "key")
            .body_bytes(&b"data"[..])
            .checksum_algorithm("CRC64NVME")
            .send()
            .unwrap_err();
        assert!(matches!(err, Error::Argument { .. }), "{err}");
    }

    #[test]
    fn concurrency_scales_with_throughput_target() {
        assert_eq!(derived_concurrency(0.5), 4);
        assert_eq!(derived_concurrency(10.0), 25);
        assert_eq!(derived_concurrency(100.0), 64);
    }
}
