//! The meta-request engine.
//!
//! An S3-level GET or PUT decomposes into one or more HTTP requests
//! (parts). The calling thread is the coordinator: it dispatches part jobs
//! onto runtime workers, parks on a condition variable while they run, and
//! performs every sink/progress callback itself so callbacks are serialized
//! per request. Workers never call back into caller code.
//!
//! Ordering: GET parts may complete in any order, but emission to the sink
//! is strictly by part index; out-of-order completions wait in a reorder
//! map bounded by the memory limit. Part buffers draw from that limit, and
//! dispatch of new parts defers while the outstanding total would exceed
//! it.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use time::OffsetDateTime;

use crate::bridge::{CancelOnDrop, CancelToken, Exchange, canceled_error};
use crate::error::{Error, Result};
use crate::http::ChunkSink;
use crate::http::ConnectionPool;
use crate::http::exec::{ResponseHead, ResponseSink};
use crate::http::headers::find_header;
use crate::runtime::Runtime;
use crate::s3::S3Response;
use crate::s3::checksum::{ChecksumAlgorithm, StreamingChecksum};
use crate::s3::credentials::Credentials;
use crate::s3::sign;
use crate::s3::xml::{self, CompletedPart};

const MAX_ATTEMPTS: u32 = 3;
const BASE_RETRY_DELAY: Duration = Duration::from_millis(200);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Exponential backoff with full jitter, capped at `MAX_RETRY_DELAY`.
fn backoff_delay(attempt: u32) -> Duration {
    let attempt = attempt.saturating_sub(1);
    let factor = 1u32 << attempt.min(16);
    let millis = BASE_RETRY_DELAY
        .as_millis()
        .saturating_mul(u128::from(factor))
        .min(MAX_RETRY_DELAY.as_millis());

    if millis <= 1 {
        return Duration::from_millis(millis as u64);
    }
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| u128::from(d.subsec_nanos()))
        .unwrap_or(0);
    Duration::from_millis((nanos % millis) as u64)
}

/// Where one S3 operation sends its HTTP requests.
#[derive(Clone)]
pub(crate) struct Target {
    pub pool: ConnectionPool,
    /// `Host` header value.
    pub host: String,
    /// SigV4-encoded object path.
    pub canonical_uri: String,
    pub region: String,
}

impl Target {
    fn wire_path(&self, canonical_query: &str) -> String {
        if canonical_query.is_empty() {
            self.canonical_uri.clone()
        } else {
            format!("{}?{}", self.canonical_uri, canonical_query)
        }
    }
}

fn service_error(head: ResponseHead, body: Vec<u8>) -> Error {
    let status =
        StatusCode::from_u16(head.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    Error::service(status, head.headers, Bytes::from(body))
}

fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

// ---------------------------------------------------------------------------
// Single blocking request (control-plane calls and simple PUT/GET)
// ---------------------------------------------------------------------------

struct CollectSink {
    cancel: CancelToken,
    body: Vec<u8>,
}

impl ResponseSink for CollectSink {
    fn on_head(&mut self, _head: &ResponseHead) -> Result<()> {
        if self.cancel.is_canceled() {
            return Err(canceled_error("s3 request"));
        }
        Ok(())
    }

    fn on_body(&mut self, chunk: Bytes) -> Result<()> {
        if self.cancel.is_canceled() {
            return Err(canceled_error("s3 request"));
        }
        self.body.extend_from_slice(&chunk);
        Ok(())
    }
}

/// One signed request with bounded retries, executed inline on the current
/// (worker) thread. Returns the head and the buffered body.
fn perform_signed(
    target: &Target,
    cancel: &CancelToken,
    method: &str,
    query_params: &[(String, String)],
    extra_headers: &[(String, String)],
    body: Option<&[u8]>,
    credentials: &Credentials,
) -> Result<(ResponseHead, Vec<u8>)> {
    let canonical_query = sign::canonical_query_string(query_params);
    let path = target.wire_path(&canonical_query);
    let payload_hash = match body {
        Some(b) => sign::payload_hash(b),
        None => sign::payload_hash_empty(),
    };

    let mut attempt = 0;
    loop {
        attempt += 1;
        if cancel.is_canceled() {
            return Err(canceled_error("s3 request"));
        }

        let mut headers = extra_headers.to_vec();
        sign::sign_request(
            method,
            &target.canonical_uri,
            &canonical_query,
            &target.host,
            &mut headers,
            &payload_hash,
            &target.region,
            credentials,
            now(),
        )?;

        let mut sink = CollectSink {
            cancel: cancel.clone(),
            body: Vec::new(),
        };

        let outcome = target
            .pool
            .perform(method, &path, &headers, body, &mut sink)
            .and_then(|head| {
                if head.status >= 400 {
                    Err(service_error(head, std::mem::take(&mut sink.body)))
                } else {
                    Ok((head, std::mem::take(&mut sink.body)))
                }
            });

        match outcome {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS && !cancel.is_canceled() => {
                #[cfg(feature = "tracing")]
                tracing::debug!(error = %e, attempt, "retrying s3 request");
                std::thread::sleep(backoff_delay(attempt));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Run `perform_signed` on a runtime worker while the caller parks.
fn blocking_signed(
    target: &Target,
    method: &'static str,
    query_params: Vec<(String, String)>,
    extra_headers: Vec<(String, String)>,
    body: Option<Bytes>,
    credentials: &Credentials,
) -> Result<(ResponseHead, Vec<u8>)> {
    let exchange: Exchange<(), (ResponseHead, Vec<u8>)> = Exchange::new();
    let mut guard = CancelOnDrop::new(exchange.cancel_token());

    let worker_side = exchange.clone();
    let target = target.clone();
    let credentials = credentials.clone();
    Runtime::acquire().spawn(move || {
        let cancel = worker_side.cancel_token();
        let outcome = perform_signed(
            &target,
            &cancel,
            method,
            &query_params,
            &extra_headers,
            body.as_deref(),
            &credentials,
        );
        worker_side.finish(outcome);
    });

    let outcome = exchange.wait();
    guard.disarm();
    outcome
}

// ---------------------------------------------------------------------------
// GetObject
// ---------------------------------------------------------------------------

pub(crate) struct GetPlan {
    pub target: Target,
    pub credentials: Credentials,
    pub part_size: u64,
    pub concurrency: usize,
    pub memory_limit: u64,
    pub validate_checksum: bool,
}

pub(crate) enum GetSink<'a> {
    Buffered,
    Chunks(&'a mut dyn ChunkSink),
    File(PathBuf),
}

struct GetPartResult {
    head: ResponseHead,
    /// Present unless the part went straight to the file and no checksum
    /// is being computed.
    payload: Option<Bytes>,
    len: u64,
}

struct GetState {
    completed: BTreeMap<u64, GetPartResult>,
    in_flight: usize,
    /// Bytes held in the reorder map awaiting in-order emission.
    buffered_bytes: u64,
    bytes_transferred: u64,
    failure: Option<Error>,
}

struct GetShared {
    state: Mutex<GetState>,
    cond: Condvar,
    cancel: CancelToken,
}

impl GetShared {
    fn lock(&self) -> MutexGuard<'_, GetState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

struct GetPartJob {
    shared: Arc<GetShared>,
    target: Target,
    credentials: Credentials,
    index: u64,
    offset: u64,
    len: u64,
    file: Option<Arc<File>>,
    keep_payload: bool,
    /// Discovery only: a 416 means the object is empty, so fall back to
    /// an unranged GET.
    unranged_fallback: bool,
}

pub(crate) fn get_object(
    plan: GetPlan,
    mut sink: GetSink<'_>,
    mut on_progress: Option<Box<dyn FnMut(u64) + '_>>,
) -> Result<S3Response> {
    let part_size = plan.part_size.max(1);
    let memory_limit = plan.memory_limit.max(part_size * 2);
    let concurrency = plan.concurrency.max(1);

    let file = match &sink {
        GetSink::File(path) => {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .map_err(|e| Error::from_io("open response_target", e))?;
            Some(Arc::new(file))
        }
        _ => None,
    };
    // File parts are written positionally on completion; the payload is
    // retained only when it must flow through the ordered checksum path.
    let keep_payload = file.is_none() || plan.validate_checksum;

    let shared = Arc::new(GetShared {
        state: Mutex::new(GetState {
            completed: BTreeMap::new(),
            in_flight: 1,
            buffered_bytes: 0,
            bytes_transferred: 0,
            failure: None,
        }),
        cond: Condvar::new(),
        cancel: CancelToken::new(),
    });
    let mut cancel_guard = CancelOnDrop::new(shared.cancel.clone());

    // Discovery: a ranged GET for part 0 doubles as the size probe. Its
    // in-flight slot is pre-counted in the initial state above.
    dispatch_get_part(GetPartJob {
        shared: Arc::clone(&shared),
        target: plan.target.clone(),
        credentials: plan.credentials.clone(),
        index: 0,
        offset: 0,
        len: part_size,
        file: file.clone(),
        keep_payload,
        unranged_fallback: true,
    });

    {
        let mut state = shared.lock();
        while !state.completed.contains_key(&0) && state.failure.is_none() {
            state = wait(&shared.cond, state);
        }
        if let Some(err) = state.failure.take() {
            return Err(err);
        }
    }

    let head0 = shared.lock().completed[&0].head.clone();
    let (total_len, num_parts) = match head0.status {
        206 => {
            let total = parse_content_range_total(&head0.headers)?;
            (total, total.div_ceil(part_size).max(1))
        }
        // The server ignored the range (or the object was empty): the
        // whole body arrived with part 0.
        _ => (shared.lock().completed[&0].len, 1),
    };

    let mut validator = if plan.validate_checksum {
        stored_checksum(&head0.headers)
            .map(|(algorithm, value)| (algorithm, value, StreamingChecksum::new(algorithm)))
    } else {
        None
    };

    let mut body = match sink {
        GetSink::Buffered => Vec::with_capacity(usize::try_from(total_len).unwrap_or(0)),
        _ => Vec::new(),
    };

    let mut next_dispatch: u64 = 1;
    let mut next_emit: u64 = 0;
    let mut emitted_parts: u64 = 0;
    let mut last_progress: u64 = 0;
    let mut sink_failure: Option<Error> = None;

    loop {
        let mut ready: Vec<GetPartResult> = Vec::new();
        let progress_snapshot;
        let engine_failure;
        let halted;
        {
            let mut state = shared.lock();

            while next_dispatch < num_parts
                && state.in_flight < concurrency
                && state.failure.is_none()
                && sink_failure.is_none()
                && outstanding_bytes(&state, part_size) + part_size <= memory_limit
            {
                let offset = next_dispatch * part_size;
                let len = part_size.min(total_len - offset);
                state.in_flight += 1;
                dispatch_get_part(GetPartJob {
                    shared: Arc::clone(&shared),
                    target: plan.target.clone(),
                    credentials: plan.credentials.clone(),
                    index: next_dispatch,
                    offset,
                    len,
                    file: file.clone(),
                    keep_payload,
                    unranged_fallback: false,
                });
                next_dispatch += 1;
            }

            while let Some(part) = state.completed.remove(&next_emit) {
                if let Some(payload) = &part.payload {
                    state.buffered_bytes = state.buffered_bytes.saturating_sub(payload.len() as u64);
                }
                ready.push(part);
                next_emit += 1;
            }

            progress_snapshot = state.bytes_transferred;
            engine_failure = if state.in_flight == 0 {
                state.failure.take()
            } else {
                None
            };

            // A sink failure stops dispatch, so undelivered parts may
            // never arrive; stop once everything in flight has drained.
            halted = sink_failure.is_some() && state.in_flight == 0;

            let finished = emitted_parts + ready.len() as u64 >= num_parts;
            if ready.is_empty() && !finished && engine_failure.is_none() && !halted {
                let _unused = wait(&shared.cond, state);
                continue;
            }
        }

        // Callbacks run here, on the caller thread, outside the lock.
        for part in ready {
            emitted_parts += 1;
            let Some(payload) = part.payload else { continue };
            if let Some((_, _, hasher)) = validator.as_mut() {
                hasher.update(&payload);
            }
            if sink_failure.is_some() {
                continue;
            }
            match &mut sink {
                GetSink::Buffered => body.extend_from_slice(&payload),
                GetSink::Chunks(chunk_sink) => {
                    if let Err(e) = chunk_sink.on_chunk(&payload) {
                        shared.cancel.cancel();
                        sink_failure = Some(e);
                    }
                }
                GetSink::File(_) => {}
            }
        }

        if progress_snapshot > last_progress {
            last_progress = progress_snapshot;
            if let Some(cb) = on_progress.as_mut() {
                cb(progress_snapshot);
            }
        }

        if let Some(err) = engine_failure {
            // A sink failure triggered cancellation; report the sink's own
            // error rather than the induced cancellations.
            return Err(sink_failure.unwrap_or(err));
        }
        if halted {
            break;
        }
        if emitted_parts >= num_parts {
            break;
        }
    }

    cancel_guard.disarm();
    if let Some(err) = sink_failure {
        return Err(err);
    }

    let checksum_validated = match validator {
        Some((algorithm, stored, hasher)) => {
            let computed = hasher.finalize();
            if computed != stored {
                return Err(Error::connection(
                    "RESPONSE_CHECKSUM_MISMATCH",
                    format!(
                        "{algorithm} checksum mismatch: stored {stored}, computed {computed}"
                    ),
                ));
            }
            Some(algorithm.as_str().to_string())
        }
        None => None,
    };

    if let Some(file) = &file {
        file.sync_all()
            .map_err(|e| Error::from_io("flush response_target", e))?;
    }

    Ok(S3Response {
        status_code: head0.status,
        headers: head0.headers,
        body: matches!(sink, GetSink::Buffered).then(|| Bytes::from(body)),
        checksum_validated,
    })
}

fn outstanding_bytes(state: &GetState, part_size: u64) -> u64 {
    state.buffered_bytes + state.in_flight as u64 * part_size
}

fn wait<'m>(
    cond: &Condvar,
    guard: MutexGuard<'m, GetState>,
) -> MutexGuard<'m, GetState> {
    match cond.wait(guard) {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn dispatch_get_part(job: GetPartJob) {
    Runtime::acquire().spawn(move || {
        let shared = Arc::clone(&job.shared);
        let outcome = fetch_part(&job);

        let mut state = shared.lock();
        match outcome {
            Ok(part) => {
                state.bytes_transferred += part.len;
                if let Some(payload) = &part.payload {
                    state.buffered_bytes += payload.len() as u64;
                }
                state.completed.insert(job.index, part);
            }
            Err(e) => {
                if state.failure.is_none() {
                    state.failure = Some(e);
                }
                shared.cancel.cancel();
            }
        }
        state.in_flight -= 1;
        drop(state);
        shared.cond.notify_all();
    });
}

/// Sink for one ranged GET: success bodies stream to the file and/or the
/// payload buffer, error bodies are captured for the service error.
struct GetPartSink {
    cancel: CancelToken,
    file: Option<Arc<File>>,
    offset: u64,
    written: u64,
    payload: Option<Vec<u8>>,
    status: u16,
    error_body: Vec<u8>,
}

impl ResponseSink for GetPartSink {
    fn on_head(&mut self, head: &ResponseHead) -> Result<()> {
        if self.cancel.is_canceled() {
            return Err(canceled_error("get part"));
        }
        self.status = head.status;
        Ok(())
    }

    fn on_body(&mut self, chunk: Bytes) -> Result<()> {
        if self.cancel.is_canceled() {
            return Err(canceled_error("get part"));
        }
        if self.status >= 300 {
            self.error_body.extend_from_slice(&chunk);
            return Ok(());
        }

        if let Some(file) = &self.file {
            write_at(file, self.offset + self.written, &chunk)?;
        }
        if let Some(payload) = &mut self.payload {
            payload.extend_from_slice(&chunk);
        }
        self.written += chunk.len() as u64;
        Ok(())
    }
}

fn fetch_part(job: &GetPartJob) -> Result<GetPartResult> {
    let mut ranged = true;
    let mut attempt = 0;
    loop {
        attempt += 1;
        if job.shared.cancel.is_canceled() {
            return Err(canceled_error("get part"));
        }

        let mut headers: Vec<(String, String)> = Vec::with_capacity(4);
        if ranged {
            headers.push((
                "Range".to_string(),
                format!("bytes={}-{}", job.offset, job.offset + job.len - 1),
            ));
        }
        sign::sign_request(
            "GET",
            &job.target.canonical_uri,
            "",
            &job.target.host,
            &mut headers,
            &sign::payload_hash_empty(),
            &job.target.region,
            &job.credentials,
            now(),
        )?;

        let mut sink = GetPartSink {
            cancel: job.shared.cancel.clone(),
            file: job.file.clone(),
            offset: job.offset,
            written: 0,
            payload: job.keep_payload.then(Vec::new),
            status: 0,
            error_body: Vec::new(),
        };

        let outcome = job.target.pool.perform(
            "GET",
            &job.target.canonical_uri,
            &headers,
            None,
            &mut sink,
        );

        match outcome {
            Ok(head) if head.status == 200 || head.status == 206 => {
                return Ok(GetPartResult {
                    head,
                    payload: sink.payload.map(Bytes::from),
                    len: sink.written,
                });
            }
            Ok(head) if head.status == 416 && job.unranged_fallback && ranged => {
                // Empty object: byte range 0- is unsatisfiable. Re-issue
                // without a Range header.
                ranged = false;
            }
            Ok(head) => {
                let err = service_error(head, std::mem::take(&mut sink.error_body));
                if err.is_retryable() && attempt < MAX_ATTEMPTS {
                    std::thread::sleep(backoff_delay(attempt));
                    continue;
                }
                return Err(err);
            }
            Err(e) if e.is_retryable()
                && attempt < MAX_ATTEMPTS
                && !job.shared.cancel.is_canceled() =>
            {
                std::thread::sleep(backoff_delay(attempt));
            }
            Err(e) => return Err(e),
        }
    }
}

fn parse_content_range_total(headers: &[(String, String)]) -> Result<u64> {
    let raw = find_header(headers, "Content-Range").ok_or_else(|| {
        Error::connection(
            "S3_PROTOCOL_ERROR",
            "206 response without a Content-Range header",
        )
    })?;

    // Format: "bytes <start>-<end>/<total>".
    raw.rsplit_once('/')
        .and_then(|(_, total)| total.trim().parse::<u64>().ok())
        .ok_or_else(|| {
            Error::connection(
                "S3_PROTOCOL_ERROR",
                format!("unparseable Content-Range '{raw}'"),
            )
        })
}

/// Find a stored full-object checksum in the response headers. Composite
/// values (`...-N`, from multipart uploads) cannot be validated against a
/// whole-object hash and are skipped.
fn stored_checksum(headers: &[(String, String)]) -> Option<(ChecksumAlgorithm, String)> {
    for algorithm in ChecksumAlgorithm::all() {
        if let Some(value) = find_header(headers, algorithm.header_name()) {
            if value.contains('-') {
                return None;
            }
            return Some((algorithm, value.to_string()));
        }
    }
    None
}

#[cfg(unix)]
fn write_at(file: &File, offset: u64, data: &[u8]) -> Result<()> {
    use std::os::unix::fs::FileExt as _;
    file.write_all_at(data, offset)
        .map_err(|e| Error::from_io("write response_target", e))
}

#[cfg(windows)]
fn write_at(file: &File, offset: u64, data: &[u8]) -> Result<()> {
    use std::os::windows::fs::FileExt as _;
    let mut written = 0usize;
    while written < data.len() {
        let n = file
            .seek_write(&data[written..], offset + written as u64)
            .map_err(|e| Error::from_io("write response_target", e))?;
        written += n;
    }
    Ok(())
}

#[cfg(unix)]
fn read_exact_at(file: &File, offset: u64, buf: &mut [u8]) -> Result<()> {
    use std::os::unix::fs::FileExt as _;
    file.read_exact_at(buf, offset)
        .map_err(|e| Error::from_io("read upload body", e))
}

#[cfg(windows)]
fn read_exact_at(file: &File, offset: u64, buf: &mut [u8]) -> Result<()> {
    let mut read = 0usize;
    while read < buf.len() {
        use std::os::windows::fs::FileExt as _;
        let n = file
            .seek_read(&mut buf[read..], offset + read as u64)
            .map_err(|e| Error::from_io("read upload body", e))?;
        if n == 0 {
            return Err(Error::from_io(
                "read upload body",
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "file truncated"),
            ));
        }
        read += n;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// PutObject
// ---------------------------------------------------------------------------

pub(crate) struct PutPlan {
    pub target: Target,
    pub credentials: Credentials,
    pub part_size: u64,
    pub multipart_threshold: u64,
    pub concurrency: usize,
    pub memory_limit: u64,
    pub content_type: Option<String>,
    pub checksum: Option<ChecksumAlgorithm>,
}

pub(crate) enum PutSource {
    Bytes(Bytes),
    File(PathBuf),
}

#[derive(Clone)]
enum PutBody {
    Bytes(Bytes),
    File { file: Arc<File>, len: u64 },
}

impl PutBody {
    fn open(source: PutSource, content_length: Option<u64>) -> Result<PutBody> {
        match source {
            PutSource::Bytes(bytes) => Ok(PutBody::Bytes(bytes)),
            PutSource::File(path) => {
                let file = File::open(&path)
                    .map_err(|e| Error::from_io("open upload body", e))?;
                let len = match content_length {
                    Some(len) => len,
                    None => file
                        .metadata()
                        .map_err(|e| Error::from_io("stat upload body", e))?
                        .len(),
                };
                Ok(PutBody::File {
                    file: Arc::new(file),
                    len,
                })
            }
        }
    }

    fn len(&self) -> u64 {
        match self {
            Self::Bytes(b) => b.len() as u64,
            Self::File { len, .. } => *len,
        }
    }

    /// Positional read of one part, no staging through a shared buffer.
    fn read_range(&self, offset: u64, len: u64) -> Result<Bytes> {
        match self {
            Self::Bytes(b) => {
                let start = offset as usize;
                let end = start + len as usize;
                Ok(b.slice(start..end))
            }
            Self::File { file, .. } => {
                let mut buf = vec![0u8; len as usize];
                read_exact_at(file, offset, &mut buf)?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

pub(crate) fn put_object(
    plan: PutPlan,
    source: PutSource,
    content_length: Option<u64>,
    mut on_progress: Option<Box<dyn FnMut(u64) + '_>>,
) -> Result<S3Response> {
    let body = PutBody::open(source, content_length)?;
    let total_len = body.len();

    if total_len <= plan.multipart_threshold.max(plan.part_size) {
        return put_single(&plan, &body, total_len, on_progress.as_deref_mut());
    }
    put_multipart(&plan, body, total_len, on_progress)
}

fn base_put_headers(plan: &PutPlan) -> Vec<(String, String)> {
    let mut headers = Vec::new();
    if let Some(content_type) = &plan.content_type {
        headers.push(("Content-Type".to_string(), content_type.clone()));
    }
    headers
}

fn put_single(
    plan: &PutPlan,
    body: &PutBody,
    total_len: u64,
    mut on_progress: Option<&mut (dyn FnMut(u64) + '_)>,
) -> Result<S3Response> {
    let payload = body.read_range(0, total_len)?;

    let mut headers = base_put_headers(plan);
    if let Some(algorithm) = plan.checksum {
        headers.push((
            algorithm.header_name().to_string(),
            crate::s3::checksum::compute(algorithm, &payload),
        ));
    }

    let (head, _body) = blocking_signed(
        &plan.target,
        "PUT",
        Vec::new(),
        headers,
        Some(payload),
        &plan.credentials,
    )?;

    if let Some(cb) = on_progress.as_mut() {
        cb(total_len);
    }

    Ok(S3Response {
        status_code: head.status,
        headers: head.headers,
        body: None,
        checksum_validated: None,
    })
}

struct PutState {
    /// Part number → (ETag, optional part checksum).
    completed: BTreeMap<u32, (String, Option<String>)>,
    in_flight: usize,
    bytes_transferred: u64,
    failure: Option<Error>,
}

struct PutShared {
    state: Mutex<PutState>,
    cond: Condvar,
    cancel: CancelToken,
}

impl PutShared {
    fn lock(&self) -> MutexGuard<'_, PutState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn put_multipart(
    plan: &PutPlan,
    body: PutBody,
    total_len: u64,
    mut on_progress: Option<Box<dyn FnMut(u64) + '_>>,
) -> Result<S3Response> {
    let part_size = plan.part_size.max(1);
    let num_parts = total_len.div_ceil(part_size);
    if num_parts > 10_000 {
        return Err(Error::argument(format!(
            "part_size {part_size} would produce {num_parts} parts; S3 allows at most 10000"
        )));
    }

    // CreateMultipartUpload
    let mut create_headers = base_put_headers(plan);
    if let Some(algorithm) = plan.checksum {
        create_headers.push((
            "x-amz-checksum-algorithm".to_string(),
            algorithm.as_str().to_string(),
        ));
    }
    let (_, create_body) = blocking_signed(
        &plan.target,
        "POST",
        vec![("uploads".to_string(), String::new())],
        create_headers,
        None,
        &plan.credentials,
    )?;
    let upload_id = xml::parse_upload_id(&String::from_utf8_lossy(&create_body))?;

    let outcome = upload_parts(plan, &body, total_len, &upload_id, on_progress.as_deref_mut());

    let parts = match outcome {
        Ok(parts) => parts,
        Err(err) => {
            abort_multipart(plan, &upload_id);
            return Err(err);
        }
    };

    // CompleteMultipartUpload
    let complete_xml = xml::complete_multipart_xml(&parts);
    let complete = blocking_signed(
        &plan.target,
        "POST",
        vec![("uploadId".to_string(), upload_id.clone())],
        vec![("Content-Type".to_string(), "application/xml".to_string())],
        Some(Bytes::from(complete_xml)),
        &plan.credentials,
    );

    match complete {
        Ok((head, _body)) => Ok(S3Response {
            status_code: head.status,
            headers: head.headers,
            body: None,
            checksum_validated: None,
        }),
        Err(err) => {
            abort_multipart(plan, &upload_id);
            Err(err)
        }
    }
}

/// Fan the parts out across the worker pool; the caller thread dispatches,
/// tracks completions, and emits progress.
fn upload_parts(
    plan: &PutPlan,
    body: &PutBody,
    total_len: u64,
    upload_id: &str,
    mut on_progress: Option<&mut (dyn FnMut(u64) + '_)>,
) -> Result<Vec<CompletedPart>> {
    let part_size = plan.part_size.max(1);
    let num_parts = total_len.div_ceil(part_size) as u32;
    let concurrency = plan.concurrency.max(1);
    let memory_limit = plan.memory_limit.max(part_size * 2);

    let shared = Arc::new(PutShared {
        state: Mutex::new(PutState {
            completed: BTreeMap::new(),
            in_flight: 0,
            bytes_transferred: 0,
            failure: None,
        }),
        cond: Condvar::new(),
        cancel: CancelToken::new(),
    });
    let mut cancel_guard = CancelOnDrop::new(shared.cancel.clone());

    let mut next_part: u32 = 1;
    let mut last_progress: u64 = 0;

    loop {
        let progress_snapshot;
        {
            let mut state = shared.lock();

            while next_part <= num_parts
                && state.in_flight < concurrency
                && state.failure.is_none()
                && (state.in_flight as u64 + 1) * part_size <= memory_limit
            {
                let offset = u64::from(next_part - 1) * part_size;
                let len = part_size.min(total_len - offset);
                state.in_flight += 1;
                dispatch_put_part(
                    Arc::clone(&shared),
                    plan,
                    body.clone(),
                    offset,
                    len,
                    next_part,
                    upload_id.to_string(),
                );
                next_part += 1;
            }

            progress_snapshot = state.bytes_transferred;
            let done =
                state.completed.len() as u32 == num_parts && state.in_flight == 0;
            let failed = state.failure.is_some() && state.in_flight == 0;

            if !done && !failed && progress_snapshot == last_progress {
                let _unused = match shared.cond.wait(state) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                continue;
            }

            if failed {
                let err = state.failure.take().unwrap_or_else(|| {
                    Error::connection("REQUEST_CANCELED", "multipart upload failed")
                });
                drop(state);
                return Err(err);
            }

            if done {
                let completed = std::mem::take(&mut state.completed);
                drop(state);
                cancel_guard.disarm();

                if progress_snapshot > last_progress
                    && let Some(cb) = on_progress.as_mut()
                {
                    cb(progress_snapshot);
                }

                return Ok(completed
                    .into_iter()
                    .map(|(part_number, (etag, checksum))| CompletedPart {
                        part_number,
                        etag,
                        checksum: plan.checksum.and_then(|a| checksum.map(|c| (a, c))),
                    })
                    .collect());
            }
        }

        if progress_snapshot > last_progress {
            last_progress = progress_snapshot;
            if let Some(cb) = on_progress.as_mut() {
                cb(progress_snapshot);
            }
        }
    }
}

fn dispatch_put_part(
    shared: Arc<PutShared>,
    plan: &PutPlan,
    body: PutBody,
    offset: u64,
    len: u64,
    part_number: u32,
    upload_id: String,
) {
    let target = plan.target.clone();
    let credentials = plan.credentials.clone();
    let checksum = plan.checksum;

    Runtime::acquire().spawn(move || {
        // The part's bytes come straight off the source with a positional
        // read on this worker; nothing is staged through shared buffers.
        let outcome = body.read_range(offset, len).and_then(|payload| {
            upload_one_part(
                &target,
                &shared.cancel,
                &credentials,
                checksum,
                payload,
                part_number,
                &upload_id,
            )
        });

        let mut state = shared.lock();
        match outcome {
            Ok((len, etag, part_checksum)) => {
                state.bytes_transferred += len;
                state.completed.insert(part_number, (etag, part_checksum));
            }
            Err(e) => {
                if state.failure.is_none() {
                    state.failure = Some(e);
                }
                shared.cancel.cancel();
            }
        }
        state.in_flight -= 1;
        drop(state);
        shared.cond.notify_all();
    });
}

fn upload_one_part(
    target: &Target,
    cancel: &CancelToken,
    credentials: &Credentials,
    checksum: Option<ChecksumAlgorithm>,
    payload: Bytes,
    part_number: u32,
    upload_id: &str,
) -> Result<(u64, String, Option<String>)> {
    let part_checksum = checksum.map(|a| crate::s3::checksum::compute(a, &payload));

    let mut headers: Vec<(String, String)> = Vec::with_capacity(2);
    if let Some(algorithm) = checksum
        && let Some(value) = &part_checksum
    {
        headers.push((algorithm.header_name().to_string(), value.clone()));
    }

    let query = vec![
        ("partNumber".to_string(), part_number.to_string()),
        ("uploadId".to_string(), upload_id.to_string()),
    ];

    let (head, _body) = perform_signed(
        target,
        cancel,
        "PUT",
        &query,
        &headers,
        Some(&payload),
        credentials,
    )?;

    let etag = find_header(&head.headers, "ETag")
        .map(str::to_string)
        .ok_or_else(|| {
            Error::connection(
                "S3_PROTOCOL_ERROR",
                format!("UploadPart {part_number} response carried no ETag"),
            )
        })?;

    Ok((payload.len() as u64, etag, part_checksum))
}

/// Best effort: a failed or canceled multipart upload should not leave
/// stranded parts accruing storage.
fn abort_multipart(plan: &PutPlan, upload_id: &str) {
    let result = blocking_signed(
        &plan.target,
        "DELETE",
        vec![("uploadId".to_string(), upload_id.to_string())],
        Vec::new(),
        None,
        &plan.credentials,
    );

    #[cfg(feature = "tracing")]
    if let Err(e) = &result {
        tracing::debug!(error = %e, "AbortMultipartUpload failed");
    }
    let _ = result;
}
