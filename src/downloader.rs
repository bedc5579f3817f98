use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::header::{HeaderMap, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::TokenProvider;
use crate::integrity::{verify_sha256, IntegrityError};
use crate::limiter::SpeedLimiter;
use crate::saver::{FileSaver, SaveError};
use crate::state_manager::{StateError, StateManager};

/// Custom errors for a single transfer attempt.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server answered {0}")]
    HttpStatus(StatusCode),
    #[error("server ignored the range request for offset {offset}")]
    RangeIgnored { offset: u64 },
    #[error("server resumed at {actual:?}, expected offset {expected}")]
    RangeMismatch { expected: u64, actual: Option<u64> },
    #[error("stream ended after {received} of {total} bytes")]
    Incomplete { received: u64, total: u64 },
    #[error("chunk persistence failed: {0}")]
    Persistence(#[from] StateError),
    #[error("saving the payload failed: {0}")]
    Save(#[from] SaveError),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error("transfer aborted")]
    Aborted,
}

/// How one transfer attempt ended.
#[derive(Debug)]
pub enum TransferOutcome {
    /// Payload assembled and written to `path`; persisted chunks purged.
    Completed { path: PathBuf },
    /// The attempt's own cancellation token fired (pause or cancel).
    Aborted,
    /// Anything else. Persisted chunks are left in place.
    Failed(DownloadError),
}

/// Receives byte counters while a transfer streams.
pub trait ProgressSink: Send + Sync {
    fn report(&self, received: u64, total: u64) -> impl Future<Output = ()> + Send;
}

/// Everything the executor needs to know about the job it runs.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub id: String,
    pub url: String,
    pub filename: String,
    pub sha256: Option<String>,
    /// Chunks persisted by earlier attempts; the next request starts after them.
    pub chunks: Vec<Bytes>,
    /// Last known total, 0 if never known.
    pub total: u64,
}

/// Runs single transfer attempts: a ranged GET streamed chunk by chunk into
/// the chunk store, then assembled and saved.
///
/// The worker never retries. Whether and when a job runs again is decided by
/// the manager.
#[derive(Clone)]
pub struct DownloadWorker {
    client: Client,
    state: StateManager,
    saver: FileSaver,
    limiter: SpeedLimiter,
    auth: Arc<dyn TokenProvider>,
    verify_checksums: bool,
}

impl DownloadWorker {
    pub fn new(
        client: Client,
        state: StateManager,
        saver: FileSaver,
        limiter: SpeedLimiter,
        auth: Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            client,
            state,
            saver,
            limiter,
            auth,
            verify_checksums: true,
        }
    }

    pub fn verify_checksums(mut self, enabled: bool) -> Self {
        self.verify_checksums = enabled;
        self
    }

    pub fn limiter(&self) -> &SpeedLimiter {
        &self.limiter
    }

    /// Performs one attempt. Never panics and never returns an error: every
    /// way the attempt can end is folded into a `TransferOutcome`.
    pub async fn run<S: ProgressSink>(
        &self,
        request: TransferRequest,
        token: &CancellationToken,
        sink: &S,
    ) -> TransferOutcome {
        let job_id = request.id.clone();
        let result = self.transfer(request, token, sink).await;
        conclude(&job_id, result, token)
    }

    async fn transfer<S: ProgressSink>(
        &self,
        request: TransferRequest,
        token: &CancellationToken,
        sink: &S,
    ) -> Result<PathBuf, DownloadError> {
        let TransferRequest {
            id,
            url,
            filename,
            sha256,
            mut chunks,
            total: known_total,
        } = request;
        let offset: u64 = chunks.iter().map(|c| c.len() as u64).sum();

        let mut builder = self.client.get(&url);
        if offset > 0 {
            builder = builder.header(RANGE, format!("bytes={offset}-"));
        }
        if let Some(bearer) = self.auth.bearer_token() {
            builder = builder.bearer_auth(bearer);
        }

        debug!(job_id = %id, %url, offset, "requesting");
        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(DownloadError::Aborted),
            response = builder.send() => response?,
        };

        let status = response.status();
        if offset > 0 {
            match status {
                StatusCode::PARTIAL_CONTENT => {
                    let start = content_range(response.headers()).map(|range| range.start);
                    if start != Some(offset) {
                        return Err(DownloadError::RangeMismatch {
                            expected: offset,
                            actual: start,
                        });
                    }
                }
                StatusCode::OK => return Err(DownloadError::RangeIgnored { offset }),
                other => return Err(DownloadError::HttpStatus(other)),
            }
        } else if !status.is_success() {
            return Err(DownloadError::HttpStatus(status));
        }

        let total = content_range(response.headers())
            .and_then(|range| range.total)
            .or_else(|| response.content_length().map(|len| offset + len))
            .unwrap_or(known_total);
        sink.report(offset, total).await;

        let progress = Progress {
            job_id: &id,
            total,
            token,
            sink,
        };
        let received = self
            .drain(&progress, response.bytes_stream(), &mut chunks, offset)
            .await?;

        if total > 0 && received < total {
            return Err(DownloadError::Incomplete { received, total });
        }
        if let (Some(expected), true) = (sha256.as_deref(), self.verify_checksums) {
            verify_sha256(&chunks, expected)?;
        }

        let path = self.saver.save(&filename, &chunks).await?;
        if let Err(e) = self.state.remove_chunks(&id).await {
            warn!(job_id = %id, error = %e, "could not purge chunks of a completed job");
        }
        Ok(path)
    }

    /// Appends every chunk of `stream` to `chunks`, persisting each one before
    /// it is counted. Returns the new received total.
    async fn drain<St, E, S>(
        &self,
        progress: &Progress<'_, S>,
        stream: St,
        chunks: &mut Vec<Bytes>,
        mut received: u64,
    ) -> Result<u64, DownloadError>
    where
        St: Stream<Item = Result<Bytes, E>>,
        E: Into<DownloadError>,
        S: ProgressSink,
    {
        let Progress { job_id, token, sink, .. } = progress;
        let mut stream = std::pin::pin!(stream);
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(DownloadError::Aborted),
                next = stream.next() => next,
            };
            let chunk = match next {
                None => return Ok(received),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(chunk)) if chunk.is_empty() => continue,
                Some(Ok(chunk)) => chunk,
            };

            let len = chunk.len() as u64;
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(DownloadError::Aborted),
                _ = self.limiter.acquire(len) => {}
            }

            self.state
                .append_chunk(job_id, chunks.len() as u64, chunk.clone())
                .await?;
            chunks.push(chunk);
            received += len;
            sink.report(received, progress.total).await;
        }
    }
}

/// Folds the result of an attempt into its outcome.
///
/// A failure that races with the attempt's own abort is still an abort, so a
/// chunk write cut short by a pause never marks the job failed.
fn conclude(
    job_id: &str,
    result: Result<PathBuf, DownloadError>,
    token: &CancellationToken,
) -> TransferOutcome {
    match result {
        Ok(path) => {
            info!(job_id = %job_id, path = %path.display(), "transfer completed");
            TransferOutcome::Completed { path }
        }
        Err(_) if token.is_cancelled() => {
            debug!(job_id = %job_id, "transfer aborted");
            TransferOutcome::Aborted
        }
        Err(DownloadError::Aborted) => TransferOutcome::Aborted,
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "transfer failed");
            TransferOutcome::Failed(e)
        }
    }
}

/// Per-attempt context handed to `drain`.
struct Progress<'a, S> {
    job_id: &'a str,
    total: u64,
    token: &'a CancellationToken,
    sink: &'a S,
}

/// The parsed `Content-Range: bytes <start>-<end>/<total>` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    /// `None` for `/*`.
    pub total: Option<u64>,
}

pub fn content_range(headers: &HeaderMap) -> Option<ContentRange> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    parse_content_range(value)
}

pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.trim().split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = end.trim().parse().ok()?;
    let total = match total.trim() {
        "*" => None,
        digits => Some(digits.parse().ok()?),
    };
    Some(ContentRange { start, end, total })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{NoAuth, StaticToken};
    use futures_util::stream;
    use std::sync::Mutex;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct RecordingSink {
        reports: Mutex<Vec<(u64, u64)>>,
    }

    impl RecordingSink {
        fn last(&self) -> Option<(u64, u64)> {
            self.reports.lock().unwrap().last().copied()
        }
    }

    impl ProgressSink for RecordingSink {
        fn report(&self, received: u64, total: u64) -> impl Future<Output = ()> + Send {
            self.reports.lock().unwrap().push((received, total));
            std::future::ready(())
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn make_worker(dir: &std::path::Path, auth: Arc<dyn TokenProvider>) -> (DownloadWorker, StateManager) {
        let state = StateManager::open_in_memory().await.unwrap();
        let worker = DownloadWorker::new(
            Client::new(),
            state.clone(),
            FileSaver::new(dir),
            SpeedLimiter::unlimited(),
            auth,
        );
        (worker, state)
    }

    fn request(id: &str, url: String, chunks: Vec<Bytes>) -> TransferRequest {
        TransferRequest {
            id: id.to_string(),
            url,
            filename: format!("{id}.bin"),
            sha256: None,
            chunks,
            total: 0,
        }
    }

    #[test]
    fn parses_content_range_forms() {
        assert_eq!(
            parse_content_range("bytes 500-1999/2000"),
            Some(ContentRange { start: 500, end: 1999, total: Some(2000) })
        );
        assert_eq!(
            parse_content_range("bytes 0-99/*"),
            Some(ContentRange { start: 0, end: 99, total: None })
        );
        assert_eq!(parse_content_range("bytes */2000"), None);
        assert_eq!(parse_content_range("items 0-1/2"), None);
    }

    #[tokio::test]
    async fn fresh_download_completes_without_range_header() {
        let server = MockServer::start().await;
        let body = payload(1000);
        Mock::given(method("GET"))
            .and(path("/a.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (worker, state) = make_worker(dir.path(), Arc::new(NoAuth)).await;
        let sink = RecordingSink::default();

        let outcome = worker
            .run(request("1", format!("{}/a.bin", server.uri()), Vec::new()), &CancellationToken::new(), &sink)
            .await;

        let path = match outcome {
            TransferOutcome::Completed { path } => path,
            other => panic!("expected completion, got {other:?}"),
        };
        assert_eq!(tokio::fs::read(path).await.unwrap(), body);
        assert_eq!(sink.last(), Some((1000, 1000)));
        assert!(state.get_chunks("1").await.unwrap().is_none());

        let requests = server.received_requests().await.unwrap();
        assert!(requests[0].headers.get("range").is_none());
    }

    #[tokio::test]
    async fn resume_requests_remaining_range() {
        let server = MockServer::start().await;
        let body = payload(2000);
        Mock::given(method("GET"))
            .and(path("/b.bin"))
            .and(header("Range", "bytes=500-"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 500-1999/2000")
                    .set_body_bytes(body[500..].to_vec()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (worker, state) = make_worker(dir.path(), Arc::new(NoAuth)).await;
        let head = Bytes::copy_from_slice(&body[..500]);
        state.set_chunks("2", &[head.clone()]).await.unwrap();
        let sink = RecordingSink::default();

        let outcome = worker
            .run(request("2", format!("{}/b.bin", server.uri()), vec![head]), &CancellationToken::new(), &sink)
            .await;

        let path = match outcome {
            TransferOutcome::Completed { path } => path,
            other => panic!("expected completion, got {other:?}"),
        };
        assert_eq!(tokio::fs::read(path).await.unwrap(), body);
        assert_eq!(sink.reports.lock().unwrap().first(), Some(&(500, 2000)));
        assert_eq!(sink.last(), Some((2000, 2000)));
    }

    #[tokio::test]
    async fn resume_fails_when_server_ignores_range() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(payload(2000)))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (worker, state) = make_worker(dir.path(), Arc::new(NoAuth)).await;
        let head = Bytes::from(payload(500));
        state.set_chunks("x", &[head.clone()]).await.unwrap();

        let outcome = worker
            .run(request("x", server.uri(), vec![head]), &CancellationToken::new(), &RecordingSink::default())
            .await;

        assert!(matches!(
            outcome,
            TransferOutcome::Failed(DownloadError::RangeIgnored { offset: 500 })
        ));
        assert_eq!(state.chunk_bytes("x").await.unwrap(), 500);
    }

    #[tokio::test]
    async fn error_status_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (worker, _) = make_worker(dir.path(), Arc::new(NoAuth)).await;

        let outcome = worker
            .run(request("x", server.uri(), Vec::new()), &CancellationToken::new(), &RecordingSink::default())
            .await;

        assert!(matches!(
            outcome,
            TransferOutcome::Failed(DownloadError::HttpStatus(StatusCode::NOT_FOUND))
        ));
    }

    #[tokio::test]
    async fn bearer_token_is_attached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("Authorization", "Bearer s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(payload(10)))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (worker, _) = make_worker(dir.path(), Arc::new(StaticToken::new("s3cret"))).await;

        let outcome = worker
            .run(request("t", server.uri(), Vec::new()), &CancellationToken::new(), &RecordingSink::default())
            .await;

        assert!(matches!(outcome, TransferOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn cancelling_in_flight_request_aborts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(payload(10))
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (worker, _) = make_worker(dir.path(), Arc::new(NoAuth)).await;
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let outcome = worker
            .run(request("p", server.uri(), Vec::new()), &token, &RecordingSink::default())
            .await;

        assert!(matches!(outcome, TransferOutcome::Aborted));
    }

    #[tokio::test]
    async fn checksum_mismatch_fails_without_saving() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(payload(64)))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (worker, _) = make_worker(dir.path(), Arc::new(NoAuth)).await;
        let mut req = request("c", server.uri(), Vec::new());
        req.sha256 = Some("00".repeat(32));

        let outcome = worker
            .run(req, &CancellationToken::new(), &RecordingSink::default())
            .await;

        assert!(matches!(outcome, TransferOutcome::Failed(DownloadError::Integrity(_))));
        assert!(!dir.path().join("c.bin").exists());
    }

    #[tokio::test]
    async fn drain_persists_chunks_before_a_stream_error() {
        let dir = tempfile::tempdir().unwrap();
        let (worker, state) = make_worker(dir.path(), Arc::new(NoAuth)).await;
        let sink = RecordingSink::default();
        let items: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"0123")),
            Ok(Bytes::new()),
            Ok(Bytes::from_static(b"4567")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
            Ok(Bytes::from_static(b"never")),
        ];
        let mut chunks = Vec::new();

        let token = CancellationToken::new();
        let progress = Progress { job_id: "s", total: 100, token: &token, sink: &sink };

        let result = worker.drain(&progress, stream::iter(items), &mut chunks, 0).await;

        assert!(matches!(result, Err(DownloadError::Io(_))));
        assert_eq!(chunks.len(), 2);
        assert_eq!(state.chunk_bytes("s").await.unwrap(), 8);
        assert_eq!(sink.last(), Some((8, 100)));
    }

    #[tokio::test]
    async fn drain_stops_at_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let (worker, state) = make_worker(dir.path(), Arc::new(NoAuth)).await;
        let token = CancellationToken::new();
        token.cancel();
        let items: Vec<Result<Bytes, std::io::Error>> = vec![Ok(Bytes::from_static(b"data"))];
        let mut chunks = Vec::new();

        let sink = RecordingSink::default();
        let progress = Progress { job_id: "s", total: 0, token: &token, sink: &sink };

        let result = worker.drain(&progress, stream::iter(items), &mut chunks, 0).await;

        assert!(matches!(result, Err(DownloadError::Aborted)));
        assert!(chunks.is_empty());
        assert!(state.get_chunks("s").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn drain_reports_chunk_store_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (worker, state) = make_worker(dir.path(), Arc::new(NoAuth)).await;
        state.close().await.unwrap();
        let token = CancellationToken::new();
        let sink = RecordingSink::default();
        let progress = Progress { job_id: "w", total: 8, token: &token, sink: &sink };
        let items: Vec<Result<Bytes, std::io::Error>> = vec![Ok(Bytes::from_static(b"01234567"))];
        let mut chunks = Vec::new();

        let result = worker.drain(&progress, stream::iter(items), &mut chunks, 0).await;

        assert!(matches!(result, Err(DownloadError::Persistence(_))));
        assert!(chunks.is_empty());
        assert_eq!(sink.last(), None);
    }

    #[tokio::test]
    async fn chunk_store_failure_fails_the_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(payload(64)))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (worker, state) = make_worker(dir.path(), Arc::new(NoAuth)).await;
        state.close().await.unwrap();

        let outcome = worker
            .run(request("w", server.uri(), Vec::new()), &CancellationToken::new(), &RecordingSink::default())
            .await;

        assert!(matches!(outcome, TransferOutcome::Failed(DownloadError::Persistence(_))));
        assert!(!dir.path().join("w.bin").exists());
    }

    #[tokio::test]
    async fn chunk_store_failure_after_abort_is_an_abort() {
        let dir = tempfile::tempdir().unwrap();
        let (worker, state) = make_worker(dir.path(), Arc::new(NoAuth)).await;
        state.close().await.unwrap();
        let live = CancellationToken::new();
        let sink = RecordingSink::default();
        let progress = Progress { job_id: "w", total: 0, token: &live, sink: &sink };
        let items: Vec<Result<Bytes, std::io::Error>> = vec![Ok(Bytes::from_static(b"data"))];
        let error = match worker.drain(&progress, stream::iter(items), &mut Vec::new(), 0).await {
            Err(e @ DownloadError::Persistence(_)) => e,
            other => panic!("expected a persistence error, got {other:?}"),
        };

        let cancelled = CancellationToken::new();
        cancelled.cancel();

        assert!(matches!(conclude("w", Err(error), &cancelled), TransferOutcome::Aborted));
    }
}
