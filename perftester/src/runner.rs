//! Timed upload, download and delete operations against every endpoint.
//!
//! For each pair of file test and endpoint, the [`Runner`] uploads `parallelism` synthetic objects,
//! downloads and verifies them, and finally deletes them again. Each of the three operations fans
//! out into concurrent workers and is timed from the start of the first worker until the last one
//! has finished. Worker failures, digest mismatches and timeouts are recorded in the operation's
//! result. Only failures to report a result abort the run.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use sha2::{Digest as _, Sha256};
use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::client::{ClientError, ClientResult, ObjectReader};
use crate::datamodel::{FileTest, FileTestConfig, Id, Operation, OperationResult, time_seed};
use crate::endpoint::Endpoint;
use crate::payload::{Digest, Payload, expected_digest};
use crate::report::{ReportError, Reporter};

/// Errors that abort a benchmark run.
#[derive(Debug, Error)]
pub enum RunError {
    /// The reporter rejected a result.
    #[error("failed to report {operation} result of {file_test} on {endpoint}")]
    Report {
        operation: Operation,
        file_test: Id,
        endpoint: Id,
        #[source]
        source: ReportError,
    },

    /// No file test with the given identifier is configured.
    #[error("unknown file test {0}")]
    UnknownFileTest(Id),

    /// A benchmark task panicked or was cancelled.
    #[error("benchmark task failed")]
    Task(#[from] JoinError),
}

/// Reasons for a single operation to fail. These end up in the operation's result.
#[derive(Debug, Error)]
pub enum OperationError {
    /// The storage client returned an error.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The downloaded contents differ from what was uploaded.
    #[error(
        "unexpected \"{file_test}\"/{index} file contents: expected sha256 digest {expected}; got {actual}"
    )]
    Mismatch {
        file_test: Id,
        index: usize,
        expected: Digest,
        actual: Digest,
    },

    /// Reading failed, and closing the reader failed as well.
    #[error("{read}; close: {close}")]
    Close {
        read: Box<OperationError>,
        close: ClientError,
    },

    /// The operation exceeded its timeout and all workers were cancelled.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: Operation,
        timeout: Duration,
    },

    /// The worker was cancelled before it could finish.
    #[error("cancelled")]
    Cancelled,

    /// The worker task panicked.
    #[error("worker failed: {0}")]
    Panicked(String),
}

type OperationOutcome = Result<(), OperationError>;

/// Runs benchmarks and hands every result to a [`Reporter`].
#[derive(Debug)]
pub struct Runner<R> {
    reporter: Arc<R>,
    endpoints: Vec<Arc<Endpoint>>,
    file_tests: Arc<BTreeMap<Id, FileTest>>,
    concurrency: usize,
}

impl<R> Clone for Runner<R> {
    fn clone(&self) -> Self {
        Self {
            reporter: Arc::clone(&self.reporter),
            endpoints: self.endpoints.clone(),
            file_tests: Arc::clone(&self.file_tests),
            concurrency: self.concurrency,
        }
    }
}

impl<R: Reporter> Runner<R> {
    /// Creates a runner, resolving the defaults of every file test.
    ///
    /// File tests without a seed get one derived from the current time here, so that all
    /// operations of a test work on identical payloads.
    pub fn new(
        reporter: Arc<R>,
        endpoints: Vec<Endpoint>,
        file_tests: &BTreeMap<Id, FileTestConfig>,
        default_timeout: Duration,
    ) -> Self {
        let seed = time_seed();
        let file_tests = file_tests
            .iter()
            .enumerate()
            .map(|(offset, (id, config))| {
                let resolved = config.resolve(default_timeout, seed.wrapping_add(offset as u64));
                (id.clone(), resolved)
            })
            .collect();

        Self {
            reporter,
            endpoints: endpoints.into_iter().map(Arc::new).collect(),
            file_tests: Arc::new(file_tests),
            concurrency: 1,
        }
    }

    /// Sets how many file test and endpoint pairs run at the same time.
    ///
    /// Operations of the same pair always run in sequence.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Returns the resolved file test with the given identifier.
    pub fn file_test(&self, id: &Id) -> Option<&FileTest> {
        self.file_tests.get(id)
    }

    /// Returns all endpoints in configured order.
    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter().map(AsRef::as_ref)
    }

    /// Runs all file tests against all endpoints.
    ///
    /// Pairs are started in file test order, then endpoint order. Each pair runs as its own task,
    /// with at most `concurrency` pairs in flight. Stops at the first [`RunError`] and aborts the
    /// remaining pairs. Failing operations do not stop the run.
    pub async fn run_all(&self) -> Result<(), RunError>
    where
        R: 'static,
    {
        let mut checks = JoinSet::new();

        for id in self.file_tests.keys() {
            for endpoint in &self.endpoints {
                while checks.len() >= self.concurrency {
                    if let Some(joined) = checks.join_next().await {
                        joined??;
                    }
                }

                let runner = self.clone();
                let id = id.clone();
                let endpoint = Arc::clone(endpoint);
                checks.spawn(async move { runner.run_check(&id, &endpoint).await });
            }
        }

        while let Some(joined) = checks.join_next().await {
            joined??;
        }
        Ok(())
    }

    /// Uploads, downloads and deletes one file test on one endpoint.
    pub async fn run_check(&self, file_test: &Id, endpoint: &Arc<Endpoint>) -> Result<(), RunError> {
        tracing::info!(%file_test, endpoint = %endpoint.id, "starting check");

        self.upload(file_test, endpoint).await?;
        self.download(file_test, endpoint).await?;
        self.delete(file_test, endpoint).await?;

        Ok(())
    }

    fn resolved(&self, id: &Id) -> Result<&FileTest, RunError> {
        self.file_tests
            .get(id)
            .ok_or_else(|| RunError::UnknownFileTest(id.clone()))
    }

    /// Runs and reports the upload operation.
    pub async fn upload(&self, id: &Id, endpoint: &Arc<Endpoint>) -> Result<(), RunError> {
        let file_test = self.resolved(id)?;

        self.timed(Operation::Upload, id, file_test, endpoint, |index, token| {
            let endpoint = Arc::clone(endpoint);
            let name = endpoint.object_path(id, index);
            let stream = Payload::for_worker(file_test, index).into_stream();
            async move { cancellable(&token, endpoint.client.upload(&name, stream)).await }
        })
        .await
    }

    /// Runs and reports the download operation, verifying the contents of every object.
    pub async fn download(&self, id: &Id, endpoint: &Arc<Endpoint>) -> Result<(), RunError> {
        let file_test = self.resolved(id)?;

        let digests = {
            let file_test = file_test.clone();
            tokio::task::spawn_blocking(move || {
                (0..file_test.parallelism)
                    .map(|index| expected_digest(&file_test, index))
                    .collect::<Vec<_>>()
            })
        };
        let expected = match digests.await {
            Ok(expected) => expected,
            Err(err) => {
                let error = OperationError::Panicked(err.to_string());
                tracing::error!(%error, file_test = %id, endpoint = %endpoint.id, "Download failed");
                let result =
                    OperationResult::failed(SystemTime::now(), Duration::ZERO, error.to_string());
                return self.submit(Operation::Download, id, endpoint, result);
            }
        };

        self.timed(Operation::Download, id, file_test, endpoint, |index, token| {
            let endpoint = Arc::clone(endpoint);
            let name = endpoint.object_path(id, index);
            let id = id.clone();
            let expected = expected[index];
            async move {
                let mut reader = cancellable(&token, endpoint.client.download(&name)).await?;
                let read = verify(reader.as_mut(), &token, id, index, expected).await;
                let closed = reader.close().await;

                match (read, closed) {
                    (Ok(()), Ok(())) => Ok(()),
                    (Err(read), Ok(())) => Err(read),
                    (Ok(()), Err(close)) => Err(close.into()),
                    (Err(read), Err(close)) => Err(OperationError::Close {
                        read: Box::new(read),
                        close,
                    }),
                }
            }
        })
        .await
    }

    /// Runs and reports the delete operation.
    pub async fn delete(&self, id: &Id, endpoint: &Arc<Endpoint>) -> Result<(), RunError> {
        let file_test = self.resolved(id)?;

        self.timed(Operation::Delete, id, file_test, endpoint, |index, token| {
            let endpoint = Arc::clone(endpoint);
            let name = endpoint.object_path(id, index);
            async move { cancellable(&token, endpoint.client.delete(&name)).await }
        })
        .await
    }

    /// Times one operation and reports its result.
    async fn timed<F, Fut>(
        &self,
        operation: Operation,
        id: &Id,
        file_test: &FileTest,
        endpoint: &Endpoint,
        worker: F,
    ) -> Result<(), RunError>
    where
        F: FnMut(usize, CancellationToken) -> Fut,
        Fut: Future<Output = OperationOutcome> + Send + 'static,
    {
        tracing::info!(file_test = %id, endpoint = %endpoint.id, "{operation}");

        let start_time = SystemTime::now();
        let start = Instant::now();
        let outcome = run_parallel(operation, file_test, start, worker).await;
        let duration = start.elapsed();

        if let Err(ref error) = outcome {
            tracing::error!(
                %error,
                file_test = %id,
                endpoint = %endpoint.id,
                "{operation} failed"
            );
        }

        let result = OperationResult::from_outcome(start_time, duration, outcome);
        self.submit(operation, id, endpoint, result)
    }

    fn submit(
        &self,
        operation: Operation,
        id: &Id,
        endpoint: &Endpoint,
        result: OperationResult,
    ) -> Result<(), RunError> {
        self.reporter
            .report(operation, id, &endpoint.id, result)
            .map_err(|source| RunError::Report {
                operation,
                file_test: id.clone(),
                endpoint: endpoint.id.clone(),
                source,
            })
    }
}

/// Spawns one worker per sub-object and waits for all of them.
///
/// Returns the first worker error in completion order. When the timeout elapses, all workers are
/// cancelled and drained, and the operation fails with [`OperationError::Timeout`].
async fn run_parallel<F, Fut>(
    operation: Operation,
    file_test: &FileTest,
    start: Instant,
    mut worker: F,
) -> OperationOutcome
where
    F: FnMut(usize, CancellationToken) -> Fut,
    Fut: Future<Output = OperationOutcome> + Send + 'static,
{
    let token = CancellationToken::new();
    let deadline = start + file_test.timeout;

    let mut workers = JoinSet::new();
    for index in 0..file_test.parallelism {
        workers.spawn(worker(index, token.child_token()));
    }

    let mut first_error = None;
    let mut timed_out = false;
    loop {
        let joined = if timed_out {
            workers.join_next().await
        } else {
            match tokio::time::timeout_at(deadline, workers.join_next()).await {
                Ok(joined) => joined,
                Err(_) => {
                    timed_out = true;
                    token.cancel();
                    continue;
                }
            }
        };

        let Some(joined) = joined else {
            break;
        };
        let outcome = joined.unwrap_or_else(|err| Err(OperationError::Panicked(err.to_string())));
        if let Err(err) = outcome {
            first_error.get_or_insert(err);
        }
    }

    if timed_out {
        return Err(OperationError::Timeout {
            operation,
            timeout: file_test.timeout,
        });
    }
    first_error.map_or(Ok(()), Err)
}

/// Runs a client call unless the operation is cancelled first.
async fn cancellable<T>(
    token: &CancellationToken,
    call: impl Future<Output = ClientResult<T>>,
) -> Result<T, OperationError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(OperationError::Cancelled),
        result = call => Ok(result?),
    }
}

/// Hashes the object while streaming it and compares it to the expected digest.
async fn verify(
    reader: &mut dyn ObjectReader,
    token: &CancellationToken,
    file_test: Id,
    index: usize,
    expected: Digest,
) -> OperationOutcome {
    let mut hasher = Sha256::new();
    while let Some(chunk) = cancellable(token, reader.next_chunk()).await? {
        hasher.update(&chunk);
    }

    let actual = Digest::from_hasher(hasher);
    if actual != expected {
        return Err(OperationError::Mismatch {
            file_test,
            index,
            expected,
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use bytesize::ByteSize;

    use super::*;
    use crate::client::InMemoryClient;
    use crate::report::{Snapshot, TextReporter};

    const TIMEOUT: Duration = Duration::from_secs(60);

    fn file_tests(parallelism: usize, timeout: Option<Duration>) -> BTreeMap<Id, FileTestConfig> {
        BTreeMap::from([(
            Id::from("small"),
            FileTestConfig {
                size: ByteSize::kib(64),
                parallelism,
                seed: Some(99),
                timeout,
            },
        )])
    }

    fn runner(
        client: &InMemoryClient,
        tests: &BTreeMap<Id, FileTestConfig>,
    ) -> Runner<TextReporter> {
        perftester_test::tracing::init();
        let endpoint = Endpoint::new("mem", Box::new(client.clone())).with_prefix("bench");
        Runner::new(Arc::new(TextReporter::default()), vec![endpoint], tests, TIMEOUT)
    }

    fn snapshot(runner: &Runner<TextReporter>) -> Snapshot {
        runner.reporter.snapshot()
    }

    fn error(snapshot: &Snapshot, operation: Operation) -> Option<String> {
        snapshot
            .get(operation, &Id::from("small"), &Id::from("mem"))
            .and_then(|result| result.error.clone())
    }

    #[tokio::test]
    async fn full_check_round_trips() {
        let client = InMemoryClient::new();
        let runner = runner(&client, &file_tests(4, None));
        let id = Id::from("small");
        let endpoint = Arc::clone(&runner.endpoints[0]);

        runner.upload(&id, &endpoint).await.unwrap();
        for index in 0..4 {
            let stored = client.get_stored(&format!("bench/small{index}")).unwrap();
            assert_eq!(stored.len(), 64 * 1024);
        }

        runner.download(&id, &endpoint).await.unwrap();
        runner.delete(&id, &endpoint).await.unwrap();
        assert!(client.is_empty());

        let snapshot = snapshot(&runner);
        assert_eq!(snapshot.len(), 3);
        assert!(snapshot.iter().all(|(_, result)| result.success()));
    }

    #[tokio::test]
    async fn detects_corrupted_contents() {
        let client = InMemoryClient::new();
        let runner = runner(&client, &file_tests(2, None));
        let id = Id::from("small");
        let endpoint = Arc::clone(&runner.endpoints[0]);

        runner.upload(&id, &endpoint).await.unwrap();
        client.corrupt("bench/small1");
        runner.download(&id, &endpoint).await.unwrap();

        let message = error(&snapshot(&runner), Operation::Download).unwrap();
        assert!(
            message.starts_with("unexpected \"small\"/1 file contents: expected sha256 digest "),
            "{message}"
        );
        assert!(message.contains("; got "));
    }

    #[tokio::test]
    async fn merges_close_errors() {
        let client = InMemoryClient::new();
        let runner = runner(&client, &file_tests(1, None));
        let id = Id::from("small");
        let endpoint = Arc::clone(&runner.endpoints[0]);

        runner.upload(&id, &endpoint).await.unwrap();
        client.corrupt("bench/small0");
        client.fail_reader_close("close failed");
        runner.download(&id, &endpoint).await.unwrap();

        let message = error(&snapshot(&runner), Operation::Download).unwrap();
        assert!(message.starts_with("unexpected"), "{message}");
        assert!(message.ends_with("; close: close failed"), "{message}");
    }

    #[tokio::test]
    async fn failures_do_not_abort_the_check() {
        let client = InMemoryClient::new();
        client.fail(Operation::Upload, "boom");
        let runner = runner(&client, &file_tests(3, None));

        runner.run_all().await.unwrap();

        let snapshot = snapshot(&runner);
        assert_eq!(snapshot.len(), 3);
        assert_eq!(error(&snapshot, Operation::Upload).as_deref(), Some("boom"));
        assert!(error(&snapshot, Operation::Download).unwrap().contains("not found"));
        assert!(error(&snapshot, Operation::Delete).unwrap().contains("not found"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_workers() {
        let client = InMemoryClient::new();
        client.set_latency(Duration::from_secs(30));
        let runner = runner(&client, &file_tests(4, Some(Duration::from_secs(2))));
        let id = Id::from("small");
        let endpoint = Arc::clone(&runner.endpoints[0]);

        runner.upload(&id, &endpoint).await.unwrap();

        let snapshot = snapshot(&runner);
        let result = snapshot
            .get(Operation::Upload, &id, &Id::from("mem"))
            .unwrap();
        assert_eq!(result.error.as_deref(), Some("Upload timed out after 2s"));
        assert!(result.duration >= Duration::from_secs(2));
        assert!(result.duration < Duration::from_secs(30));
        assert!(client.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn duration_spans_all_workers() {
        let client = InMemoryClient::new();
        client.set_latency(Duration::from_secs(3));
        let runner = runner(&client, &file_tests(8, None));
        let id = Id::from("small");
        let endpoint = Arc::clone(&runner.endpoints[0]);

        runner.delete(&id, &endpoint).await.unwrap();

        let snapshot = snapshot(&runner);
        let result = snapshot
            .get(Operation::Delete, &id, &Id::from("mem"))
            .unwrap();
        assert!(result.duration >= Duration::from_secs(3));
        assert!(result.duration < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_closes_readers_mid_stream() {
        let client = InMemoryClient::new();
        let runner = runner(&client, &file_tests(2, Some(Duration::from_secs(2))));
        let id = Id::from("small");
        let endpoint = Arc::clone(&runner.endpoints[0]);

        runner.upload(&id, &endpoint).await.unwrap();
        client.set_read_latency(Duration::from_secs(30));
        runner.download(&id, &endpoint).await.unwrap();

        assert_eq!(
            error(&snapshot(&runner), Operation::Download).as_deref(),
            Some("Download timed out after 2s")
        );
        assert_eq!(client.readers_closed(), 2);
    }

    #[tokio::test]
    async fn single_failing_worker_fails_the_operation() {
        let client = InMemoryClient::new();
        let runner = runner(&client, &file_tests(4, None));
        let id = Id::from("small");
        let endpoint = Arc::clone(&runner.endpoints[0]);

        runner.upload(&id, &endpoint).await.unwrap();
        client.corrupt("bench/small2");
        runner.download(&id, &endpoint).await.unwrap();

        let message = error(&snapshot(&runner), Operation::Download).unwrap();
        assert!(
            message.starts_with("unexpected \"small\"/2 file contents: "),
            "{message}"
        );
        assert_eq!(client.readers_closed(), 4);
    }

    fn two_endpoints(
        fast: &InMemoryClient,
        slow: &InMemoryClient,
        tests: &BTreeMap<Id, FileTestConfig>,
    ) -> Runner<TextReporter> {
        perftester_test::tracing::init();
        let endpoints = vec![
            Endpoint::new("fast", Box::new(fast.clone())),
            Endpoint::new("slow", Box::new(slow.clone())),
        ];
        Runner::new(Arc::new(TextReporter::default()), endpoints, tests, TIMEOUT)
            .with_concurrency(2)
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_pairs_keep_their_own_durations() {
        let fast = InMemoryClient::new();
        fast.set_latency(Duration::from_millis(100));
        let slow = InMemoryClient::new();
        slow.set_latency(Duration::from_millis(300));
        let runner = two_endpoints(&fast, &slow, &file_tests(2, None));

        runner.run_all().await.unwrap();

        let snapshot = snapshot(&runner);
        assert_eq!(snapshot.len(), 6);
        for (endpoint, latency) in [("fast", 100), ("slow", 300)] {
            let latency = Duration::from_millis(latency);
            for operation in Operation::ALL {
                let result = snapshot
                    .get(operation, &Id::from("small"), &Id::from(endpoint))
                    .unwrap();
                assert!(result.success(), "{endpoint} {operation}: {result:?}");
                assert!(
                    result.duration >= latency
                        && result.duration < latency + Duration::from_millis(10),
                    "{endpoint} {operation}: {:?}",
                    result.duration
                );
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_pairs_detect_timeouts_on_time() {
        let fast = InMemoryClient::new();
        let slow = InMemoryClient::new();
        slow.set_latency(Duration::from_secs(5));
        let tests = BTreeMap::from([(
            Id::from("big"),
            FileTestConfig {
                size: ByteSize::mib(16),
                parallelism: 1,
                seed: Some(7),
                timeout: Some(Duration::from_millis(500)),
            },
        )]);
        let runner = two_endpoints(&fast, &slow, &tests);

        runner.run_all().await.unwrap();

        let snapshot = snapshot(&runner);
        for operation in Operation::ALL {
            let result = snapshot
                .get(operation, &Id::from("big"), &Id::from("slow"))
                .unwrap();
            assert_eq!(
                result.error.as_deref(),
                Some(format!("{operation} timed out after 500ms").as_str())
            );
            assert!(
                result.duration < Duration::from_millis(1500),
                "{operation}: {:?}",
                result.duration
            );
        }
    }

    #[derive(Debug)]
    struct RejectingReporter;

    impl Reporter for RejectingReporter {
        fn report(
            &self,
            _operation: Operation,
            _file_test: &Id,
            _endpoint: &Id,
            _result: OperationResult,
        ) -> Result<(), ReportError> {
            Err(ReportError::InvalidSubmission("rejected".into()))
        }
    }

    #[tokio::test]
    async fn reporter_errors_abort_the_run() {
        let client = InMemoryClient::new();
        let endpoint = Endpoint::new("mem", Box::new(client.clone()));
        let runner = Runner::new(
            Arc::new(RejectingReporter),
            vec![endpoint],
            &file_tests(1, None),
            TIMEOUT,
        );

        let err = runner.run_all().await.unwrap_err();
        assert!(matches!(
            err,
            RunError::Report {
                operation: Operation::Upload,
                ..
            }
        ));
        // The download never ran, so the uploaded object is still there.
        assert!(client.contains("small0"));
    }

    #[tokio::test]
    async fn unknown_file_test() {
        let client = InMemoryClient::new();
        let runner = runner(&client, &file_tests(1, None));
        let endpoint = Arc::clone(&runner.endpoints[0]);

        let err = runner
            .run_check(&Id::from("missing"), &endpoint)
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::UnknownFileTest(_)));
    }

    #[test]
    fn resolves_file_tests_once() {
        let client = InMemoryClient::new();
        let runner = runner(&client, &file_tests(0, None));
        let test = runner.file_test(&Id::from("small")).unwrap();

        assert_eq!(test.parallelism, 1);
        assert_eq!(test.seed, 99);
        assert_eq!(test.timeout, TIMEOUT);
    }
}
