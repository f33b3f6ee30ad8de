//! Background Compression Worker
//!
//! CPU-bound compression runs on a dedicated thread so async callers are never
//! blocked. Callers and worker talk only by message:
//!
//! ```text
//!  caller ──{request_id, action, payload}──▶ worker thread
//!    ▲                                          │
//!    └── pending[request_id] ◀── dispatcher ◀──{request_id, result}
//! ```
//!
//! Every request carries a hard timeout. A timeout, a codec error, and a dead
//! worker all come back as typed errors; none of them touch the store.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use super::compression::{CompressionAlgorithm, Compressor};
use crate::error::{Error, Result};

/// Work the worker can perform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerAction {
    Compress,
    Decompress { expected_len: Option<usize> },
}

#[derive(Debug)]
struct WorkerRequest {
    request_id: u64,
    action: WorkerAction,
    payload: Bytes,
}

#[derive(Debug)]
struct WorkerReply {
    request_id: u64,
    result: Result<Vec<u8>>,
}

type PendingMap = DashMap<u64, oneshot::Sender<Result<Bytes>>>;

/// Handle to the compression worker
pub struct CompressionWorker {
    requests: Mutex<Option<Sender<WorkerRequest>>>,
    pending: Arc<PendingMap>,
    alive: Arc<AtomicBool>,
    next_id: AtomicU64,
    timeout: Duration,
    algorithm: CompressionAlgorithm,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl CompressionWorker {
    /// Spawn a worker using `algorithm`
    pub fn spawn(algorithm: CompressionAlgorithm, timeout: Duration) -> Result<Self> {
        Self::with_compressor(algorithm.compressor(), timeout)
    }

    /// Spawn a worker around a specific codec
    pub fn with_compressor(compressor: Box<dyn Compressor>, timeout: Duration) -> Result<Self> {
        let algorithm = compressor.algorithm();
        let (request_tx, request_rx) = channel::unbounded::<WorkerRequest>();
        let (reply_tx, reply_rx) = channel::unbounded::<WorkerReply>();
        let pending: Arc<PendingMap> = Arc::new(DashMap::new());
        let alive = Arc::new(AtomicBool::new(true));

        let worker = std::thread::Builder::new()
            .name("corpus-cache-compressor".into())
            .spawn(move || run_worker(compressor, request_rx, reply_tx))?;

        let dispatcher = {
            let pending = pending.clone();
            let alive = alive.clone();
            std::thread::Builder::new()
                .name("corpus-cache-replies".into())
                .spawn(move || run_dispatcher(reply_rx, pending, alive))?
        };

        debug!(algorithm = %algorithm, ?timeout, "Compression worker started");

        Ok(Self {
            requests: Mutex::new(Some(request_tx)),
            pending,
            alive,
            next_id: AtomicU64::new(1),
            timeout,
            algorithm,
            threads: Mutex::new(vec![worker, dispatcher]),
        })
    }

    /// Algorithm used by this worker
    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }

    /// Whether the worker can still accept requests
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire) && self.requests.lock().is_some()
    }

    /// Number of requests awaiting a reply
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Compress `data` off the caller's thread
    pub async fn compress(&self, data: Bytes) -> Result<Bytes> {
        self.submit(WorkerAction::Compress, data).await
    }

    /// Decompress `data` off the caller's thread
    pub async fn decompress(&self, data: Bytes) -> Result<Bytes> {
        self.submit(WorkerAction::Decompress { expected_len: None }, data).await
    }

    /// Decompress `data`, which must expand to exactly `expected_len` bytes
    pub async fn decompress_exact(&self, data: Bytes, expected_len: usize) -> Result<Bytes> {
        let action = WorkerAction::Decompress {
            expected_len: Some(expected_len),
        };
        self.submit(action, data).await
    }

    async fn submit(&self, action: WorkerAction, payload: Bytes) -> Result<Bytes> {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);

        if !self.alive.load(Ordering::Acquire) {
            self.pending.remove(&request_id);
            return Err(Error::WorkerUnavailable("worker has exited".into()));
        }

        let sent = match self.requests.lock().as_ref() {
            Some(sender) => sender
                .send(WorkerRequest {
                    request_id,
                    action,
                    payload,
                })
                .is_ok(),
            None => false,
        };
        if !sent {
            self.pending.remove(&request_id);
            return Err(Error::WorkerUnavailable("worker is shut down".into()));
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::WorkerUnavailable(
                "worker exited before replying".into(),
            )),
            Err(_) => {
                self.pending.remove(&request_id);
                warn!(request_id, ?action, timeout = ?self.timeout, "Compression request timed out");
                Err(Error::CompressionTimeout {
                    request_id,
                    timeout: self.timeout,
                })
            }
        }
    }

    /// Stop accepting work and wait for the worker threads to exit
    pub async fn shutdown(&self) {
        self.requests.lock().take();
        let threads: Vec<JoinHandle<()>> = std::mem::take(&mut *self.threads.lock());
        if threads.is_empty() {
            return;
        }
        let joined = tokio::task::spawn_blocking(move || {
            for handle in threads {
                let _ = handle.join();
            }
        })
        .await;
        if let Err(e) = joined {
            warn!("Failed to join compression worker: {}", e);
        }
        debug!("Compression worker stopped");
    }
}

impl Drop for CompressionWorker {
    fn drop(&mut self) {
        // Closing the request channel lets both threads wind down detached
        self.requests.lock().take();
    }
}

impl std::fmt::Debug for CompressionWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressionWorker")
            .field("algorithm", &self.algorithm)
            .field("timeout", &self.timeout)
            .field("in_flight", &self.pending.len())
            .field("alive", &self.alive.load(Ordering::Relaxed))
            .finish()
    }
}

fn run_worker(
    compressor: Box<dyn Compressor>,
    requests: Receiver<WorkerRequest>,
    replies: Sender<WorkerReply>,
) {
    for request in requests.iter() {
        let result = match request.action {
            WorkerAction::Compress => compressor.compress(&request.payload),
            WorkerAction::Decompress { expected_len: None } => {
                compressor.decompress(&request.payload)
            }
            WorkerAction::Decompress {
                expected_len: Some(len),
            } => compressor.decompress_exact(&request.payload, len),
        };
        let reply = WorkerReply {
            request_id: request.request_id,
            result,
        };
        if replies.send(reply).is_err() {
            break;
        }
    }
}

fn run_dispatcher(replies: Receiver<WorkerReply>, pending: Arc<PendingMap>, alive: Arc<AtomicBool>) {
    for reply in replies.iter() {
        match pending.remove(&reply.request_id) {
            Some((_, tx)) => {
                let _ = tx.send(reply.result.map(Bytes::from));
            }
            None => debug!(
                request_id = reply.request_id,
                "Dropping reply for abandoned request"
            ),
        }
    }

    // Reply channel closed: the worker is gone, fail everyone still waiting
    alive.store(false, Ordering::Release);
    let stranded = pending.len();
    pending.clear();
    if stranded > 0 {
        error!(stranded, "Compression worker exited with requests in flight");
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use crate::cache::compression::Lz4Compressor;

    struct SlowCompressor(Duration);

    impl Compressor for SlowCompressor {
        fn algorithm(&self) -> CompressionAlgorithm {
            CompressionAlgorithm::None
        }
        fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
            std::thread::sleep(self.0);
            Ok(data.to_vec())
        }
        fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
            Ok(data.to_vec())
        }
    }

    struct PanickingCompressor;

    impl Compressor for PanickingCompressor {
        fn algorithm(&self) -> CompressionAlgorithm {
            CompressionAlgorithm::None
        }
        fn compress(&self, _data: &[u8]) -> Result<Vec<u8>> {
            panic!("codec crashed");
        }
        fn decompress(&self, _data: &[u8]) -> Result<Vec<u8>> {
            panic!("codec crashed");
        }
    }

    fn corpus_like(n: usize) -> Bytes {
        let mut out = String::new();
        for i in 0..n {
            out.push_str(&format!("{{\"titulo\":\"musica {}\",\"artista\":\"artista {}\"}},", i, i % 17));
        }
        Bytes::from(out)
    }

    #[tokio::test]
    async fn test_roundtrip_through_worker() {
        let worker = CompressionWorker::spawn(CompressionAlgorithm::Lz4, Duration::from_secs(10)).unwrap();
        let data = corpus_like(2_000);

        let compressed = worker.compress(data.clone()).await.unwrap();
        assert!(compressed.len() < data.len());

        let restored = worker.decompress(compressed).await.unwrap();
        assert_eq!(restored, data);
        assert_eq!(worker.in_flight(), 0);

        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_matched_by_id() {
        let worker = Arc::new(
            CompressionWorker::with_compressor(Box::new(Lz4Compressor::new()), Duration::from_secs(10))
                .unwrap(),
        );

        let mut handles = Vec::new();
        for i in 0..16 {
            let worker = worker.clone();
            handles.push(tokio::spawn(async move {
                let data = corpus_like(100 + i * 10);
                let compressed = worker.compress(data.clone()).await.unwrap();
                let restored = worker.decompress(compressed).await.unwrap();
                assert_eq!(restored, data);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_decode_error_is_reported() {
        let worker = CompressionWorker::spawn(CompressionAlgorithm::Lz4, Duration::from_secs(5)).unwrap();
        let result = worker.decompress(Bytes::from_static(b"\x00")).await;
        assert_matches!(result, Err(Error::DecompressionFailed { .. }));
        // Worker survives codec errors
        assert!(worker.is_alive());
    }

    #[tokio::test]
    async fn test_exact_decompress_rejects_wrong_length() {
        let worker = CompressionWorker::spawn(CompressionAlgorithm::Lz4, Duration::from_secs(5)).unwrap();
        let data = corpus_like(200);
        let compressed = worker.compress(data.clone()).await.unwrap();

        let restored = worker.decompress_exact(compressed.clone(), data.len()).await.unwrap();
        assert_eq!(restored, data);

        let result = worker.decompress_exact(compressed, data.len() + 1).await;
        assert_matches!(result, Err(Error::DecompressionFailed { .. }));
        assert!(worker.is_alive());
    }

    #[tokio::test]
    async fn test_timeout_is_recoverable() {
        let worker = CompressionWorker::with_compressor(
            Box::new(SlowCompressor(Duration::from_millis(300))),
            Duration::from_millis(20),
        )
        .unwrap();

        let result = worker.compress(Bytes::from_static(b"payload")).await;
        assert_matches!(result, Err(Error::CompressionTimeout { .. }));
        assert_eq!(worker.in_flight(), 0);

        // The late reply is discarded; the worker keeps serving
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(worker.decompress(Bytes::from_static(b"ok")).await.is_ok());
    }

    #[tokio::test]
    async fn test_crashed_worker_surfaces_error() {
        let worker = CompressionWorker::with_compressor(
            Box::new(PanickingCompressor),
            Duration::from_secs(5),
        )
        .unwrap();

        let result = worker.compress(Bytes::from_static(b"boom")).await;
        assert_matches!(result, Err(Error::WorkerUnavailable(_)));

        // Give the dispatcher a moment to observe the closed channel
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!worker.is_alive());
        let again = worker.compress(Bytes::from_static(b"again")).await;
        assert_matches!(again, Err(Error::WorkerUnavailable(_)));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let worker = CompressionWorker::spawn(CompressionAlgorithm::Lz4, Duration::from_secs(5)).unwrap();
        worker.shutdown().await;
        assert!(!worker.is_alive());
        let result = worker.compress(Bytes::from_static(b"late")).await;
        assert_matches!(result, Err(Error::WorkerUnavailable(_)));
    }
}
