//! Fixed pool of FIFO queues, one dedicated worker thread each.
//!
//! Queues are handed out round-robin by call order, not by connection, so
//! two chunks of one connection may be decoded concurrently on different
//! workers.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::core::StreamDecoder;
use crate::transport::ConnectionKey;

/// Errors from the dispatch pool.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The queue's worker has stopped.
    #[error("dispatch queue {0} is closed")]
    QueueClosed(usize),

    /// A worker thread could not be spawned.
    #[error("failed to spawn dispatch worker: {0}")]
    Spawn(#[from] io::Error),
}

/// Reassembled bytes bound to the decoder that will consume them.
pub struct DecodeRequest {
    bytes: Vec<u8>,
    decoder: Arc<dyn StreamDecoder>,
    origin: Option<ConnectionKey>,
}

impl DecodeRequest {
    /// Create a request.
    pub fn new(bytes: Vec<u8>, decoder: Arc<dyn StreamDecoder>) -> Self {
        Self {
            bytes,
            decoder,
            origin: None,
        }
    }

    /// Tag the request with the connection it came from (for logging).
    pub fn with_origin(mut self, key: ConnectionKey) -> Self {
        self.origin = Some(key);
        self
    }

    /// Number of bytes carried.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// `true` if the request carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl std::fmt::Debug for DecodeRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeRequest")
            .field("len", &self.bytes.len())
            .field("origin", &self.origin)
            .finish()
    }
}

enum Job {
    Decode(DecodeRequest),
    Shutdown,
}

/// Handle to one queue of the pool.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    index: usize,
    tx: mpsc::UnboundedSender<Job>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Job::Decode(request) => request.fmt(f),
            Job::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl QueueHandle {
    /// Position of this queue in the pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Push a request to the back of the queue.
    pub fn submit(&self, request: DecodeRequest) -> Result<(), DispatchError> {
        self.tx
            .send(Job::Decode(request))
            .map_err(|_| DispatchError::QueueClosed(self.index))
    }
}

/// Round-robin pool of decode workers.
#[derive(Debug)]
pub struct DispatchPool {
    queues: Vec<QueueHandle>,
    cursor: AtomicUsize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DispatchPool {
    /// Spawn `size` workers (at least one).
    pub fn new(size: usize) -> Result<Self, DispatchError> {
        let size = size.max(1);
        let mut queues = Vec::with_capacity(size);
        let mut workers = Vec::with_capacity(size);

        for index in 0..size {
            let (tx, rx) = mpsc::unbounded_channel();
            let worker = thread::Builder::new()
                .name(format!("utp-dispatch-{index}"))
                .spawn(move || run_worker(index, rx))?;
            queues.push(QueueHandle { index, tx });
            workers.push(worker);
        }

        Ok(Self {
            queues,
            cursor: AtomicUsize::new(0),
            workers: Mutex::new(workers),
        })
    }

    /// Number of queues.
    pub fn size(&self) -> usize {
        self.queues.len()
    }

    /// Next queue in round-robin order.
    pub fn acquire_queue(&self) -> QueueHandle {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.queues.len();
        self.queues[index].clone()
    }

    /// Submit to the next queue; returns the queue index used.
    pub fn dispatch(&self, request: DecodeRequest) -> Result<usize, DispatchError> {
        let queue = self.acquire_queue();
        queue.submit(request)?;
        Ok(queue.index())
    }

    /// Stop every worker after it finishes the requests already queued.
    ///
    /// Idempotent. Blocks until the workers have exited.
    pub fn shutdown(&self) {
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        if workers.is_empty() {
            return;
        }
        for queue in &self.queues {
            let _ = queue.tx.send(Job::Shutdown);
        }
        for worker in workers {
            if worker.join().is_err() {
                tracing::error!("Dispatch worker exited abnormally");
            }
        }
    }
}

impl Drop for DispatchPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(index: usize, mut rx: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = rx.blocking_recv() {
        let request = match job {
            Job::Decode(request) => request,
            Job::Shutdown => break,
        };

        let origin = request.origin;
        let DecodeRequest { bytes, decoder, .. } = request;
        let len = bytes.len();
        match panic::catch_unwind(AssertUnwindSafe(|| decoder.decode(bytes))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(
                    "Dispatch queue {} failed to decode {} bytes from {:?}: {}",
                    index,
                    len,
                    origin,
                    e
                );
            }
            Err(_) => {
                tracing::error!(
                    "Decoder panicked on dispatch queue {} ({} bytes from {:?})",
                    index,
                    len,
                    origin
                );
            }
        }
    }
    tracing::debug!("Dispatch queue {} stopped", index);
}
