//! Async tile loader with coarse-first concurrent fetching
//!
//! The loader owns a worker task that receives [`TileRequest`]s over a
//! channel, runs at most `max_concurrent` layer-stack requests at a time and
//! sends [`TileResponse`]s back. The caller drains responses with
//! [`TileLoader::poll_results`] (non-blocking) or [`TileLoader::next_result`],
//! so every tile-state transition happens on the caller's side.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::core::error::Error;
use crate::core::types::Result;
use crate::multires::tree::TileId;
use crate::streaming::fetch::{FetchError, TileFetcher};
use crate::streaming::request::{fetch_layer_stack, LayerError, LayerImage, RetryPolicy};

/// Default number of tiles fetched at the same time
pub const DEFAULT_MAX_CONCURRENT: usize = 16;

/// Request to fetch every layer of one tile
#[derive(Debug, Clone)]
pub struct TileRequest {
    pub id: TileId,
    /// One URL per data layer
    pub urls: Vec<String>,
    /// Scheduler epoch the request was issued in
    pub epoch: u64,
}

/// Settled tile fetch
#[derive(Debug)]
pub struct TileResponse {
    pub id: TileId,
    pub epoch: u64,
    /// Decoded layers by index; `None` where the layer failed
    pub layers: Vec<Option<LayerImage>>,
    pub errors: Vec<LayerError>,
}

impl TileResponse {
    /// At least one layer exhausted its retries
    pub fn is_failed(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Queue entry: coarser levels first, then request order
struct QueuedRequest {
    request: TileRequest,
    sequence: u64,
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .request
            .id
            .level
            .cmp(&self.request.id.level)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Concurrent tile loader
pub struct TileLoader {
    request_tx: mpsc::UnboundedSender<TileRequest>,
    result_rx: mpsc::UnboundedReceiver<TileResponse>,
    /// Requests sent whose response has not been received yet
    in_flight: usize,
    /// Dedicated runtime when not running inside the caller's
    runtime: Option<Runtime>,
}

impl TileLoader {
    /// Create a loader with its own multi-threaded runtime
    pub fn new(fetcher: Arc<dyn TileFetcher>, max_concurrent: usize, policy: RetryPolicy) -> Result<Self> {
        let runtime = Runtime::new()
            .map_err(|e| Error::Runtime(format!("failed to create tokio runtime: {e}")))?;

        let (request_tx, request_rx) = mpsc::unbounded_channel::<TileRequest>();
        let (result_tx, result_rx) = mpsc::unbounded_channel::<TileResponse>();

        runtime.spawn(Self::worker_loop(fetcher, max_concurrent, policy, request_rx, result_tx));

        Ok(Self { request_tx, result_rx, in_flight: 0, runtime: Some(runtime) })
    }

    /// Create a loader on the current tokio runtime.
    ///
    /// Panics if called outside a tokio runtime context.
    pub fn new_with_current_runtime(
        fetcher: Arc<dyn TileFetcher>,
        max_concurrent: usize,
        policy: RetryPolicy,
    ) -> Self {
        let (request_tx, request_rx) = mpsc::unbounded_channel::<TileRequest>();
        let (result_tx, result_rx) = mpsc::unbounded_channel::<TileResponse>();

        tokio::spawn(Self::worker_loop(fetcher, max_concurrent, policy, request_rx, result_tx));

        Self { request_tx, result_rx, in_flight: 0, runtime: None }
    }

    async fn worker_loop(
        fetcher: Arc<dyn TileFetcher>,
        max_concurrent: usize,
        policy: RetryPolicy,
        mut request_rx: mpsc::UnboundedReceiver<TileRequest>,
        result_tx: mpsc::UnboundedSender<TileResponse>,
    ) {
        let max_concurrent = max_concurrent.max(1);
        let mut active_tasks: JoinSet<TileResponse> = JoinSet::new();
        let mut queue: BinaryHeap<QueuedRequest> = BinaryHeap::new();
        let mut sequence = 0u64;

        loop {
            tokio::select! {
                Some(request) = request_rx.recv() => {
                    queue.push(QueuedRequest { request, sequence });
                    sequence += 1;
                }

                Some(joined) = active_tasks.join_next(), if !active_tasks.is_empty() => {
                    match joined {
                        Ok(response) => {
                            if result_tx.send(response).is_err() {
                                log::debug!("TileLoader: receiver dropped, stopping worker");
                                break;
                            }
                        }
                        Err(e) => log::error!("TileLoader: tile task failed to join: {}", e),
                    }
                }

                else => {
                    if queue.is_empty() && active_tasks.is_empty() {
                        break;
                    }
                }
            }

            while active_tasks.len() < max_concurrent {
                let Some(QueuedRequest { request, .. }) = queue.pop() else {
                    break;
                };
                let fetcher = Arc::clone(&fetcher);
                active_tasks.spawn(Self::load_tile_task(fetcher, request, policy));
            }
        }
    }

    /// Fetch one tile. A panic inside the fetch becomes a failed response,
    /// so the tile still settles.
    async fn load_tile_task(fetcher: Arc<dyn TileFetcher>, request: TileRequest, policy: RetryPolicy) -> TileResponse {
        let TileRequest { id, urls, epoch } = request;
        log::trace!("TileLoader: fetching tile {} ({} layers)", id, urls.len());

        let first_url = urls.first().cloned().unwrap_or_default();
        let stack = tokio::spawn(fetch_layer_stack(fetcher, urls, policy)).await;

        match stack {
            Ok(stack) => TileResponse { id, epoch, layers: stack.layers, errors: stack.errors },
            Err(e) => TileResponse {
                id,
                epoch,
                layers: Vec::new(),
                errors: vec![LayerError {
                    layer: 0,
                    url: first_url,
                    attempts: 0,
                    source: FetchError::Other(format!("tile task panicked: {e}")),
                }],
            },
        }
    }

    /// Queue a tile fetch. Returns `false` if the worker has stopped.
    pub fn request(&mut self, request: TileRequest) -> bool {
        match self.request_tx.send(request) {
            Ok(()) => {
                self.in_flight += 1;
                true
            }
            Err(_) => {
                log::error!("TileLoader: worker is not running");
                false
            }
        }
    }

    /// Drain every response available right now (non-blocking)
    pub fn poll_results(&mut self) -> Vec<TileResponse> {
        let mut results = Vec::new();
        while let Ok(response) = self.result_rx.try_recv() {
            results.push(response);
        }
        self.in_flight = self.in_flight.saturating_sub(results.len());
        results
    }

    /// Wait for the next response. Returns `None` when nothing is in flight.
    pub async fn next_result(&mut self) -> Option<TileResponse> {
        if self.in_flight == 0 {
            return None;
        }
        let response = self.result_rx.recv().await;
        if response.is_some() {
            self.in_flight -= 1;
        }
        response
    }

    /// Requests sent but not yet returned
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Whether the loader runs on its own runtime
    pub fn owns_runtime(&self) -> bool {
        self.runtime.is_some()
    }
}

impl Drop for TileLoader {
    fn drop(&mut self) {
        // Blocking shutdown would panic when dropped from async code
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
