//! Request queue and dispatch.
//!
//! Every bucket gets a lane: an unbounded FIFO channel drained by one task
//! that owns the bucket's [`RateLimiter`]. A lane takes entries strictly in
//! submission order, waits for a rate permit, then for a global concurrency
//! slot, and only then spawns the transport call. A bucket waiting for its
//! reset holds no slot, so it never holds up other buckets' lanes.
//!
//! Dropping the last [`Dispatcher`] clone shuts the lanes down: entries that
//! have not started fail with [`ApiError::Shutdown`], in-flight calls run to
//! completion.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use tokio::runtime::Handle as RuntimeHandle;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::backoff::Backoff;
use crate::bridge::Poster;
use crate::config::Config;
use crate::error::ApiError;
use crate::http::Transport;
use crate::ratelimit::{Permit, RateLimitHeaders, RateLimitState, RateLimiter};
use crate::request::{Handle, Request, Ticket};
use crate::types::Outcome;

/// A submitted request while it is owned by the dispatcher.
#[derive(Debug)]
pub struct QueueEntry {
    pub handle: Handle,
    pub request: Arc<Request>,
    pub submitted_at: Instant,
    pub retries: u32,
    pub(crate) ticket: Arc<Ticket>,
}

impl QueueEntry {
    pub(crate) fn new(handle: Handle, request: Request) -> Self {
        Self {
            handle,
            request: Arc::new(request),
            submitted_at: Instant::now(),
            retries: 0,
            ticket: Arc::new(Ticket::new()),
        }
    }

    pub(crate) fn ticket(&self) -> Arc<Ticket> {
        self.ticket.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    pub default_headers: RateLimitHeaders,
    /// Buckets with their own quota header names.
    pub buckets: HashMap<String, RateLimitHeaders>,
}

impl DispatchSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_concurrency: cfg.max_concurrency,
            retry: RetryPolicy {
                max_retries: cfg.max_retries,
                backoff: cfg.backoff(),
            },
            default_headers: cfg.rate_limit_headers.clone(),
            buckets: HashMap::new(),
        }
    }
}

// Shared by every lane. Holds no lane senders, so dropping the dispatcher
// closes all lanes.
struct Worker {
    transport: Arc<dyn Transport>,
    slots: Arc<Semaphore>,
    retry: RetryPolicy,
    poster: Poster,
}

struct Lane {
    tx: mpsc::UnboundedSender<QueueEntry>,
    limiter: Arc<RateLimiter>,
}

struct Shared {
    worker: Arc<Worker>,
    lanes: Mutex<HashMap<String, Lane>>,
    default_headers: RateLimitHeaders,
    bucket_headers: HashMap<String, RateLimitHeaders>,
    runtime: RuntimeHandle,
    shutdown: watch::Sender<bool>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        self.worker.slots.close();
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        settings: DispatchSettings,
        runtime: RuntimeHandle,
        poster: Poster,
    ) -> Self {
        let worker = Arc::new(Worker {
            transport,
            slots: Arc::new(Semaphore::new(settings.max_concurrency.max(1))),
            retry: settings.retry,
            poster,
        });
        Self {
            shared: Arc::new(Shared {
                worker,
                lanes: Mutex::new(HashMap::new()),
                default_headers: settings.default_headers,
                bucket_headers: settings.buckets,
                runtime,
                shutdown: watch::channel(false).0,
            }),
        }
    }

    /// Hand an entry to its bucket's lane.
    pub fn submit(&self, entry: QueueEntry) {
        debug!(
            "request {}: queued {} on bucket {}",
            entry.handle,
            entry.request.route_key(),
            entry.request.bucket
        );
        let tx = self.lane_sender(&entry.request.bucket);
        if let Err(mpsc::error::SendError(entry)) = tx.send(entry) {
            self.shared.worker.finish(&entry, Err(ApiError::Shutdown));
        }
    }

    pub fn rate_limit(&self, bucket: &str) -> Option<RateLimitState> {
        self.shared
            .lanes
            .lock()
            .get(bucket)
            .map(|lane| lane.limiter.snapshot())
    }

    pub fn limiter(&self, bucket: &str) -> Option<Arc<RateLimiter>> {
        self.shared
            .lanes
            .lock()
            .get(bucket)
            .map(|lane| lane.limiter.clone())
    }

    fn lane_sender(&self, bucket: &str) -> mpsc::UnboundedSender<QueueEntry> {
        let mut lanes = self.shared.lanes.lock();
        if let Some(lane) = lanes.get(bucket) {
            return lane.tx.clone();
        }
        let headers = self
            .shared
            .bucket_headers
            .get(bucket)
            .unwrap_or(&self.shared.default_headers)
            .clone();
        let limiter = Arc::new(RateLimiter::new(
            bucket,
            headers,
            self.shared.worker.retry.backoff,
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        debug!("bucket {}: starting lane", bucket);
        self.shared.runtime.spawn(run_lane(
            self.shared.worker.clone(),
            limiter.clone(),
            rx,
            self.shared.shutdown.subscribe(),
        ));
        lanes.insert(
            bucket.to_string(),
            Lane {
                tx: tx.clone(),
                limiter,
            },
        );
        tx
    }
}

async fn run_lane(
    worker: Arc<Worker>,
    limiter: Arc<RateLimiter>,
    mut rx: mpsc::UnboundedReceiver<QueueEntry>,
    mut shutdown: watch::Receiver<bool>,
) {
    while let Some(entry) = rx.recv().await {
        if entry.ticket.is_cancelled() {
            debug!("request {}: cancelled while queued", entry.handle);
            continue;
        }
        if *shutdown.borrow() {
            worker.finish(&entry, Err(ApiError::Shutdown));
            continue;
        }

        let permit = tokio::select! {
            permit = limiter.acquire_within(entry.request.permit_timeout) => permit,
            _ = entry.ticket.cancelled() => continue,
            // Fires on the shutdown flag, or once the sender is dropped.
            _ = shutdown.changed() => Err(ApiError::Shutdown),
        };
        let permit = match permit {
            Ok(permit) => permit,
            Err(e) => {
                worker.finish(&entry, Err(e));
                continue;
            }
        };

        let slot = tokio::select! {
            slot = worker.slots.clone().acquire_owned() => slot.ok(),
            _ = entry.ticket.cancelled() => {
                limiter.restore(permit);
                continue;
            }
        };
        let Some(slot) = slot else {
            limiter.restore(permit);
            worker.finish(&entry, Err(ApiError::Shutdown));
            continue;
        };

        if !entry.ticket.start() {
            limiter.restore(permit);
            continue;
        }
        debug!(
            "request {}: dispatching after {:?} queued",
            entry.handle,
            entry.submitted_at.elapsed()
        );
        tokio::spawn(execute(worker.clone(), limiter.clone(), entry, slot, permit));
    }
    debug!("bucket {}: lane closed", limiter.bucket());
}

async fn execute(
    worker: Arc<Worker>,
    limiter: Arc<RateLimiter>,
    mut entry: QueueEntry,
    _slot: OwnedSemaphorePermit,
    permit: Permit,
) {
    let ticket = entry.ticket();
    let outcome = tokio::select! {
        outcome = worker.attempt(&limiter, &mut entry, permit) => outcome,
        // The transport future is dropped here; bytes already on the wire are not recalled.
        _ = ticket.cancelled() => Err(ApiError::Cancelled),
    };
    worker.finish(&entry, outcome);
}

// Hands the permit of one transport call back to the limiter, also when the
// call is abandoned mid-flight.
struct InFlight<'a> {
    limiter: &'a RateLimiter,
    permit: Option<Permit>,
}

impl<'a> InFlight<'a> {
    fn new(limiter: &'a RateLimiter, permit: Permit) -> Self {
        Self {
            limiter,
            permit: Some(permit),
        }
    }

    fn observe(mut self, status: u16, headers: &HeaderMap) {
        if let Some(permit) = self.permit.take() {
            self.limiter.observe(permit, status, headers);
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.limiter.settle(permit);
        }
    }
}

impl Worker {
    async fn attempt(
        &self,
        limiter: &RateLimiter,
        entry: &mut QueueEntry,
        mut permit: Permit,
    ) -> Outcome {
        let mut last_delay = Duration::ZERO;
        loop {
            let call = InFlight::new(limiter, permit);
            let result = match self.transport.send(&entry.request).await {
                Ok(response) => {
                    call.observe(response.status.as_u16(), &response.headers);
                    response.into_payload()
                }
                Err(e) => {
                    drop(call);
                    Err(e)
                }
            };
            let err = match result {
                Ok(payload) => return Ok(payload),
                Err(e) => e,
            };

            let recoverable = err.is_transient() || err.is_too_many_requests();
            if !recoverable || entry.retries >= self.retry.max_retries {
                if recoverable {
                    warn!(
                        "request {}: giving up after {} retries",
                        entry.handle, entry.retries
                    );
                }
                return Err(err);
            }

            if err.is_transient() {
                let delay = self.retry.backoff.delay(entry.retries).max(last_delay);
                last_delay = delay;
                warn!(
                    "request {}: {} (retry {}/{}), backing off {:?}",
                    entry.handle,
                    err,
                    entry.retries + 1,
                    self.retry.max_retries,
                    delay
                );
                tokio::time::sleep(delay).await;
            } else {
                warn!(
                    "request {}: rate limited on bucket {}, requeueing",
                    entry.handle,
                    limiter.bucket()
                );
            }
            entry.retries += 1;
            permit = limiter
                .acquire_within(entry.request.permit_timeout)
                .await?;
        }
    }

    fn finish(&self, entry: &QueueEntry, outcome: Outcome) {
        if matches!(outcome, Err(ApiError::Cancelled)) || !entry.ticket.complete(outcome.is_ok()) {
            debug!("request {}: cancelled, result discarded", entry.handle);
            return;
        }
        match &outcome {
            Ok(payload) => info!(
                "request {}: {} -> {} in {:?}",
                entry.handle,
                entry.request.route_key(),
                payload.status,
                entry.submitted_at.elapsed()
            ),
            Err(e) => warn!(
                "request {}: {} failed: {}",
                entry.handle,
                entry.request.route_key(),
                e
            ),
        }
        self.poster.deliver(entry.handle, outcome);
    }
}
