//! Scriptable transport for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::{Response, Transport};
use crate::error::{ApiError, Result};
use crate::request::Request;

enum MockReply {
    Immediate(Result<Response>),
    Delayed(Duration, Result<Response>),
    /// Completes once the paired sender fires or is dropped.
    Triggered(oneshot::Receiver<()>, Result<Response>),
}

/// Record of a call made to the mock.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub route: String,
    pub request: Request,
    pub at: Instant,
    pub thread: std::thread::ThreadId,
}

/// Replies are scripted per route key (`"GET users/1"`) and consumed FIFO.
/// An unscripted route fails with a `Network` error.
#[derive(Clone, Default)]
pub struct MockTransport {
    replies: Arc<Mutex<HashMap<String, VecDeque<MockReply>>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, route: &str, reply: MockReply) {
        self.replies
            .lock()
            .entry(route.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn add_response(&self, route: &str, reply: Result<Response>) {
        self.push(route, MockReply::Immediate(reply));
    }

    pub fn add_delayed_response(&self, route: &str, delay: Duration, reply: Result<Response>) {
        self.push(route, MockReply::Delayed(delay, reply));
    }

    /// The call blocks until the returned sender is used or dropped.
    pub fn add_response_with_trigger(
        &self,
        route: &str,
        reply: Result<Response>,
    ) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.push(route, MockReply::Triggered(rx, reply));
        tx
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_for(&self, route: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.route == route).count()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent `send` calls observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    async fn respond(&self, request: &Request) -> Result<Response> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(self.in_flight.clone());

        let route = request.route_key();
        self.calls.lock().push(MockCall {
            route: route.clone(),
            request: request.clone(),
            at: Instant::now(),
            thread: std::thread::current().id(),
        });

        let reply = self
            .replies
            .lock()
            .get_mut(&route)
            .and_then(|queue| queue.pop_front());
        match reply {
            Some(MockReply::Immediate(r)) => r,
            Some(MockReply::Delayed(delay, r)) => {
                tokio::time::sleep(delay).await;
                r
            }
            Some(MockReply::Triggered(rx, r)) => {
                let _ = rx.await;
                r
            }
            None => Err(ApiError::Network(format!("no mock response for {}", route))),
        }
    }
}

impl Transport for MockTransport {
    fn send<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>> {
        self.respond(request).boxed()
    }
}
