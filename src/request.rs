//! Outbound request description and per-request lifecycle tracking.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use reqwest::Method;
use tokio::sync::Notify;

/// Bucket used when a request does not name one.
pub const DEFAULT_BUCKET: &str = "default";

/// Opaque identifier returned by `submit`. Handles are issued from a
/// monotonic sequence, so they also order requests by submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub(crate) u64);

impl Handle {
    pub fn seq(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A single REST call. Built by the caller, frozen on submit.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    /// Path relative to the API base URL, already percent-encoded, or an
    /// absolute `http(s)://` URL for endpoints hosted elsewhere.
    pub path: String,
    pub params: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<serde_json::Value>,
    pub bucket: String,
    /// Fail with `RateLimited` if no permit is granted within this window.
    pub permit_timeout: Option<Duration>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into().trim_start_matches('/').to_string(),
            params: BTreeMap::new(),
            headers: BTreeMap::new(),
            body: None,
            bucket: DEFAULT_BUCKET.to_string(),
            permit_timeout: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }

    pub fn with_permit_timeout(mut self, timeout: Duration) -> Self {
        self.permit_timeout = Some(timeout);
        self
    }

    /// Case-insensitive header lookup.
    pub fn has_header(&self, name: &str) -> bool {
        self.headers.keys().any(|k| k.eq_ignore_ascii_case(name))
    }

    pub fn is_absolute(&self) -> bool {
        self.path.starts_with("https://") || self.path.starts_with("http://")
    }

    /// Key used by the mock transport and in log lines, e.g. `GET users/44322889`.
    pub fn route_key(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

/// Lifecycle of a submitted request. Terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestState {
    Queued = 0,
    InFlight = 1,
    Succeeded = 2,
    Failed = 3,
    Cancelled = 4,
}

impl RequestState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => RequestState::Queued,
            1 => RequestState::InFlight,
            2 => RequestState::Succeeded,
            3 => RequestState::Failed,
            _ => RequestState::Cancelled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Succeeded | RequestState::Failed | RequestState::Cancelled
        )
    }
}

/// Shared state machine for one request, touched by the GUI thread (cancel)
/// and by worker tasks (dispatch, completion).
#[derive(Debug)]
pub(crate) struct Ticket {
    state: AtomicU8,
    cancelled: Notify,
}

impl Ticket {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(RequestState::Queued as u8),
            cancelled: Notify::new(),
        }
    }

    pub(crate) fn state(&self) -> RequestState {
        RequestState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state() == RequestState::Cancelled
    }

    /// `Queued -> InFlight`. Fails if the request was cancelled meanwhile.
    pub(crate) fn start(&self) -> bool {
        self.state
            .compare_exchange(
                RequestState::Queued as u8,
                RequestState::InFlight as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move from any non-terminal state to `to`. Returns false if another
    /// party already reached a terminal state.
    fn finish_as(&self, to: RequestState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if RequestState::from_u8(current).is_terminal() {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn complete(&self, success: bool) -> bool {
        self.finish_as(if success {
            RequestState::Succeeded
        } else {
            RequestState::Failed
        })
    }

    pub(crate) fn cancel(&self) -> bool {
        let changed = self.finish_as(RequestState::Cancelled);
        if changed {
            self.cancelled.notify_waiters();
        }
        changed
    }

    /// Resolves once the request is cancelled.
    pub(crate) async fn cancelled(&self) {
        loop {
            let notified = self.cancelled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_normalizes_path() {
        let r = Request::get("/users/1").with_param("limit", "10");
        assert_eq!(r.path, "users/1");
        assert_eq!(r.route_key(), "GET users/1");
        assert_eq!(r.bucket, DEFAULT_BUCKET);
        assert_eq!(r.params.get("limit").map(String::as_str), Some("10"));
    }

    #[test]
    fn header_lookup_ignores_case() {
        let r = Request::get("x").with_header("client-id", "abc");
        assert!(r.has_header("Client-ID"));
        assert!(!r.has_header("Authorization"));
    }

    #[test]
    fn ticket_terminal_states_are_final() {
        let t = Ticket::new();
        assert!(t.start());
        assert!(!t.start());
        assert!(t.complete(true));
        assert!(!t.cancel());
        assert!(!t.complete(false));
        assert_eq!(t.state(), RequestState::Succeeded);
    }

    #[test]
    fn cancelled_ticket_cannot_start() {
        let t = Ticket::new();
        assert!(t.cancel());
        assert!(!t.start());
        assert!(!t.complete(true));
        assert_eq!(t.state(), RequestState::Cancelled);
    }

    #[tokio::test]
    async fn cancelled_future_resolves_after_cancel() {
        let t = std::sync::Arc::new(Ticket::new());
        let waiter = {
            let t = t.clone();
            tokio::spawn(async move { t.cancelled().await })
        };
        tokio::task::yield_now().await;
        t.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("cancel wakes waiter")
            .unwrap();
    }
}
