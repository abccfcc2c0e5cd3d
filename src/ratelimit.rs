//! Per-bucket rate limiting driven by response headers.
//!
//! Each bucket owns one [`RateLimiter`]. Only the limiter mutates its
//! [`RateLimitState`], always under its lock; the dispatcher feeds it the
//! headers of every response it sees. Waiters queue behind a FIFO turn lock,
//! so permits are handed out in the order `acquire` was called.
//!
//! A granted [`Permit`] stays outstanding until it is handed back through
//! [`RateLimiter::observe`], [`RateLimiter::settle`] or
//! [`RateLimiter::restore`]. Server counts do not include requests still in
//! flight, so outstanding permits are subtracted from every reported
//! `remaining`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as TurnLock, Notify};
use tokio::time::Instant;

use crate::backoff::Backoff;
use crate::error::{ApiError, Result};

/// Names of the headers carrying quota information. Twitch exposes the same
/// triple under different prefixes for feature-specific buckets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitHeaders {
    pub limit: String,
    pub remaining: String,
    pub reset: String,
}

impl RateLimitHeaders {
    /// `<prefix>-Limit`, `<prefix>-Remaining`, `<prefix>-Reset`.
    pub fn prefixed(prefix: &str) -> Self {
        Self {
            limit: format!("{prefix}-Limit"),
            remaining: format!("{prefix}-Remaining"),
            reset: format!("{prefix}-Reset"),
        }
    }
}

impl Default for RateLimitHeaders {
    fn default() -> Self {
        Self::prefixed("Ratelimit")
    }
}

/// Quota snapshot for one bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitState {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_at: Option<DateTime<Utc>>,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn header_count(headers: &HeaderMap, name: &str) -> Option<u32> {
    header_str(headers, name)
        .and_then(|s| s.parse::<i64>().ok())
        .map(|n| n.clamp(0, u32::MAX as i64) as u32)
}

/// Read quota headers. Reset is a Unix timestamp in (possibly fractional) seconds.
pub fn extract_rate(headers: &HeaderMap, names: &RateLimitHeaders) -> RateLimitState {
    let limit = header_count(headers, &names.limit);
    let remaining = header_count(headers, &names.remaining);
    let reset_at = header_str(headers, &names.reset)
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .and_then(|secs| {
            let whole = secs.trunc() as i64;
            let nanos = (secs.fract() * 1e9) as u32;
            DateTime::<Utc>::from_timestamp(whole, nanos)
        });
    RateLimitState {
        limit,
        remaining,
        reset_at,
    }
}

/// `Retry-After` as delta-seconds or an HTTP-date. A date in the past
/// yields zero.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = header_str(headers, RETRY_AFTER.as_str())?;
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    DateTime::parse_from_rfc2822(raw)
        .ok()
        .map(|at| (at.with_timezone(&Utc) - Utc::now()).to_std().unwrap_or(Duration::ZERO))
}

fn deadline_for(at: DateTime<Utc>) -> Instant {
    let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    Instant::now() + wait
}

/// Authorization for one request to proceed. Must be handed back to the
/// limiter that granted it.
#[must_use]
#[derive(Debug, PartialEq, Eq)]
pub struct Permit {
    /// Quota left after this permit, when known.
    pub remaining: Option<u32>,
    window: u64,
}

#[derive(Debug, Default)]
struct Window {
    state: RateLimitState,
    reset_deadline: Option<Instant>,
    blocked_until: Option<Instant>,
    strikes: u32,
    /// Permits granted whose request has not reported back yet.
    outstanding: u32,
    /// Bumped on every roll-over.
    generation: u64,
}

impl Window {
    fn roll_over(&mut self) {
        self.state.remaining = self.state.limit;
        self.state.reset_at = None;
        self.reset_deadline = None;
        self.generation += 1;
    }

    fn release(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    // Err carries the instant worth re-checking at.
    fn try_grant(&mut self, now: Instant, fallback_window: Duration) -> std::result::Result<Permit, Instant> {
        if let Some(until) = self.blocked_until {
            if until > now {
                return Err(until);
            }
            self.blocked_until = None;
        }
        if self.reset_deadline.is_some_and(|d| d <= now) {
            self.roll_over();
        }
        let remaining = match self.state.remaining {
            None => None,
            Some(0) => return Err(*self.reset_deadline.get_or_insert(now + fallback_window)),
            Some(n) => Some(n - 1),
        };
        self.state.remaining = remaining;
        self.outstanding += 1;
        Ok(Permit {
            remaining,
            window: self.generation,
        })
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    bucket: String,
    headers: RateLimitHeaders,
    backoff: Backoff,
    window: Mutex<Window>,
    turn: TurnLock<()>,
    changed: Notify,
}

impl RateLimiter {
    pub fn new(bucket: impl Into<String>, headers: RateLimitHeaders, backoff: Backoff) -> Self {
        Self {
            bucket: bucket.into(),
            headers,
            backoff,
            window: Mutex::new(Window::default()),
            turn: TurnLock::new(()),
            changed: Notify::new(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn snapshot(&self) -> RateLimitState {
        self.window.lock().state.clone()
    }

    /// Time left on a 429 penalty, if one is active.
    pub fn blocked_for(&self) -> Option<Duration> {
        let now = Instant::now();
        self.window
            .lock()
            .blocked_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    /// Wait until a permit is available.
    pub async fn acquire(&self) -> Permit {
        let _turn = self.turn.lock().await;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let granted = self.window.lock().try_grant(Instant::now(), self.backoff.cap);
            let deadline = match granted {
                Ok(permit) => return permit,
                Err(deadline) => deadline,
            };
            debug!(
                "bucket {}: no quota, next check in {:?}",
                self.bucket,
                deadline.saturating_duration_since(Instant::now())
            );
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = &mut notified => {}
            }
        }
    }

    /// Like [`acquire`](Self::acquire), but gives up with `RateLimited`
    /// after `timeout`.
    pub async fn acquire_within(&self, timeout: Option<Duration>) -> Result<Permit> {
        match timeout {
            None => Ok(self.acquire().await),
            Some(limit) => tokio::time::timeout(limit, self.acquire())
                .await
                .map_err(|_| ApiError::RateLimited(limit)),
        }
    }

    /// Fold quota headers from a response into the bucket state. The
    /// reported `remaining` is reduced by the permits still outstanding.
    pub fn update(&self, headers: &HeaderMap) {
        let seen = extract_rate(headers, &self.headers);
        if seen == RateLimitState::default() {
            return;
        }
        {
            let mut w = self.window.lock();
            if seen.limit.is_some() {
                w.state.limit = seen.limit;
            }
            if let Some(reported) = seen.remaining {
                w.state.remaining = Some(reported.saturating_sub(w.outstanding));
            }
            if let Some(at) = seen.reset_at {
                w.state.reset_at = Some(at);
                w.reset_deadline = Some(deadline_for(at));
            }
            debug!(
                "bucket {}: remaining={:?} limit={:?} reset_at={:?} outstanding={}",
                self.bucket, w.state.remaining, w.state.limit, w.state.reset_at, w.outstanding
            );
        }
        self.changed.notify_waiters();
    }

    /// Block the bucket after a 429. The wait is `Retry-After` when given,
    /// else the known reset time, else exponential backoff over consecutive
    /// 429s. Returns the wait applied.
    pub fn penalize(&self, headers: &HeaderMap) -> Duration {
        let now = Instant::now();
        let mut w = self.window.lock();
        w.strikes = w.strikes.saturating_add(1);
        let wait = retry_after(headers)
            .or_else(|| w.reset_deadline.filter(|d| *d > now).map(|d| d - now))
            .unwrap_or_else(|| self.backoff.delay(w.strikes - 1));
        let until = now + wait;
        w.blocked_until = Some(w.blocked_until.map_or(until, |b| b.max(until)));
        warn!(
            "bucket {}: 429 received (strike {}), blocking for {:?}",
            self.bucket, w.strikes, wait
        );
        wait
    }

    /// Record the response to a permitted request: headers always, penalty
    /// on 429, strike reset otherwise.
    pub fn observe(&self, permit: Permit, status: u16, headers: &HeaderMap) -> Option<Duration> {
        self.settle(permit);
        self.update(headers);
        if status == 429 {
            Some(self.penalize(headers))
        } else {
            self.window.lock().strikes = 0;
            None
        }
    }

    /// The request ended without a response. Its quota is assumed spent.
    pub fn settle(&self, _permit: Permit) {
        self.window.lock().release();
    }

    /// The permit was never used; give its quota back to the window it came from.
    pub fn restore(&self, permit: Permit) {
        {
            let mut w = self.window.lock();
            w.release();
            if permit.window == w.generation {
                let cap = w.state.limit.unwrap_or(u32::MAX);
                if let Some(n) = w.state.remaining.as_mut() {
                    *n = n.saturating_add(1).min(cap);
                }
            }
            debug!("bucket {}: unused permit returned, remaining={:?}", self.bucket, w.state.remaining);
        }
        self.changed.notify_waiters();
    }
}
