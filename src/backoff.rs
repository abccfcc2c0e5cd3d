use std::time::Duration;

/// Exponential backoff: `base * 2^attempt`, capped.
///
/// With jitter enabled up to half of the exponential delay is added before
/// capping. Successive delays stay non-decreasing either way, since the
/// jittered value `1.5 * base * 2^n` is below the next step `base * 2^(n+1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    pub jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base.as_millis() as u64;
        let cap = self.cap.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << attempt.min(32)).min(cap);
        let jitter = if self.jitter && exp > 0 {
            fastrand::u64(0..=exp / 2)
        } else {
            0
        };
        Duration::from_millis(exp.saturating_add(jitter).min(cap))
    }
}
