//! Twitch v5 REST client for single-threaded GUI event loops.
//!
//! Requests are queued per rate-limit bucket, gated by quota headers,
//! executed on tokio worker threads, and their results handed back to the
//! thread that owns the [`TwitchClient`], where the caller's callbacks run.

pub mod backoff;
pub mod bridge;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod endpoints;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod request;
pub mod types;

pub use client::{ClientBuilder, TwitchClient};
pub use config::Config;
pub use error::{ApiError, Result};
pub use request::{Handle, Request, RequestState};
pub use types::{ErrorInfo, Outcome, Payload};
