//! GUI-thread facade tying the dispatcher and the event bridge together.
//!
//! ```no_run
//! use twitch_bridge::{Config, ClientBuilder, Request};
//! use std::time::Duration;
//!
//! let mut client = ClientBuilder::new(Config::new("my-client-id")).build()?;
//! client.submit(Request::get("games/top"), |outcome| match outcome {
//!     Ok(payload) => println!("{}", payload.body),
//!     Err(e) => eprintln!("{}", e),
//! });
//! // Inside the GUI loop, once per tick:
//! while client.pending() > 0 {
//!     client.wait_for_events(Duration::from_millis(16));
//! }
//! # Ok::<(), twitch_bridge::ApiError>(())
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::runtime::{Builder as RuntimeBuilder, Handle as RuntimeHandle, Runtime};

use crate::bridge::{EventBridge, WakeFn};
use crate::config::Config;
use crate::dispatcher::{DispatchSettings, Dispatcher, QueueEntry};
use crate::endpoints;
use crate::error::{ApiError, Result};
use crate::http::{ReqwestTransport, Transport};
use crate::ratelimit::{RateLimitHeaders, RateLimitState};
use crate::request::{Handle, Request, RequestState, Ticket};
use crate::types::Outcome;

pub struct ClientBuilder {
    config: Config,
    transport: Option<Arc<dyn Transport>>,
    runtime: Option<RuntimeHandle>,
    buckets: HashMap<String, RateLimitHeaders>,
    wake: Option<WakeFn>,
}

impl ClientBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            transport: None,
            runtime: None,
            buckets: HashMap::new(),
            wake: None,
        }
    }

    /// Replace the reqwest transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Run workers on an existing tokio runtime instead of an owned one.
    pub fn runtime(mut self, handle: RuntimeHandle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Register a bucket whose quota is reported under its own header names.
    pub fn bucket(mut self, name: impl Into<String>, headers: RateLimitHeaders) -> Self {
        self.buckets.insert(name.into(), headers);
        self
    }

    /// Called from worker threads whenever a result is ready.
    pub fn on_wake<F>(mut self, wake: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.wake = Some(Arc::new(wake));
        self
    }

    pub fn build(self) -> Result<TwitchClient> {
        self.config.validate()?;
        let transport = match self.transport {
            Some(t) => t,
            None => Arc::new(ReqwestTransport::new(&self.config)?),
        };
        let (owned, handle) = match self.runtime {
            Some(handle) => (None, handle),
            None => {
                let rt = RuntimeBuilder::new_multi_thread()
                    .worker_threads(self.config.worker_threads)
                    .thread_name("twitch-worker")
                    .enable_all()
                    .build()
                    .map_err(|e| ApiError::Config(format!("failed to start runtime: {}", e)))?;
                let handle = rt.handle().clone();
                (Some(rt), handle)
            }
        };

        let (bridge, poster) = EventBridge::new(self.wake);
        let mut settings = DispatchSettings::from_config(&self.config);
        settings.buckets = self.buckets;
        let dispatcher = Dispatcher::new(transport, settings, handle, poster);

        Ok(TwitchClient {
            dispatcher,
            bridge,
            tickets: HashMap::new(),
            next_seq: 0,
            permit_timeout: self.config.permit_timeout(),
            runtime: owned,
        })
    }
}

/// Lives on the GUI thread. Not `Send`: callbacks run where the client lives.
pub struct TwitchClient {
    dispatcher: Dispatcher,
    bridge: EventBridge,
    tickets: HashMap<Handle, Arc<Ticket>>,
    next_seq: u64,
    permit_timeout: Option<Duration>,
    // Declared last so lanes and channels are gone before the runtime stops.
    runtime: Option<Runtime>,
}

impl TwitchClient {
    /// Queue a request; `callback` runs on this thread with its result.
    pub fn submit<F>(&mut self, mut request: Request, callback: F) -> Handle
    where
        F: FnOnce(Outcome) + 'static,
    {
        self.next_seq += 1;
        let handle = Handle(self.next_seq);
        if request.permit_timeout.is_none() {
            request.permit_timeout = self.permit_timeout;
        }
        let entry = QueueEntry::new(handle, request);
        self.tickets.insert(handle, entry.ticket());
        self.bridge.register(handle, callback);
        self.dispatcher.submit(entry);
        handle
    }

    /// Submit through the endpoint table.
    pub fn call<F>(
        &mut self,
        endpoint: &str,
        args: &BTreeMap<String, String>,
        params: BTreeMap<String, String>,
        callback: F,
    ) -> Result<Handle>
    where
        F: FnOnce(Outcome) + 'static,
    {
        let template = endpoints::lookup(endpoint)
            .ok_or_else(|| ApiError::InvalidRequest(format!("unknown endpoint `{}`", endpoint)))?;
        let request = template.bind(args, params)?;
        Ok(self.submit(request, callback))
    }

    /// Returns true when the callback is guaranteed never to run. A request
    /// already on the wire is abandoned, not aborted.
    pub fn cancel(&mut self, handle: Handle) -> bool {
        if let Some(ticket) = self.tickets.remove(&handle) {
            ticket.cancel();
        }
        let forgotten = self.bridge.forget(handle);
        if forgotten {
            debug!("request {}: cancelled", handle);
        }
        forgotten
    }

    /// `None` once the result has been delivered (or for unknown handles).
    pub fn state(&self, handle: Handle) -> Option<RequestState> {
        self.tickets.get(&handle).map(|t| t.state())
    }

    /// Requests whose callback has not run yet.
    pub fn pending(&self) -> usize {
        self.bridge.pending()
    }

    /// Run callbacks for every result already available. Never blocks.
    pub fn process_events(&mut self) -> usize {
        let n = self.bridge.process_pending();
        self.prune();
        n
    }

    /// Block up to `timeout` for a result, then run all available callbacks.
    pub fn wait_for_events(&mut self, timeout: Duration) -> usize {
        let n = self.bridge.wait(timeout);
        self.prune();
        n
    }

    pub fn rate_limit(&self, bucket: &str) -> Option<RateLimitState> {
        self.dispatcher.rate_limit(bucket)
    }

    pub fn owns_runtime(&self) -> bool {
        self.runtime.is_some()
    }

    fn prune(&mut self) {
        let bridge = &self.bridge;
        self.tickets.retain(|handle, _| bridge.is_pending(*handle));
    }
}
