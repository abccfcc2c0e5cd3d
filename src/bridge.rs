//! Delivery of results from worker tasks onto the GUI thread.
//!
//! Workers hold a [`Poster`] and push finished results into a channel. The
//! GUI thread owns the [`EventBridge`], registers one callback per handle and
//! drains the channel once per loop iteration (`process_pending`) or blocks
//! briefly on it (`wait`). The bridge is `!Send`: callbacks always run on the
//! thread that created it, and may capture thread-bound GUI state.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};

use crate::request::Handle;
use crate::types::Outcome;

/// Called after every post so an idle GUI loop can be woken up.
pub type WakeFn = Arc<dyn Fn() + Send + Sync>;

type Callback = Box<dyn FnOnce(Outcome)>;

/// A finished request travelling to the GUI thread.
#[derive(Debug)]
pub struct Delivery {
    pub handle: Handle,
    pub outcome: Outcome,
}

/// Worker-side end of the bridge.
#[derive(Clone)]
pub struct Poster {
    tx: Sender<Delivery>,
    wake: Option<WakeFn>,
}

impl Poster {
    /// Queue `outcome` for delivery. Returns false if the GUI side is gone.
    pub fn deliver(&self, handle: Handle, outcome: Outcome) -> bool {
        let sent = self.tx.send(Delivery { handle, outcome }).is_ok();
        if sent {
            if let Some(wake) = &self.wake {
                wake();
            }
        } else {
            debug!("request {}: GUI side dropped, result discarded", handle);
        }
        sent
    }
}

/// GUI-side end of the bridge.
pub struct EventBridge {
    rx: Receiver<Delivery>,
    callbacks: HashMap<Handle, Callback>,
    _not_send: PhantomData<Rc<()>>,
}

impl EventBridge {
    pub fn new(wake: Option<WakeFn>) -> (Self, Poster) {
        let (tx, rx) = mpsc::channel();
        let bridge = Self {
            rx,
            callbacks: HashMap::new(),
            _not_send: PhantomData,
        };
        (bridge, Poster { tx, wake })
    }

    pub fn register<F>(&mut self, handle: Handle, callback: F)
    where
        F: FnOnce(Outcome) + 'static,
    {
        self.callbacks.insert(handle, Box::new(callback));
    }

    /// Drop the callback for `handle`. Returns true if one was pending, in
    /// which case it is guaranteed never to run.
    pub fn forget(&mut self, handle: Handle) -> bool {
        self.callbacks.remove(&handle).is_some()
    }

    pub fn is_pending(&self, handle: Handle) -> bool {
        self.callbacks.contains_key(&handle)
    }

    pub fn pending(&self) -> usize {
        self.callbacks.len()
    }

    /// Run the callback for one delivery. Results for forgotten or unknown
    /// handles are dropped.
    pub fn dispatch(&mut self, delivery: Delivery) -> bool {
        match self.callbacks.remove(&delivery.handle) {
            Some(callback) => {
                trace!("request {}: invoking callback", delivery.handle);
                callback(delivery.outcome);
                true
            }
            None => {
                debug!("request {}: no callback registered, dropping result", delivery.handle);
                false
            }
        }
    }

    /// Invoke callbacks for everything already delivered. Never blocks.
    pub fn process_pending(&mut self) -> usize {
        let mut invoked = 0;
        while let Ok(delivery) = self.rx.try_recv() {
            if self.dispatch(delivery) {
                invoked += 1;
            }
        }
        invoked
    }

    /// Block up to `timeout` for the first delivery, then drain the rest.
    pub fn wait(&mut self, timeout: Duration) -> usize {
        match self.rx.recv_timeout(timeout) {
            Ok(first) => {
                let invoked = usize::from(self.dispatch(first));
                invoked + self.process_pending()
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => 0,
        }
    }
}
