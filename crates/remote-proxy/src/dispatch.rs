//! Single-consumer dispatch context.
//!
//! Every event that enters the proxy is posted here and delivered to the
//! subscribed handlers one at a time, in post order, on one tokio task.
//! `post` is callable from any thread; handlers never run concurrently with
//! each other.
//!
//! ```text
//! transport thread ─┐
//! timer task ───────┼─► post ─► [unbounded mpsc] ─► drain task ─► handler 1
//! facade call ──────┘                                          └─► handler 2
//! ```

use crate::error::{ProxyError, ProxyResult};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

/// Identifies one handler registered on a [`DispatchContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

/// Receives events on the dispatch task.
///
/// An `Err` or a panic is logged and does not stop delivery to the other
/// handlers.
pub trait EventHandler<E>: Send {
    fn handle(&mut self, event: &E) -> anyhow::Result<()>;
}

impl<E, F> EventHandler<E> for F
where
    F: FnMut(&E) -> anyhow::Result<()> + Send,
{
    fn handle(&mut self, event: &E) -> anyhow::Result<()> {
        self(event)
    }
}

enum Envelope<E> {
    Event(E),
    Subscribe(HandlerId, Box<dyn EventHandler<E>>),
    Unsubscribe(HandlerId),
    Close,
}

/// Cloneable handle to a running dispatch task.
pub struct DispatchContext<E> {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Envelope<E>>,
    next_handler: Arc<AtomicU64>,
}

impl<E> Clone for DispatchContext<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
            next_handler: self.next_handler.clone(),
        }
    }
}

impl<E: Send + 'static> DispatchContext<E> {
    /// Spawn the drain task on the current tokio runtime.
    pub fn spawn(name: impl Into<Arc<str>>) -> (Self, JoinHandle<()>) {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(drain(name.clone(), rx));

        let context = Self {
            name,
            tx,
            next_handler: Arc::new(AtomicU64::new(1)),
        };
        (context, task)
    }

    /// Queue an event for delivery. Never blocks.
    pub fn post(&self, event: E) -> ProxyResult<()> {
        self.tx
            .send(Envelope::Event(event))
            .map_err(|_| ProxyError::Aborted)
    }

    /// Register a handler. It sees every event posted after this call.
    pub fn subscribe<H>(&self, handler: H) -> ProxyResult<HandlerId>
    where
        H: EventHandler<E> + 'static,
    {
        let id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
        self.tx
            .send(Envelope::Subscribe(id, Box::new(handler)))
            .map_err(|_| ProxyError::Aborted)?;
        Ok(id)
    }

    /// Deregister a handler. Events posted before this call still reach it.
    pub fn unsubscribe(&self, id: HandlerId) -> ProxyResult<()> {
        self.tx
            .send(Envelope::Unsubscribe(id))
            .map_err(|_| ProxyError::Aborted)
    }

    /// Stop the drain task once everything posted before this call has been
    /// delivered. Later posts fail with [`ProxyError::Aborted`].
    pub fn close(&self) {
        if self.tx.send(Envelope::Close).is_err() {
            trace!(context = %self.name, "Dispatch context already closed");
        }
    }

    /// True once the drain task has stopped accepting events.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Run a caller-supplied callback on the dispatch task, containing panics so
/// proxy state stays consistent.
pub(crate) fn run_guarded<F: FnOnce()>(callback: &'static str, f: F) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(_) => {
            error!(callback, "Callback panicked");
            false
        }
    }
}

async fn drain<E>(name: Arc<str>, mut rx: mpsc::UnboundedReceiver<Envelope<E>>) {
    let mut handlers: Vec<(HandlerId, Box<dyn EventHandler<E>>)> = Vec::new();
    let mut delivered: u64 = 0;

    debug!(context = %name, "Dispatch context started");

    while let Some(envelope) = rx.recv().await {
        match envelope {
            Envelope::Event(event) => {
                delivered += 1;
                deliver(&name, &mut handlers, &event);
            }
            Envelope::Subscribe(id, handler) => {
                trace!(context = %name, handler = %id, "Handler subscribed");
                handlers.push((id, handler));
            }
            Envelope::Unsubscribe(id) => {
                handlers.retain(|(existing, _)| *existing != id);
                trace!(context = %name, handler = %id, "Handler unsubscribed");
            }
            Envelope::Close => break,
        }
    }

    // Refuse further posts, then deliver whatever was accepted before that.
    rx.close();
    let mut late: u64 = 0;
    while let Ok(envelope) = rx.try_recv() {
        if let Envelope::Event(event) = envelope {
            late += 1;
            deliver(&name, &mut handlers, &event);
        }
    }
    delivered += late;
    if late > 0 {
        debug!(context = %name, late, "Delivered events posted behind close");
    }

    debug!(
        context = %name,
        delivered,
        handlers = handlers.len(),
        "Dispatch context stopped"
    );
}

fn deliver<E>(name: &str, handlers: &mut [(HandlerId, Box<dyn EventHandler<E>>)], event: &E) {
    for (id, handler) in handlers.iter_mut() {
        match catch_unwind(AssertUnwindSafe(|| handler.handle(event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(context = %name, handler = %id, error = %e, "Event handler failed");
            }
            Err(_) => {
                error!(context = %name, handler = %id, "Event handler panicked");
            }
        }
    }
}
