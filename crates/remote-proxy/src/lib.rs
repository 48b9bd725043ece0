//! Remote Proxy: asynchronous command proxy for out-of-process services.
//!
//! Application code calls the proxy as if the service were local. The real
//! work happens in another process reachable only through a callback-based
//! transport. The proxy tracks the connection, bounds every command with a
//! deadline, funnels every callback onto one dispatch task, and runs
//! multi-step fetches one at a time.
//!
//! # Core Invariants
//!
//! 1. **Single-Flight**: at most one pending command per slot
//! 2. **One Active Fetch**: at most one queued fetch is in flight at the service
//! 3. **Exactly-Once**: every accepted command resolves once, by answer or deadline
//! 4. **Final Teardown**: after teardown nothing fires and every call is `Aborted`
//!
//! # Architecture
//!
//! ```text
//! application ──► RemoteProxy ──┐
//!                               ├──► DispatchContext ──► ProxyCore ──► RemoteChannel
//! transport ────► RemoteSink ───┘            ▲             │
//!                                            └── deadline ─┘
//! ```

pub mod command;
pub mod config;
pub mod deadline;
pub mod dispatch;
mod engine;
pub mod error;
mod invoker;
pub mod logging;
pub mod proxy;
mod queue;
pub mod session;

#[cfg(test)]
mod tests;

pub use command::{CommandId, CompletionHandler, RemoteChannel, RemoteCommand, TimeoutPolicy};
pub use config::ProxyConfig;
pub use deadline::DeadlineTimer;
pub use dispatch::{DispatchContext, EventHandler, HandlerId};
pub use engine::ProxyStatus;
pub use error::{ProxyError, ProxyResult, RemoteFault};
pub use proxy::{RemoteProxy, RemoteSink};
pub use queue::QueueEntry;
pub use session::{ConnectionState, ListenerId, StateListener};
