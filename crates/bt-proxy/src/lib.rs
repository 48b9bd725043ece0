//! BT Proxy: application-side facade for the out-of-process Bluetooth
//! control service.
//!
//! Built on [`remote_proxy`]. Call control, media control, device links and
//! module lifecycle are single-shot commands with a deadline; phonebook
//! downloads are multi-step fetches that run one at a time.
//!
//! # Architecture
//!
//! ```text
//! app ──► BtProxy ──► RemoteProxy ══ RemoteChannel ══► control service
//!                          ▲                                 │
//!                          └────────── RemoteSink ◄──────────┘
//! ```
//!
//! `sim` provides an in-process service for tests and the `bt-proxy-sim`
//! binary.

pub mod proxy;
pub mod sim;
pub mod types;

pub use proxy::BtProxy;
pub use sim::{FetchOutcome, FetchScript, SimulatedService};
pub use types::{MediaAction, Module, PhonebookKind, Topic};
