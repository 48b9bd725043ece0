//! Behavioural tests for the remote proxy.
//!
//! - `harness.rs`      - Scripted channel, recording handler, connected fixture
//! - `single_flight.rs` - Slot admission and capability preconditions
//! - `completion.rs`   - Exactly-once resolution against answers and deadlines
//! - `queue_order.rs`  - FIFO fetch queue, one active entry, clear_queue
//! - `stall.rs`        - Stall window restarted by progress
//! - `reconnect.rs`    - Re-subscription and disconnect resolution
//! - `teardown.rs`     - Teardown finality
//! - `scenario.rs`     - Phonebook fetch sequence end to end

mod reconnect;
mod stall;
mod teardown;
