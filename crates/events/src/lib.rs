//! Run progress events for conductor
//!
//! Steps, batches, fan-outs and completion monitors publish onto an
//! [`EventBus`] when one is attached to the run; drivers subscribe to render
//! live progress.

mod bus;
mod types;

pub use bus::EventBus;
pub use types::*;
