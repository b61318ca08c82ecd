//! Shared vocabulary for the conductor workspace.
//!
//! Verification outcomes are a closed [`Status`] enum arranged in a
//! [`ResultTree`]; every orchestrated unit accumulates a [`StepReport`].
//! [`CancelToken`] is threaded through every layer that can block.

pub mod cancel;
pub mod domain;
pub mod error;

pub use cancel::CancelToken;
pub use domain::*;
pub use error::CoreError;
