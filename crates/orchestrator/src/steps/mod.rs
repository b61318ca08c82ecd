//! Generic steps usable without writing a `Step` impl.

mod rest_call;
mod template;

pub use rest_call::{RestCallAction, RestCallSpec, RestCallStep, VerifySpec};
pub use template::{render, render_text};
