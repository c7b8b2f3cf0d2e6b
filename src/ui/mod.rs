//! Styled CLI output
//!
//! Colors and symbols on an interactive terminal, bracketed tags
//! (`[OK]`, `[WARN]`, `[INFO]`) when piped or running under CI.

mod context;
mod output;

pub use context::UiContext;
pub use output::{intro, key_value, step_info, step_ok_detail, step_warn_hint};
