//! Binary-side wiring around the library.

pub(crate) mod exit_handler;
pub(crate) mod history;
pub(crate) mod operator;
pub(crate) mod output;
pub(crate) mod progress;
pub(crate) mod runtime;
