//! Transfer progress parsing and estimation.

pub mod progress;
