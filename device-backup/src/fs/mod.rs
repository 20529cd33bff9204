//! Filesystem helpers shared by the orchestrator and the catalog.

pub mod walker;
