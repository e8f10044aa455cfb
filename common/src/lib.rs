//! Shared building blocks for the bulk-storage transfer engine
//!
//! This crate holds the pieces every other crate in the workspace needs:
//!
//! - [`Error`] - the single error taxonomy a transfer session reports through
//! - [`config`] - engine tuning and the optional config file
//! - [`path`] - splitting absolute pathnames into bucket and object names
//! - [`progress`] - process-wide counters for sessions and bytes moved
//!
//! # Logging
//!
//! Everything logs through `tracing`; installing a subscriber is left to the
//! host that embeds the engine.

pub mod config;
pub mod error;
pub mod path;
pub mod progress;

pub use error::Error;

static PROGRESS: std::sync::LazyLock<progress::Progress> =
    std::sync::LazyLock::new(progress::Progress::new);

/// Process-wide progress counters shared by all sessions.
pub fn get_progress() -> &'static progress::Progress {
    &PROGRESS
}
