//! Affinity workers: background tasks observed from a single owner thread.

pub mod affinity;
pub mod config;
pub mod error;
pub mod executor;
pub mod timer;
pub mod worker;
