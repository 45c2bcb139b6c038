//! Logging initialization for jobhub
//!
//! The hub logs to stdout in the configured format. Worker processes must
//! not write anything but protocol frames to stdout, so their subscriber
//! writes to stderr.

pub mod init;

pub use init::{build_env_filter, init_logging_from_config, init_simple_tracing, init_worker_tracing};
