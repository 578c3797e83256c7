//! Process-wide tracing setup. Stdout only; this broker has no log rotation
//! story of its own, unlike the teacher's file-backed subscriber.

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// `debug` mirrors the CLI's `--debug` flag: bumps the default level from
/// `info` to `debug` when the environment doesn't already specify a filter.
pub fn init(debug: bool) {
    let default_directive = if debug { "aegis_broker=debug,info" } else { "info" };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry().with(fmt::layer()).with(env_filter).init();
}
