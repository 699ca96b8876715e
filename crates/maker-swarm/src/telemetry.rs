//! Tracing initialisation.
//!
//! Logs go to stderr so stdout carries only streamed plan text and the final
//! outcome. `RUST_LOG` overrides the default `info` filter.

use tracing_subscriber::EnvFilter;

pub fn init(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
