//! Log setup for the truvlm binary and its tests.
//!
//! Logs go to stderr: the binary prints its result (or error response) as
//! JSON on stdout, and the two streams must not interleave.
//!
//! Per-request lines carry the `infer` span (`request_id`, `source`), so a
//! filter such as `RUST_LOG=truvlm_vidprep=debug` follows one request from
//! open to generation.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the subscriber at `info`.
pub fn init() {
    init_with_filter("info");
}

/// Install the subscriber with `default_filter` unless `RUST_LOG` is set.
///
/// Safe to call more than once; the first subscriber stays.
pub fn init_with_filter(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init();
}

/// Glyphs that open a log line, one per phase of a request.
pub mod prefix {
    /// Model load, process start
    pub const OPEN: &str = "✿";
    /// Request finished, model unloaded
    pub const CLOSE: &str = "❀";
    /// Source resolution and frame decode
    pub const DECODE: &str = "▣";
    /// Generation on the model runtime
    pub const MODEL: &str = "◆";
}
