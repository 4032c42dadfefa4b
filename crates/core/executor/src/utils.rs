use std::sync::Once;

use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

static INIT: Once = Once::new();

/// Install a console subscriber filtered by `RUST_LOG` (default `info`).
///
/// Safe to call more than once, only the first call has an effect.
pub fn setup_logger() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_span_events(FmtSpan::CLOSE)
            .with_target(false)
            .with_thread_ids(false)
            .with_line_number(false)
            .with_file(false)
            .with_level(true)
            .with_ansi(true)
            .with_writer(std::io::stderr)
            .try_init();
    });
}
