use std::sync::Once;

mod common;
mod convert_tree_tests;

/// Setup tracing for the test suite.
/// Initializes the subscriber with the environment filter once, `RUST_LOG`
/// controls what is printed.
pub fn setup_tracing() {
    static TRACING_INIT: Once = Once::new();
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_line_number(true)
            .with_file(true)
            .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
            .init();
    });
}
