/// Development helper: initialize tracing subscriber when `RUST_LOG` is set.
///
/// Tests, benches and small binaries can call
/// `isoswitch::dev_tracing::init_tracing()` to see the gateway's structured
/// logs (`RUST_LOG=isoswitch=debug`). This is a no-op when `RUST_LOG` is not
/// set or when a global subscriber is already installed.
pub fn init_tracing() {
    use std::env;

    if env::var("RUST_LOG").is_ok() {
        // Best-effort: a subscriber may already be installed.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_thread_names(true)
            .try_init();
    }
}
