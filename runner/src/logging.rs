use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Set up the global subscriber. `RUST_LOG` wins when set, otherwise the verbosity picks
/// the level: info, then debug, then trace.
pub fn init_logging(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        })
    });

    // a second initialisation (tests) keeps the first subscriber
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .try_init();
}
