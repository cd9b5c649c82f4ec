use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `verbose` toggles between debug and
/// info defaults for this crate. Safe to call once per process.
pub fn init_tracing(verbose: bool) {
    let env_filter = if verbose {
        "rpcmux=debug,info"
    } else {
        "rpcmux=info,warn,error"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

/// Initialize tracing with JSON-formatted output, for deployments that ship
/// logs to a structured collector
pub fn init_tracing_json(verbose: bool) {
    let env_filter = if verbose {
        "rpcmux=debug,info"
    } else {
        "rpcmux=info,warn,error"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().json().with_target(true))
        .init();
}

/// Non-panicking variant for tests and embedders that may initialize more
/// than once
pub fn try_init_tracing(verbose: bool) -> bool {
    let env_filter = if verbose {
        "rpcmux=debug,info"
    } else {
        "rpcmux=info,warn,error"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .is_ok()
}
