// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Tracing subscriber setup shared by the binaries.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs a formatting subscriber filtered at `default_level`.
///
/// `RUST_LOG` overrides the level when set. Calling it more than once is a no-op.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_does_not_panic() {
        init("debug");
        init("not a level");
    }
}
