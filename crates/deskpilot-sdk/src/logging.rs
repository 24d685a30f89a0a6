//! Opt-in log output for scripts.
//!
//! The SDK only emits `tracing` events; applications that already install a
//! subscriber need nothing from here. Scripts that just want to see viewer
//! links and lifecycle messages call [`init`] once.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default directive when neither `RUST_LOG` nor an explicit level is given.
pub const DEFAULT_DIRECTIVE: &str = "warn,deskpilot_sdk=info";

fn filter(level: Option<&str>) -> EnvFilter {
    match level {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|_| DEFAULT_DIRECTIVE.into()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_DIRECTIVE.into()),
    }
}

/// Install a stderr subscriber.
///
/// `level` is an `EnvFilter` directive such as `"debug"` or
/// `"deskpilot_sdk=trace"`; `None` reads `RUST_LOG`. Returns false if a
/// global subscriber was already set, in which case nothing changes.
pub fn init(level: Option<&str>) -> bool {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_level_wins() {
        assert_eq!(filter(Some("debug")).to_string(), "debug");
    }

    #[test]
    fn second_init_is_a_no_op() {
        init(Some("error"));
        assert!(!init(Some("error")));
    }
}
