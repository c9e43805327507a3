//! Tracing setup.
//!
//! Logs go to stderr so stdout stays free for the event stream in `--server`
//! mode. `SCOREKEEP_LOG` takes precedence over `RUST_LOG`; without either the
//! level comes from `-v`/`-q`.

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "SCOREKEEP_LOG";

/// Default filter for a verbosity level, where 0 is normal, negative is quiet.
pub fn default_directive(verbosity: i8) -> &'static str {
    match verbosity {
        i8::MIN..=-1 => "error",
        0 => "scorekeep=info,warn",
        1 => "scorekeep=debug,info",
        _ => "scorekeep=trace,debug",
    }
}

pub fn filter(verbosity: i8) -> EnvFilter {
    for var in [LOG_ENV, "RUST_LOG"] {
        if let Ok(spec) = std::env::var(var) {
            if let Ok(filter) = EnvFilter::try_new(&spec) {
                return filter;
            }
        }
    }
    EnvFilter::new(default_directive(verbosity))
}

/// Install the global subscriber. Safe to call more than once.
pub fn init(verbosity: i8) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(verbosity))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(default_directive(-1), "error");
        assert_eq!(default_directive(0), "scorekeep=info,warn");
        assert_eq!(default_directive(3), "scorekeep=trace,debug");
    }

    #[test]
    #[serial]
    fn test_env_overrides_verbosity() {
        std::env::set_var(LOG_ENV, "scorekeep::admission=trace");
        let filter = filter(0);
        std::env::remove_var(LOG_ENV);
        assert_eq!(filter.to_string(), "scorekeep::admission=trace");
    }
}
