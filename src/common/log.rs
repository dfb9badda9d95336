//! Logging helpers
//!
//! The proxy only ever talks to the `log` facade: `info!` for the regular
//! traffic log and `debug!` for verbose protocol chatter.

/// Initialize the global logger
///
/// `RUST_LOG` wins over `level` when set.
///
/// # Parameters
///
/// * `level` - Default filter, e.g. `info` or `debug`
pub fn init_logger(level: &str) {
    let env = env_logger::Env::default()
        .filter_or("RUST_LOG", level);

    // A second initialization (tests) is harmless
    let _ = env_logger::Builder::from_env(env).try_init();
}

/// Resolve the effective log filter from the configured flags
///
/// `silent` wins over `verbose`; both win over the plain level.
pub fn effective_level(level: &str, verbose: bool, silent: bool) -> String {
    if silent {
        "off".to_string()
    } else if verbose {
        "debug".to_string()
    } else {
        level.to_string()
    }
}
