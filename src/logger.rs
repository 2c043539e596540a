//! Logger setup.
//!
//! The crate logs through the `log` facade. With the default
//! `builtin_env_logger` feature, [`try_init`] installs `env_logger` reading
//! `RUST_LOG`, defaulting to `info`. Building a heap calls it.

use once_cell::sync::OnceCell;

static INSTALLED: OnceCell<bool> = OnceCell::new();

/// Attempt to install the built-in logger. Does nothing if a logger is
/// already set. Returns whether this crate's logger is the one in use.
pub fn try_init() -> bool {
    *INSTALLED.get_or_init(cfg_if_env_logger)
}

#[cfg(feature = "builtin_env_logger")]
fn cfg_if_env_logger() -> bool {
    let result = env_logger::try_init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );
    match result {
        Ok(()) => {
            log::debug!("regiongc initialized the logger.");
            true
        }
        Err(e) => {
            log::debug!("regiongc failed to initialize the built-in env_logger: {e}");
            false
        }
    }
}

#[cfg(not(feature = "builtin_env_logger"))]
fn cfg_if_env_logger() -> bool {
    log::debug!("regiongc didn't initialize the built-in env_logger.");
    false
}
