use std::io;

use dotenvy::dotenv;
use tracing::{debug, warn};

/// Loads `UNCHAINED_*` settings (and anything else) from a `.env` file in the
/// working directory or one of its parents, if there is one.
///
/// Variables already set in the environment win. A file that cannot be read is
/// treated as absent; one that cannot be parsed is reported and ignored.
pub fn load_dotenvy_vars_if_present() {
    match dotenv() {
        Ok(path) => debug!("loaded settings from {}", path.display()),
        Err(dotenvy::Error::Io(io::Error { .. })) => (),
        Err(e) => warn!("ignoring unparseable .env file: {e}"),
    }
}
