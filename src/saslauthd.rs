//! Hook for an external saslauthd-style password backend.
//!
//! The daemon that talks to the actual socket lives outside this crate;
//! here we only carry the configuration (is a backend available at
//! all?) and the injectable validator the embedding server installs.
//! PLAIN delegates unknown local users to the validator; SCRAM uses the
//! configured flag to emit a clear error instead of silently failing
//! LDAP-backed users.

use std::path::PathBuf;
use std::sync::LazyLock;

use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Validates a (username, password) pair against the external backend.
pub trait ExternalValidator: Send + Sync {
    fn check(&self, username: &str, password: &str) -> Result<()>;
}

struct Config {
    socket_path: Option<PathBuf>,
    validator: Option<Box<dyn ExternalValidator>>,
}

static CONFIG: LazyLock<RwLock<Config>> = LazyLock::new(|| {
    RwLock::new(Config {
        socket_path: std::env::var_os("CBAUTH_SOCKPATH").map(PathBuf::from),
        validator: None,
    })
});

/// Point the subsystem at the saslauthd socket. `None` disables the
/// external backend.
pub fn set_socket_path(path: Option<PathBuf>) {
    CONFIG.write().socket_path = path;
}

pub fn get_socket_path() -> Option<PathBuf> {
    CONFIG.read().socket_path.clone()
}

/// Install the validator implementation that owns the socket protocol.
pub fn set_validator(validator: Option<Box<dyn ExternalValidator>>) {
    CONFIG.write().validator = validator;
}

/// Whether an external authentication backend is configured.
pub fn is_configured() -> bool {
    let config = CONFIG.read();
    config.socket_path.is_some() || config.validator.is_some()
}

/// Validate a user against the external backend.
pub(crate) fn check(username: &str, password: &str) -> Result<()> {
    let config = CONFIG.read();
    match &config.validator {
        Some(validator) => validator.check(username, password),
        None => Err(Error::NoUser),
    }
}
