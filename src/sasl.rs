//! Simple Authentication and Security Layer.
//!
//! RFC: <https://datatracker.ietf.org/doc/html/rfc4422>.
//!
//! This module holds the pieces shared by every mechanism: the
//! [`Mechanism`] and [`Domain`] tags, the [`Step`] result handed back to
//! the dispatcher, the traits implemented by the mechanism state
//! machines, and the process-wide [`MechanismRegistry`] that decides
//! which mechanisms are advertised and instantiated.

use std::fmt;
use std::sync::Arc;
use std::sync::LazyLock;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::crypto::{self, Algorithm};
use crate::error::{Error, Result};
use crate::plain::{PlainClient, PlainServer};
use crate::pwdb::PasswordStore;
use crate::scram::client::ScramClient;
use crate::scram::server::ScramServer;
use crate::session::ClientCallbacks;

pub const MECH_NAME_PLAIN: &str = "PLAIN";
pub const MECH_NAME_SCRAM_SHA1: &str = "SCRAM-SHA1";
pub const MECH_NAME_SCRAM_SHA256: &str = "SCRAM-SHA256";
pub const MECH_NAME_SCRAM_SHA512: &str = "SCRAM-SHA512";

/// The authentication mechanisms the server speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mechanism {
    Plain,
    ScramSha1,
    ScramSha256,
    ScramSha512,
}

impl Mechanism {
    /// Strict name lookup. Anything but an exact match is a
    /// [`Error::NoMechanism`] error.
    pub fn parse(name: &str) -> Result<Mechanism> {
        match name {
            MECH_NAME_PLAIN => Ok(Mechanism::Plain),
            MECH_NAME_SCRAM_SHA1 => Ok(Mechanism::ScramSha1),
            MECH_NAME_SCRAM_SHA256 => Ok(Mechanism::ScramSha256),
            MECH_NAME_SCRAM_SHA512 => Ok(Mechanism::ScramSha512),
            _ => Err(Error::NoMechanism),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mechanism::Plain => MECH_NAME_PLAIN,
            Mechanism::ScramSha1 => MECH_NAME_SCRAM_SHA1,
            Mechanism::ScramSha256 => MECH_NAME_SCRAM_SHA256,
            Mechanism::ScramSha512 => MECH_NAME_SCRAM_SHA512,
        }
    }

    /// The hash algorithm backing a SCRAM mechanism.
    pub fn algorithm(self) -> Option<Algorithm> {
        match self {
            Mechanism::Plain => None,
            Mechanism::ScramSha1 => Some(Algorithm::Sha1),
            Mechanism::ScramSha256 => Some(Algorithm::Sha256),
            Mechanism::ScramSha512 => Some(Algorithm::Sha512),
        }
    }

    fn is_supported(self) -> bool {
        match self.algorithm() {
            Some(algorithm) => crypto::is_supported(algorithm),
            None => true,
        }
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an authenticated identity is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Domain {
    #[default]
    Local,
    External,
}

impl Domain {
    pub fn parse(name: &str) -> Result<Domain> {
        match name {
            "local" => Ok(Domain::Local),
            "external" => Ok(Domain::External),
            _ => Err(Error::InvalidFormat(format!("invalid domain: {name}"))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Domain::Local => "local",
            Domain::External => "external",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A successful outcome of a `start`/`step` call. Errors travel as
/// [`Error`] so the dispatcher sees exactly one result type.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    /// More round trips are expected; send the payload to the peer.
    Continue(Vec<u8>),
    /// Authentication concluded successfully; the payload (possibly
    /// empty) still has to reach the peer.
    Success(Vec<u8>),
}

/// Server half of a mechanism. One instance lives for at most one
/// authentication attempt.
pub(crate) trait ServerMechanism {
    fn start(&mut self, input: &[u8]) -> Result<Step>;
    fn step(&mut self, input: &[u8]) -> Result<Step>;

    /// The (possibly tentative) authenticated identity. Only meaningful
    /// to the caller once a call returned [`Step::Success`].
    fn username(&self) -> &str;
    fn domain(&self) -> Domain;
}

/// Client half of a mechanism. The callbacks supply the credentials.
pub(crate) trait ClientMechanism {
    fn start(&mut self, callbacks: &ClientCallbacks) -> Result<Step>;
    fn step(&mut self, callbacks: &ClientCallbacks, input: &[u8]) -> Result<Step>;
}

/// Knobs threaded from the session into a freshly constructed server
/// mechanism.
pub(crate) struct ServerMechanismConfig {
    pub store: Arc<PasswordStore>,
    pub nonce_override: Option<String>,
}

/// The set of mechanisms advertised and accepted, split by transport
/// confidentiality: PLAIN ships the password in the clear and is only
/// offered when the transport already provides confidentiality.
pub struct MechanismRegistry {
    inner: RwLock<EnabledLists>,
}

struct EnabledLists {
    /// Advertised over plaintext transports.
    plain_transport: Vec<Mechanism>,
    /// Advertised over confidentiality-protected transports.
    ssl_transport: Vec<Mechanism>,
}

/// Preference order used for advertising and for
/// [`MechanismRegistry::select`]: strongest first.
const PREFERENCE: [Mechanism; 4] = [
    Mechanism::ScramSha512,
    Mechanism::ScramSha256,
    Mechanism::ScramSha1,
    Mechanism::Plain,
];

impl MechanismRegistry {
    pub fn new() -> Self {
        let supported: Vec<Mechanism> = PREFERENCE
            .iter()
            .copied()
            .filter(|m| m.is_supported())
            .collect();
        MechanismRegistry {
            inner: RwLock::new(EnabledLists {
                plain_transport: supported
                    .iter()
                    .copied()
                    .filter(|&m| m != Mechanism::Plain)
                    .collect(),
                ssl_transport: supported,
            }),
        }
    }

    pub fn is_enabled(&self, mechanism: Mechanism, tls: bool) -> bool {
        let inner = self.inner.read();
        let list = if tls {
            &inner.ssl_transport
        } else {
            &inner.plain_transport
        };
        list.contains(&mechanism)
    }

    /// Build the advertised mechanism list, plus the mechanism count.
    pub fn list(
        &self,
        tls: bool,
        prefix: Option<&str>,
        separator: Option<&str>,
        suffix: Option<&str>,
    ) -> (String, usize) {
        let inner = self.inner.read();
        let list = if tls {
            &inner.ssl_transport
        } else {
            &inner.plain_transport
        };

        let mut out = String::with_capacity(80);
        if let Some(prefix) = prefix {
            out.push_str(prefix);
        }
        for (index, mechanism) in list.iter().enumerate() {
            if index > 0 {
                out.push_str(separator.unwrap_or(" "));
            }
            out.push_str(mechanism.as_str());
        }
        if let Some(suffix) = suffix {
            out.push_str(suffix);
        }

        (out, list.len())
    }

    /// Restrict one of the advertised lists to the named mechanisms
    /// (comma or whitespace separated). Names that don't resolve to a
    /// supported mechanism are ignored with a log line.
    pub fn set_mechanisms(&self, names: &str, tls: bool) {
        let mut enabled = Vec::new();
        let names = names.to_uppercase();
        for token in names
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|token| !token.is_empty())
        {
            match Mechanism::parse(token) {
                Ok(mechanism) if mechanism.is_supported() => {
                    debug!(mechanism = %mechanism, "enabling mechanism");
                    if !enabled.contains(&mechanism) {
                        enabled.push(mechanism);
                    }
                }
                _ => warn!(mechanism = token, "unknown mechanism specified, ignored"),
            }
        }
        // Preserve the preference order regardless of input order.
        enabled.sort_by_key(|m| PREFERENCE.iter().position(|p| p == m));

        let mut inner = self.inner.write();
        if tls {
            inner.ssl_transport = enabled;
        } else {
            inner.plain_transport = enabled;
        }
    }

    /// Pick the strongest enabled mechanism contained in a peer-offered
    /// list. Matching is case-insensitive and treats any punctuation
    /// except `-` as a separator.
    pub fn select(&self, offered: &str, tls: bool) -> Result<Mechanism> {
        let normalized: String = offered
            .chars()
            .map(|c| {
                let c = c.to_ascii_uppercase();
                if c.is_ascii_punctuation() && c != '-' {
                    ' '
                } else {
                    c
                }
            })
            .collect();

        let tokens: Vec<&str> = normalized.split_whitespace().collect();
        for mechanism in PREFERENCE {
            if self.is_enabled(mechanism, tls) && tokens.contains(&mechanism.as_str()) {
                return Ok(mechanism);
            }
        }
        Err(Error::NoMechanism)
    }

    pub(crate) fn create_server(
        &self,
        mechanism: Mechanism,
        tls: bool,
        config: ServerMechanismConfig,
    ) -> Result<Box<dyn ServerMechanism>> {
        if !self.is_enabled(mechanism, tls) {
            warn!(mechanism = %mechanism, "requested disabled mechanism");
            return Err(Error::NoMechanism);
        }

        Ok(match mechanism {
            Mechanism::Plain => Box::new(PlainServer::new(config.store)),
            Mechanism::ScramSha1 | Mechanism::ScramSha256 | Mechanism::ScramSha512 => {
                Box::new(ScramServer::new(mechanism, config)?)
            }
        })
    }

    pub(crate) fn create_client(
        &self,
        mechanism: Mechanism,
        nonce_override: Option<String>,
    ) -> Result<Box<dyn ClientMechanism>> {
        Ok(match mechanism {
            Mechanism::Plain => Box::new(PlainClient::new()),
            Mechanism::ScramSha1 | Mechanism::ScramSha256 | Mechanism::ScramSha512 => {
                Box::new(ScramClient::new(mechanism, nonce_override)?)
            }
        })
    }
}

impl Default for MechanismRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static REGISTRY: LazyLock<MechanismRegistry> = LazyLock::new(MechanismRegistry::new);

/// The process-wide registry used by sessions unless they were built
/// against a private one.
pub fn registry() -> &'static MechanismRegistry {
    &REGISTRY
}

/// Apply the embedding server's named options. The getter returns the
/// configured value for an option name, or `None` when unset.
pub fn apply_options(getopt: &dyn Fn(&str) -> Option<String>) {
    if let Some(value) = getopt("hmac iteration count") {
        match value.trim().parse::<u32>() {
            Ok(count) => crate::pwdb::set_default_iteration_count(count),
            Err(_) => warn!("failed to update HMAC iteration count"),
        }
    }
    if let Some(value) = getopt("sasl mechanisms") {
        registry().set_mechanisms(&value, false);
    }
    if let Some(value) = getopt("ssl sasl mechanisms") {
        registry().set_mechanisms(&value, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mechanism_names_round_trip() {
        for mechanism in PREFERENCE {
            assert_eq!(Mechanism::parse(mechanism.as_str()).unwrap(), mechanism);
        }
        assert!(matches!(
            Mechanism::parse("SCRAM-SHA256 "),
            Err(Error::NoMechanism)
        ));
        assert!(matches!(
            Mechanism::parse("scram-sha256"),
            Err(Error::NoMechanism)
        ));
    }

    #[test]
    fn plain_is_confidential_transport_only() {
        let registry = MechanismRegistry::new();
        assert!(registry.is_enabled(Mechanism::Plain, true));
        assert!(!registry.is_enabled(Mechanism::Plain, false));
        assert!(registry.is_enabled(Mechanism::ScramSha512, false));
    }

    #[test]
    fn list_joins_with_separator() {
        let registry = MechanismRegistry::new();
        let (joined, count) = registry.list(false, None, Some(" "), None);
        assert_eq!(joined, "SCRAM-SHA512 SCRAM-SHA256 SCRAM-SHA1");
        assert_eq!(count, 3);

        let (joined, count) = registry.list(true, Some("("), Some(","), Some(")"));
        assert_eq!(joined, "(SCRAM-SHA512,SCRAM-SHA256,SCRAM-SHA1,PLAIN)");
        assert_eq!(count, 4);
    }

    #[test]
    fn set_mechanisms_restricts_list() {
        let registry = MechanismRegistry::new();
        registry.set_mechanisms("scram-sha256 bogus", true);
        assert!(registry.is_enabled(Mechanism::ScramSha256, true));
        assert!(!registry.is_enabled(Mechanism::ScramSha512, true));
        assert!(!registry.is_enabled(Mechanism::Plain, true));
    }

    #[test]
    fn select_prefers_strongest() {
        let registry = MechanismRegistry::new();
        assert_eq!(
            registry
                .select("PLAIN SCRAM-SHA1 SCRAM-SHA512", true)
                .unwrap(),
            Mechanism::ScramSha512
        );
        assert_eq!(
            registry.select("plain,scram-sha1", true).unwrap(),
            Mechanism::ScramSha1
        );
        // PLAIN offered alone over a plaintext transport is refused.
        assert!(matches!(
            registry.select("PLAIN", false),
            Err(Error::NoMechanism)
        ));
    }
}
