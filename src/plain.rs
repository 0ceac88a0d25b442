//! The PLAIN mechanism: a single `authzid \0 authcid \0 password` blob
//! checked against the salted HMAC entry in the password database.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::crypto::{self, Algorithm};
use crate::error::{Error, Result};
use crate::parse::split_nul;
use crate::pwdb::{PasswordStore, User, UserFactory};
use crate::sasl::{ClientMechanism, Domain, Mechanism, ServerMechanism, Step};
use crate::saslauthd;
use crate::session::ClientCallbacks;

/// The stored entry is a 16 byte salt followed by the 20 byte
/// HMAC-SHA1 of the password under that salt.
const SALT_SIZE: usize = 16;
const HASH_SIZE: usize = 20;
const PASSWORD_SIZE: usize = SALT_SIZE + HASH_SIZE;

/// Verify a password against a user's PLAIN entry. The HMAC is always
/// computed and compared over its full length; a dummy user flips the
/// outcome the same way the SCRAM proof check does.
pub(crate) fn check_password(user: &User, password: &str) -> Result<()> {
    let stored = user.password_for(Mechanism::Plain)?.password().to_vec();
    if stored.len() != PASSWORD_SIZE {
        warn!(username = %user.username(), "invalid password entry");
        return Err(Error::Fail("invalid password entry"));
    }

    let (salt, stored_hmac) = stored.split_at(SALT_SIZE);
    let generated_hmac = crypto::hmac(Algorithm::Sha1, salt, password.as_bytes());

    let compare = crypto::secure_compare(stored_hmac, &generated_hmac);
    let fail = compare ^ u32::from(user.is_dummy());

    if fail != 0 || user.is_dummy() {
        if user.is_dummy() {
            return Err(Error::NoUser);
        }
        return Err(Error::PasswordError);
    }
    Ok(())
}

pub(crate) struct PlainServer {
    store: Arc<PasswordStore>,
    username: String,
    domain: Domain,
    done: bool,
}

impl PlainServer {
    pub(crate) fn new(store: Arc<PasswordStore>) -> Self {
        PlainServer {
            store,
            username: String::new(),
            domain: Domain::Local,
            done: false,
        }
    }

    /// Legacy bucket users (`<name>;legacy`) are created by the upgrade
    /// process and always authenticate with PLAIN, so they are tried
    /// ahead of the regular entry.
    fn try_legacy_user(&mut self, username: &str, password: &str) -> bool {
        let legacy_username = format!("{username};legacy");
        let Some(user) = self.store.lookup(&legacy_username) else {
            return false;
        };

        if check_password(&user, password).is_ok() {
            self.username = legacy_username;
            true
        } else {
            false
        }
    }
}

impl ServerMechanism for PlainServer {
    fn start(&mut self, input: &[u8]) -> Result<Step> {
        if self.done {
            return Err(Error::BadParameter("start called out of sequence"));
        }
        self.done = true;

        if input.is_empty() {
            return Err(Error::BadParameter("empty authentication packet"));
        }

        // authzid \0 authcid \0 password; the authzid is ignored.
        let (_authzid, rest) = split_nul(input)
            .ok_or(Error::BadParameter("invalid encoded packet"))?;
        let (authcid, rest) = split_nul(rest)
            .ok_or(Error::BadParameter("invalid encoded packet"))?;
        // Tolerate trailing garbage after an embedded NUL; everything up
        // to it is the password.
        let password = split_nul(rest).map_or(rest, |(password, _)| password);

        let username = std::str::from_utf8(authcid)
            .map_err(|_| Error::BadParameter("username is not valid UTF-8"))?
            .to_owned();
        let password = std::str::from_utf8(password)
            .map_err(|_| Error::BadParameter("password is not valid UTF-8"))?;

        self.username = username.clone();

        if self.try_legacy_user(&username, password) {
            return Ok(Step::Success(Vec::new()));
        }

        match self.store.lookup(&username) {
            Some(user) => {
                check_password(&user, password)?;
                Ok(Step::Success(Vec::new()))
            }
            None if saslauthd::is_configured() => {
                saslauthd::check(&username, password)?;
                self.domain = Domain::External;
                Ok(Step::Success(Vec::new()))
            }
            None => {
                // Unknown users burn the same HMAC work as real ones so
                // the failure is indistinguishable from a bad password.
                debug!(username = %username, "user doesn't exist, using dummy");
                let dummy = UserFactory::create_dummy(&username, Mechanism::Plain)?;
                check_password(&dummy, password)?;
                Err(Error::NoUser)
            }
        }
    }

    fn step(&mut self, _input: &[u8]) -> Result<Step> {
        Err(Error::BadParameter("PLAIN is a single-step mechanism"))
    }

    fn username(&self) -> &str {
        &self.username
    }

    fn domain(&self) -> Domain {
        self.domain
    }
}

pub(crate) struct PlainClient {
    done: bool,
}

impl PlainClient {
    pub(crate) fn new() -> Self {
        PlainClient { done: false }
    }
}

impl ClientMechanism for PlainClient {
    fn start(&mut self, callbacks: &ClientCallbacks) -> Result<Step> {
        if self.done {
            return Err(Error::BadParameter("start called out of sequence"));
        }
        self.done = true;

        let username = (callbacks.get_username)();
        let password = (callbacks.get_password)();

        let mut out = Vec::with_capacity(username.len() + password.len() + 2);
        out.push(0);
        out.extend_from_slice(username.as_bytes());
        out.push(0);
        out.extend_from_slice(password.as_bytes());

        Ok(Step::Success(out))
    }

    fn step(&mut self, _callbacks: &ClientCallbacks, _input: &[u8]) -> Result<Step> {
        Err(Error::BadParameter("PLAIN is a single-step mechanism"))
    }
}
