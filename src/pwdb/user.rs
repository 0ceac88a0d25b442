//! Users and their per-mechanism password metadata.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use serde_json::Value;
use zeroize::Zeroize;

use crate::crypto::{self, Algorithm};
use crate::error::{Error, Result};
use crate::sasl::Mechanism;

/// PBKDF2 iteration count used when generating new secrets. Process
/// wide; the embedding server may change it through the
/// `"hmac iteration count"` option.
static ITERATION_COUNT: AtomicU32 = AtomicU32::new(4096);

pub fn set_default_iteration_count(count: u32) {
    ITERATION_COUNT.store(count, Ordering::Relaxed);
}

pub fn default_iteration_count() -> u32 {
    ITERATION_COUNT.load(Ordering::Relaxed)
}

/// The salt used for PLAIN entries is always 16 bytes.
const PLAIN_SALT_SIZE: usize = 16;

/// One (user, mechanism) secret.
///
/// For SCRAM mechanisms `password` is the PBKDF2 output and `salt` is
/// kept base64-encoded alongside the iteration count that produced it.
/// For PLAIN the salt is embedded in the password bytes themselves
/// (`salt ∥ HMAC_SHA1(salt, password)`) and the other fields are empty.
#[derive(Clone)]
pub struct PasswordMetaData {
    password: Vec<u8>,
    salt: String,
    iterations: u32,
}

impl PasswordMetaData {
    fn new(password: Vec<u8>, salt: String, iterations: u32) -> Self {
        PasswordMetaData {
            password,
            salt,
            iterations,
        }
    }

    fn plain(entry: Vec<u8>) -> Self {
        PasswordMetaData {
            password: entry,
            salt: String::new(),
            iterations: 0,
        }
    }

    /// Parse a `{"h": ..., "s": ..., "i": ...}` object. Exactly those
    /// three attributes must be present with the right types.
    fn from_json(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::InvalidFormat("password entry: not an object".into()))?;
        if obj.len() != 3 {
            return Err(Error::InvalidFormat(
                "password entry: invalid number of attributes".into(),
            ));
        }

        let hash = obj
            .get("h")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidFormat("password entry: \"h\" must be a string".into()))?;
        let salt = obj
            .get("s")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidFormat("password entry: \"s\" must be a string".into()))?;
        let iterations = obj
            .get("i")
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                Error::InvalidFormat(
                    "password entry: \"i\" must be a non-negative integer".into(),
                )
            })?;
        let iterations = u32::try_from(iterations).map_err(|_| {
            Error::InvalidFormat("password entry: iteration count out of range".into())
        })?;

        // Validate that the salt decodes before accepting the entry.
        BASE64_STANDARD
            .decode(salt)
            .map_err(|_| Error::InvalidFormat("password entry: illegal base64 in salt".into()))?;
        let password = BASE64_STANDARD
            .decode(hash)
            .map_err(|_| Error::InvalidFormat("password entry: illegal base64 in hash".into()))?;

        Ok(PasswordMetaData::new(password, salt.to_owned(), iterations))
    }

    fn to_json(&self) -> Value {
        serde_json::json!({
            "h": BASE64_STANDARD.encode(&self.password),
            "s": self.salt,
            "i": self.iterations,
        })
    }

    /// The raw salted-hashed password bytes.
    pub fn password(&self) -> &[u8] {
        &self.password
    }

    /// The salt, base64-encoded. Empty for PLAIN entries.
    pub fn salt(&self) -> &str {
        &self.salt
    }

    pub fn decoded_salt(&self) -> Result<Vec<u8>> {
        BASE64_STANDARD
            .decode(&self.salt)
            .map_err(|_| Error::InvalidFormat("illegal base64 in stored salt".into()))
    }

    pub fn iteration_count(&self) -> u32 {
        self.iterations
    }
}

impl Drop for PasswordMetaData {
    fn drop(&mut self) {
        self.password.zeroize();
    }
}

/// A user and every secret we hold for them. A dummy user has the same
/// shape as a real one; the flag is consulted only after proof
/// verification.
#[derive(Clone)]
pub struct User {
    username: String,
    dummy: bool,
    passwords: HashMap<Mechanism, PasswordMetaData>,
}

impl User {
    fn new(username: &str, dummy: bool) -> Self {
        User {
            username: username.to_owned(),
            dummy,
            passwords: HashMap::new(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn is_dummy(&self) -> bool {
        self.dummy
    }

    /// The metadata backing one mechanism. Requesting a mechanism the
    /// user has no entry for is a hard failure, not an authentication
    /// error.
    pub fn password_for(&self, mechanism: Mechanism) -> Result<&PasswordMetaData> {
        self.passwords
            .get(&mechanism)
            .ok_or(Error::Fail("requested mechanism not available for user"))
    }

    /// Parse the on-disk user object. Unknown attributes reject the
    /// record.
    pub fn from_json(value: &Value) -> Result<User> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::InvalidFormat("user record: not an object".into()))?;

        let username = obj
            .get("n")
            .ok_or_else(|| Error::InvalidFormat("user record: missing mandatory \"n\"".into()))?
            .as_str()
            .ok_or_else(|| Error::InvalidFormat("user record: \"n\" must be a string".into()))?;

        let mut user = User::new(username, false);
        for (label, value) in obj {
            let mechanism = match label.as_str() {
                "n" => continue,
                "plain" => {
                    let entry = value.as_str().ok_or_else(|| {
                        Error::InvalidFormat("user record: \"plain\" must be a string".into())
                    })?;
                    let entry = BASE64_STANDARD.decode(entry).map_err(|_| {
                        Error::InvalidFormat("user record: illegal base64 in \"plain\"".into())
                    })?;
                    user.passwords
                        .insert(Mechanism::Plain, PasswordMetaData::plain(entry));
                    continue;
                }
                "sha1" => Mechanism::ScramSha1,
                "sha256" => Mechanism::ScramSha256,
                "sha512" => Mechanism::ScramSha512,
                other => {
                    return Err(Error::InvalidFormat(format!(
                        "user record: invalid attribute \"{other}\""
                    )));
                }
            };
            user.passwords
                .insert(mechanism, PasswordMetaData::from_json(value)?);
        }

        Ok(user)
    }

    pub fn to_json(&self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert("n".to_owned(), Value::String(self.username.clone()));
        for (mechanism, metadata) in &self.passwords {
            match mechanism {
                Mechanism::Plain => {
                    obj.insert(
                        "plain".to_owned(),
                        Value::String(BASE64_STANDARD.encode(&metadata.password)),
                    );
                }
                Mechanism::ScramSha1 => {
                    obj.insert("sha1".to_owned(), metadata.to_json());
                }
                Mechanism::ScramSha256 => {
                    obj.insert("sha256".to_owned(), metadata.to_json());
                }
                Mechanism::ScramSha512 => {
                    obj.insert("sha512".to_owned(), metadata.to_json());
                }
            }
        }
        Value::Object(obj)
    }

    /// Derive and store the secret for one mechanism from a plaintext
    /// password.
    fn generate_secrets(&mut self, mechanism: Mechanism, password: &str) -> Result<()> {
        let metadata = match mechanism {
            Mechanism::Plain => {
                let salt = crypto::random_bytes(PLAIN_SALT_SIZE)?;
                let mut entry = salt.clone();
                entry.extend_from_slice(&crypto::hmac(
                    Algorithm::Sha1,
                    &salt,
                    password.as_bytes(),
                ));
                PasswordMetaData::plain(entry)
            }
            Mechanism::ScramSha1 | Mechanism::ScramSha256 | Mechanism::ScramSha512 => {
                let algorithm = mechanism.algorithm().expect("scram carries an algorithm");
                let salt = crypto::random_bytes(algorithm.digest_size())?;
                let iterations = default_iteration_count();
                let digest =
                    crypto::pbkdf2_hmac(algorithm, password.as_bytes(), &salt, iterations)?;
                PasswordMetaData::new(digest, BASE64_STANDARD.encode(&salt), iterations)
            }
        };
        self.passwords.insert(mechanism, metadata);
        Ok(())
    }
}

/// Builds [`User`] records from plaintext passwords.
pub struct UserFactory;

impl UserFactory {
    /// Generate the full set of secrets for a new user: the PLAIN entry
    /// plus one SCRAM entry per supported algorithm.
    pub fn create(username: &str, password: &str) -> Result<User> {
        let mut user = User::new(username, false);
        user.generate_secrets(Mechanism::Plain, password)?;
        for mechanism in [
            Mechanism::ScramSha1,
            Mechanism::ScramSha256,
            Mechanism::ScramSha512,
        ] {
            let algorithm = mechanism.algorithm().expect("scram carries an algorithm");
            if crypto::is_supported(algorithm) {
                user.generate_secrets(mechanism, password)?;
            }
        }
        Ok(user)
    }

    /// Fabricate a user whose secrets are derived from a random
    /// password, populating only the requested mechanism. Handed out
    /// for lookups of nonexistent users so the response is
    /// indistinguishable from a real one.
    pub fn create_dummy(username: &str, mechanism: Mechanism) -> Result<User> {
        let mut user = User::new(username, true);
        let password = BASE64_STANDARD.encode(crypto::random_bytes(
            mechanism
                .algorithm()
                .map_or(PLAIN_SALT_SIZE, Algorithm::digest_size),
        )?);
        user.generate_secrets(mechanism, &password)?;
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_populates_every_mechanism() {
        let user = UserFactory::create("trond", "barn").unwrap();
        assert!(!user.is_dummy());

        let plain = user.password_for(Mechanism::Plain).unwrap();
        assert_eq!(plain.password().len(), 36);
        assert!(plain.salt().is_empty());

        for (mechanism, size) in [
            (Mechanism::ScramSha1, 20),
            (Mechanism::ScramSha256, 32),
            (Mechanism::ScramSha512, 64),
        ] {
            let metadata = user.password_for(mechanism).unwrap();
            assert_eq!(metadata.password().len(), size);
            assert_eq!(metadata.decoded_salt().unwrap().len(), size);
            assert_eq!(metadata.iteration_count(), default_iteration_count());
        }
    }

    #[test]
    fn plain_entry_matches_hmac_construction() {
        let user = UserFactory::create("user", "pencil").unwrap();
        let entry = user.password_for(Mechanism::Plain).unwrap().password();
        let (salt, hash) = entry.split_at(16);
        assert_eq!(hash, crypto::hmac(Algorithm::Sha1, salt, b"pencil"));
    }

    #[test]
    fn dummy_only_carries_requested_mechanism() {
        let user = UserFactory::create_dummy("ghost", Mechanism::ScramSha256).unwrap();
        assert!(user.is_dummy());
        assert!(user.password_for(Mechanism::ScramSha256).is_ok());
        assert!(user.password_for(Mechanism::ScramSha1).is_err());
        assert!(user.password_for(Mechanism::Plain).is_err());

        let metadata = user.password_for(Mechanism::ScramSha256).unwrap();
        assert_eq!(metadata.decoded_salt().unwrap().len(), 32);
    }

    #[test]
    fn json_round_trip_is_identity() {
        let user = UserFactory::create("trond", "barn").unwrap();
        let parsed = User::from_json(&user.to_json()).unwrap();
        assert_eq!(parsed.to_json(), user.to_json());
        assert_eq!(parsed.username(), "trond");
    }

    #[test]
    fn from_json_rejects_malformed_records() {
        let cases = [
            // missing n
            r#"{"plain": "aGVsbG8="}"#,
            // n must be a string
            r#"{"n": 5}"#,
            // unknown attribute
            r#"{"n": "u", "md5": {"h": "", "s": "", "i": 1}}"#,
            // entry with wrong field count
            r#"{"n": "u", "sha1": {"h": "", "s": ""}}"#,
            r#"{"n": "u", "sha1": {"h": "", "s": "", "i": 1, "x": 2}}"#,
            // wrong types inside the entry
            r#"{"n": "u", "sha1": {"h": 4, "s": "", "i": 1}}"#,
            r#"{"n": "u", "sha1": {"h": "", "s": 4, "i": 1}}"#,
            r#"{"n": "u", "sha1": {"h": "", "s": "", "i": "many"}}"#,
            // negative iteration count
            r#"{"n": "u", "sha1": {"h": "", "s": "", "i": -4}}"#,
            // illegal base64
            r#"{"n": "u", "sha1": {"h": "!!", "s": "", "i": 1}}"#,
            r#"{"n": "u", "plain": "!!"}"#,
        ];
        for case in cases {
            let value: Value = serde_json::from_str(case).unwrap();
            assert!(
                User::from_json(&value).is_err(),
                "accepted malformed record: {case}"
            );
        }
    }

    #[test]
    fn iteration_count_is_configurable() {
        let before = default_iteration_count();
        set_default_iteration_count(10);
        let user = UserFactory::create("u", "p").unwrap();
        assert_eq!(
            user.password_for(Mechanism::ScramSha1)
                .unwrap()
                .iteration_count(),
            10
        );
        set_default_iteration_count(before);
    }
}
