//! The process-wide password store.
//!
//! Readers grab the current [`PasswordDatabase`] snapshot; reloads
//! build a complete replacement off to the side and swap it in under a
//! short critical section. In-flight authentications keep using the
//! snapshot they started with.

use std::io::{Read, Write};
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, error};

use super::{PasswordDatabase, User, UserFactory};
use crate::crypto::CipherSpec;
use crate::error::{Error, Result};

/// When set, password files are AES-256-CBC wrapped with the contained
/// key material: `{"cipher": "AES_256_cbc", "key": ..., "iv": ...}`.
pub const SECRETS_ENV: &str = "COUCHBASE_CBSASL_SECRETS";

/// Canonical JSON password file.
const PWFILE_ENV: &str = "CBSASL_PWFILE";
/// Legacy flat-text password file, converted on load.
const LEGACY_PWFILE_ENV: &str = "ISASL_PWFILE";

pub struct PasswordStore {
    db: Mutex<Arc<PasswordDatabase>>,
}

impl PasswordStore {
    pub fn new() -> Self {
        PasswordStore {
            db: Mutex::new(Arc::new(PasswordDatabase::default())),
        }
    }

    pub fn snapshot(&self) -> Arc<PasswordDatabase> {
        Arc::clone(&self.db.lock())
    }

    pub fn lookup(&self, username: &str) -> Option<User> {
        self.snapshot().find(username).cloned()
    }

    /// Atomically replace the current database.
    pub fn install(&self, db: PasswordDatabase) {
        *self.db.lock() = Arc::new(db);
    }

    /// Parse and install a canonical JSON document. On any error the
    /// current database stays installed.
    pub fn load_content(&self, content: &str) -> Result<()> {
        let start = Instant::now();
        let db = PasswordDatabase::parse(content)?;
        debug!(users = db.len(), elapsed = ?start.elapsed(), "loaded password database");
        self.install(db);
        Ok(())
    }

    /// Load (and, when the secrets variable is set, decrypt) a password
    /// file.
    pub fn load_file(&self, path: &str) -> Result<()> {
        let content = read_password_file(path)?;
        self.load_content(&content)
    }

    /// Serialize the current database to a password file, encrypting
    /// when the secrets variable is set.
    pub fn save_file(&self, path: &str) -> Result<()> {
        write_password_file(path, &self.snapshot().to_string_pretty())
    }

    /// Install the database named by the environment: `CBSASL_PWFILE`
    /// takes precedence, then `ISASL_PWFILE` (flat format, converted in
    /// memory). With neither set an empty database is kept.
    pub fn bootstrap(&self) -> Result<()> {
        if let Ok(path) = std::env::var(PWFILE_ENV) {
            return self.load_file(&path);
        }

        if let Ok(path) = std::env::var(LEGACY_PWFILE_ENV) {
            let flat = read_password_file(&path)?;
            let mut db = PasswordDatabase::default();
            for line in flat.lines() {
                let Some((username, password)) = super::convert::parse_flat_line(line) else {
                    continue;
                };
                db.insert(UserFactory::create(username, password)?);
            }
            self.install(db);
            return Ok(());
        }

        debug!("no password file specified");
        Ok(())
    }

    /// `SASL_REFRESH`: re-run the bootstrap against the current
    /// environment. Readers observe either the old or the new snapshot.
    pub fn refresh(&self) -> Result<()> {
        self.bootstrap().inspect_err(|e| {
            error!(error = %e, "failed to refresh password database");
        })
    }
}

impl Default for PasswordStore {
    fn default() -> Self {
        Self::new()
    }
}

static STORE: LazyLock<Arc<PasswordStore>> = LazyLock::new(|| Arc::new(PasswordStore::new()));

/// The process-wide store used by sessions unless they were built
/// against a private one.
pub fn store() -> Arc<PasswordStore> {
    Arc::clone(&STORE)
}

fn cipher_spec_from_env() -> Result<Option<CipherSpec>> {
    match std::env::var(SECRETS_ENV) {
        Ok(spec) => Ok(Some(CipherSpec::parse(&spec)?)),
        Err(_) => Ok(None),
    }
}

/// Read a password file, decrypting it when `COUCHBASE_CBSASL_SECRETS`
/// is set. `-` designates stdin.
pub fn read_password_file(path: &str) -> Result<String> {
    let raw = if path == "-" {
        let mut buffer = Vec::new();
        std::io::stdin().read_to_end(&mut buffer)?;
        buffer
    } else {
        std::fs::read(path)?
    };

    let raw = match cipher_spec_from_env()? {
        Some(spec) => spec.decrypt(&raw)?,
        None => raw,
    };

    String::from_utf8(raw)
        .map_err(|_| Error::InvalidFormat(format!("password file [{path}] is not valid UTF-8")))
}

/// Counterpart of [`read_password_file`]. `-` designates stdout.
pub fn write_password_file(path: &str, content: &str) -> Result<()> {
    let payload = match cipher_spec_from_env()? {
        Some(spec) => spec.encrypt(content.as_bytes())?,
        None => content.as_bytes().to_vec(),
    };

    if path == "-" {
        let mut stdout = std::io::stdout();
        stdout.write_all(&payload)?;
        stdout.flush()?;
        return Ok(());
    }
    std::fs::write(path, payload)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sasl::Mechanism;

    fn sample_db() -> PasswordDatabase {
        let mut db = PasswordDatabase::default();
        db.insert(UserFactory::create("alice", "secret").unwrap());
        db.insert(UserFactory::create("bob", "hunter2").unwrap());
        db
    }

    #[test]
    fn lookup_reads_installed_snapshot() {
        let store = PasswordStore::new();
        assert!(store.lookup("alice").is_none());

        store.install(sample_db());
        let alice = store.lookup("alice").unwrap();
        assert!(alice.password_for(Mechanism::ScramSha256).is_ok());
    }

    #[test]
    fn failed_load_preserves_current_database() {
        let store = PasswordStore::new();
        store.install(sample_db());

        assert!(store.load_content("{\"users\": [{\"bad\": 1}]}").is_err());
        assert!(store.lookup("bob").is_some());
    }

    #[test]
    fn in_flight_snapshot_survives_swap() {
        let store = PasswordStore::new();
        store.install(sample_db());
        let snapshot = store.snapshot();

        store.install(PasswordDatabase::default());
        assert!(store.lookup("alice").is_none());
        assert!(snapshot.find("alice").is_some());
    }

    #[test]
    fn file_round_trip_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        let path = path.to_str().unwrap();

        let store = PasswordStore::new();
        store.install(sample_db());
        store.save_file(path).unwrap();

        let reloaded = PasswordStore::new();
        reloaded.load_file(path).unwrap();
        assert_eq!(
            reloaded.lookup("alice").unwrap().to_json(),
            store.lookup("alice").unwrap().to_json()
        );
    }
}
