//! The privilege database, its generation counter, and the per
//! connection privilege context.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use super::privileges::{Privilege, PrivilegeMask};
use super::PrivilegeAccess;
use crate::error::{Error, Result};
use crate::sasl::Domain;

/// The in-memory per-user privilege profile.
pub struct UserEntry {
    domain: Domain,
    internal: bool,
    privileges: PrivilegeMask,
    buckets: HashMap<String, PrivilegeMask>,
}

impl UserEntry {
    fn from_json(username: &str, value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::InvalidFormat(format!("user entry [{username}]: not an object")))?;

        // System internal users are prefixed with @.
        let internal = username.starts_with('@');

        let privileges = match obj.get("privileges") {
            Some(value) => parse_privileges(value, false)?,
            None => PrivilegeMask::empty(),
        };

        let mut buckets = HashMap::new();
        if let Some(value) = obj.get("buckets") {
            let entries = value.as_object().ok_or_else(|| {
                Error::InvalidFormat(format!(
                    "user entry [{username}]: \"buckets\" should be an object"
                ))
            })?;
            for (bucket, privileges) in entries {
                let mask = parse_privileges(privileges, true)?;
                if mask.any() {
                    buckets.insert(bucket.clone(), mask);
                }
            }
        }

        let domain = match obj.get("domain") {
            None => Domain::Local,
            Some(value) => {
                let name = value.as_str().ok_or_else(|| {
                    Error::InvalidFormat(format!(
                        "user entry [{username}]: \"domain\" should be a string"
                    ))
                })?;
                Domain::parse(name)?
            }
        };

        Ok(UserEntry {
            domain,
            internal,
            privileges,
            buckets,
        })
    }

    pub fn privileges(&self) -> PrivilegeMask {
        self.privileges
    }

    pub fn buckets(&self) -> &HashMap<String, PrivilegeMask> {
        &self.buckets
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn is_internal(&self) -> bool {
        self.internal
    }
}

/// Parse a JSON array of privilege names. `"all"` grants everything;
/// for bucket lists the privileges that can't be scoped to a bucket
/// are masked back out.
fn parse_privileges(value: &Value, bucket: bool) -> Result<PrivilegeMask> {
    let names = value
        .as_array()
        .ok_or_else(|| Error::InvalidFormat("privileges must be specified as an array".into()))?;

    let mut mask = PrivilegeMask::empty();
    for name in names {
        let name = name.as_str().ok_or_else(|| {
            Error::InvalidFormat("privileges must be specified as strings".into())
        })?;
        if name == "all" {
            mask = PrivilegeMask::all();
        } else {
            mask.set(Privilege::parse(name)?);
        }
    }

    if bucket {
        mask.mask_to_bucket_scope();
    }
    Ok(mask)
}

/// A complete, immutable privilege database stamped with the
/// generation it was installed under.
pub struct PrivilegeDatabase {
    pub generation: u32,
    users: HashMap<String, UserEntry>,
}

impl PrivilegeDatabase {
    fn empty(generation: u32) -> Self {
        PrivilegeDatabase {
            generation,
            users: HashMap::new(),
        }
    }

    fn parse(content: &str, generation: u32) -> Result<Self> {
        let root: Value = serde_json::from_str(content)
            .map_err(|e| Error::InvalidFormat(format!("privilege database: {e}")))?;
        let root = root
            .as_object()
            .ok_or_else(|| Error::InvalidFormat("privilege database: not an object".into()))?;

        let mut users = HashMap::new();
        for (username, entry) in root {
            users.insert(username.clone(), UserEntry::from_json(username, entry)?);
        }
        Ok(PrivilegeDatabase { generation, users })
    }

    pub fn lookup(&self, username: &str) -> Result<&UserEntry> {
        self.users.get(username).ok_or(Error::NoRbacProfile)
    }
}

/// The holder owns the installed database and the generation counter
/// contexts validate against. Checks against the counter are wait-free;
/// only installs take the write lock.
pub struct PrivilegeDatabaseHolder {
    db: RwLock<Arc<PrivilegeDatabase>>,
    generation: Arc<AtomicU32>,
}

impl PrivilegeDatabaseHolder {
    pub fn new() -> Self {
        let generation = Arc::new(AtomicU32::new(1));
        PrivilegeDatabaseHolder {
            db: RwLock::new(Arc::new(PrivilegeDatabase::empty(1))),
            generation,
        }
    }

    pub fn snapshot(&self) -> Arc<PrivilegeDatabase> {
        Arc::clone(&self.db.read())
    }

    /// Parse and install a new database. A racing install with a newer
    /// generation wins; the loser is dropped.
    ///
    /// The shared generation counter only advances together with the
    /// swap: a failed parse leaves both the installed database and the
    /// counter untouched, so outstanding contexts stay valid and the
    /// stale-recovery path can always rebuild a fresh one.
    pub fn install_from_json(&self, content: &str) -> Result<()> {
        let candidate = self.generation.load(Ordering::Acquire) + 1;
        let database = PrivilegeDatabase::parse(content, candidate)?;
        debug!(generation = database.generation, "installing privilege database");

        let mut db = self.db.write();
        if db.generation < database.generation {
            *db = Arc::new(database);
            self.generation.fetch_max(candidate, Ordering::AcqRel);
        }
        Ok(())
    }

    pub fn load_file(&self, path: &str) -> Result<()> {
        let content = std::fs::read_to_string(path)?;
        self.install_from_json(&content)
    }

    /// Build the privilege context for a (user, bucket) pair. An empty
    /// bucket name yields a context over the global privileges only.
    pub fn create_context(&self, username: &str, bucket: &str) -> Result<PrivilegeContext> {
        let db = self.snapshot();
        let entry = db.lookup(username)?;

        let mut mask = PrivilegeMask::empty();
        if !bucket.is_empty() {
            mask = *entry
                .buckets()
                .get(bucket)
                .ok_or_else(|| Error::NoSuchBucket(bucket.to_owned()))?;
        }
        let mask = mask.union(entry.privileges());

        Ok(PrivilegeContext {
            generation: db.generation,
            mask,
            current: Arc::clone(&self.generation),
        })
    }

    /// Build the context handed to a connection right after
    /// authentication: global privileges only, plus the internal-user
    /// flag. The user must exist in the stated domain.
    pub fn create_initial_context(
        &self,
        username: &str,
        domain: Domain,
    ) -> Result<(PrivilegeContext, bool)> {
        let db = self.snapshot();
        let entry = db.lookup(username)?;
        if entry.domain() != domain {
            return Err(Error::NoRbacProfile);
        }

        Ok((
            PrivilegeContext {
                generation: db.generation,
                mask: entry.privileges(),
                current: Arc::clone(&self.generation),
            },
            entry.is_internal(),
        ))
    }

    pub fn may_access_bucket(&self, username: &str, bucket: &str) -> bool {
        self.create_context(username, bucket).is_ok()
    }

    /// A context that is stale from birth; connections start with one
    /// and pick up real privileges on the first recheck.
    pub fn uninitialized_context(&self) -> PrivilegeContext {
        PrivilegeContext {
            generation: u32::MAX,
            mask: PrivilegeMask::empty(),
            current: Arc::clone(&self.generation),
        }
    }

    /// A context that is valid for the current generation but grants
    /// nothing. Installed when a recheck cannot produce a real context
    /// so subsequent checks deny fast instead of looping on Stale.
    pub fn empty_context(&self) -> PrivilegeContext {
        PrivilegeContext {
            generation: self.generation.load(Ordering::Acquire),
            mask: PrivilegeMask::empty(),
            current: Arc::clone(&self.generation),
        }
    }
}

impl Default for PrivilegeDatabaseHolder {
    fn default() -> Self {
        Self::new()
    }
}

/// A cheap snapshot of one user's effective privileges in one bucket.
/// `check` is called (possibly several times) for every command.
#[derive(Clone)]
pub struct PrivilegeContext {
    generation: u32,
    mask: PrivilegeMask,
    current: Arc<AtomicU32>,
}

impl PrivilegeContext {
    pub fn check(&self, privilege: Privilege) -> PrivilegeAccess {
        if self.generation != self.current.load(Ordering::Acquire) {
            return PrivilegeAccess::Stale;
        }
        if self.mask.test(privilege) {
            PrivilegeAccess::Ok
        } else {
            PrivilegeAccess::Fail
        }
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn mask(&self) -> PrivilegeMask {
        self.mask
    }

    /// Grant every bucket-scoped privilege; used for the sentinel "no
    /// bucket" attached before a real bucket is selected.
    pub fn set_bucket_privileges(&mut self) {
        self.mask.set_bucket_privileges();
    }

    /// Remove every bucket-scoped privilege.
    pub fn clear_bucket_privileges(&mut self) {
        self.mask.clear_bucket_privileges();
    }
}

impl std::fmt::Display for PrivilegeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.mask, f)
    }
}

static HOLDER: LazyLock<Arc<PrivilegeDatabaseHolder>> =
    LazyLock::new(|| Arc::new(PrivilegeDatabaseHolder::new()));

/// The process-wide privilege database.
pub fn privilege_database() -> Arc<PrivilegeDatabaseHolder> {
    Arc::clone(&HOLDER)
}

/// Convenience wrappers over the process-wide holder.
pub fn create_context(username: &str, bucket: &str) -> Result<PrivilegeContext> {
    privilege_database().create_context(username, bucket)
}

pub fn create_initial_context(
    username: &str,
    domain: Domain,
) -> Result<(PrivilegeContext, bool)> {
    privilege_database().create_initial_context(username, domain)
}

pub fn may_access_bucket(username: &str, bucket: &str) -> bool {
    privilege_database().may_access_bucket(username, bucket)
}

/// Install the named file as the current privilege database.
pub fn load_privilege_database(path: &str) -> Result<()> {
    privilege_database().load_file(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "alice": {
            "domain": "local",
            "privileges": ["Stats", "Audit"],
            "buckets": {
                "bucket-a": ["Read", "Write"],
                "bucket-b": ["Read"]
            }
        },
        "@internal": {
            "privileges": ["all"]
        },
        "remote": {
            "domain": "external",
            "buckets": {"bucket-a": ["Read"]}
        }
    }"#;

    fn holder() -> PrivilegeDatabaseHolder {
        let holder = PrivilegeDatabaseHolder::new();
        holder.install_from_json(SAMPLE).unwrap();
        holder
    }

    #[test]
    fn context_unions_bucket_and_global_privileges() {
        let holder = holder();
        let context = holder.create_context("alice", "bucket-a").unwrap();
        assert_eq!(context.check(Privilege::Read), PrivilegeAccess::Ok);
        assert_eq!(context.check(Privilege::Write), PrivilegeAccess::Ok);
        assert_eq!(context.check(Privilege::Stats), PrivilegeAccess::Ok);
        assert_eq!(context.check(Privilege::MetaRead), PrivilegeAccess::Fail);

        let context = holder.create_context("alice", "bucket-b").unwrap();
        assert_eq!(context.check(Privilege::Write), PrivilegeAccess::Fail);
    }

    #[test]
    fn empty_bucket_name_is_global_only() {
        let holder = holder();
        let context = holder.create_context("alice", "").unwrap();
        assert_eq!(context.check(Privilege::Stats), PrivilegeAccess::Ok);
        assert_eq!(context.check(Privilege::Read), PrivilegeAccess::Fail);
    }

    #[test]
    fn unknown_user_and_bucket_are_rejected() {
        let holder = holder();
        assert!(matches!(
            holder.create_context("bob", "bucket-a"),
            Err(Error::NoRbacProfile)
        ));
        assert!(matches!(
            holder.create_context("alice", "bucket-z"),
            Err(Error::NoSuchBucket(_))
        ));
        assert!(holder.may_access_bucket("alice", "bucket-a"));
        assert!(!holder.may_access_bucket("alice", "bucket-z"));
    }

    #[test]
    fn initial_context_checks_domain_and_internal_flag() {
        let holder = holder();
        let (context, internal) = holder
            .create_initial_context("alice", Domain::Local)
            .unwrap();
        assert!(!internal);
        assert_eq!(context.check(Privilege::Stats), PrivilegeAccess::Ok);

        assert!(holder
            .create_initial_context("remote", Domain::Local)
            .is_err());
        let (_, internal) = holder
            .create_initial_context("@internal", Domain::Local)
            .unwrap();
        assert!(internal);
    }

    #[test]
    fn reload_makes_existing_contexts_stale() {
        let holder = holder();
        let context = holder.create_context("alice", "bucket-a").unwrap();
        assert_eq!(context.check(Privilege::Read), PrivilegeAccess::Ok);

        holder.install_from_json(SAMPLE).unwrap();
        assert_eq!(context.check(Privilege::Read), PrivilegeAccess::Stale);

        // Rebuilding against the new generation recovers.
        let rebuilt = holder.create_context("alice", "bucket-a").unwrap();
        assert_eq!(rebuilt.check(Privilege::Read), PrivilegeAccess::Ok);
    }

    #[test]
    fn uninitialized_context_is_permanently_stale() {
        let holder = holder();
        let context = holder.uninitialized_context();
        assert_eq!(context.check(Privilege::Read), PrivilegeAccess::Stale);
        holder.install_from_json(SAMPLE).unwrap();
        assert_eq!(context.check(Privilege::Read), PrivilegeAccess::Stale);
    }

    #[test]
    fn failed_install_keeps_current_database() {
        let holder = holder();
        let context = holder.create_context("alice", "bucket-a").unwrap();

        assert!(holder.install_from_json("{\"x\": []}").is_err());
        // Neither the installed data nor the generation moved, so
        // outstanding contexts are still valid and new ones can be
        // built against the current generation.
        assert_eq!(context.check(Privilege::Read), PrivilegeAccess::Ok);
        let rebuilt = holder.create_context("alice", "bucket-a").unwrap();
        assert_eq!(rebuilt.check(Privilege::Read), PrivilegeAccess::Ok);
    }

    #[test]
    fn bucket_lists_cannot_grant_global_privileges() {
        let holder = PrivilegeDatabaseHolder::new();
        holder
            .install_from_json(
                r#"{"u": {"buckets": {"b": ["Read", "BucketManagement"]}}}"#,
            )
            .unwrap();
        let context = holder.create_context("u", "b").unwrap();
        assert_eq!(context.check(Privilege::Read), PrivilegeAccess::Ok);
        assert_eq!(
            context.check(Privilege::BucketManagement),
            PrivilegeAccess::Fail
        );
    }

    #[test]
    fn unknown_privilege_name_rejects_database() {
        let holder = PrivilegeDatabaseHolder::new();
        assert!(matches!(
            holder.install_from_json(r#"{"u": {"privileges": ["Fly"]}}"#),
            Err(Error::InvalidFormat(_))
        ));
    }
}
