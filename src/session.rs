//! Per-connection authentication sessions.
//!
//! A [`ServerSession`] is the object the command dispatcher talks to:
//! it owns the active mechanism state machine across the
//! `SASL_AUTH`/`SASL_STEP` exchanges, exposes the authenticated
//! identity afterwards, and carries the RBAC privilege context that is
//! consulted on every subsequent command. The [`ClientSession`] is the
//! mirror image used when this process dials out.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::pwdb::{self, PasswordStore};
use crate::rbac::{self, Privilege, PrivilegeAccess, PrivilegeContext, PrivilegeDatabaseHolder};
use crate::sasl::{
    self, ClientMechanism, Domain, Mechanism, ServerMechanism, ServerMechanismConfig, Step,
};

/// Credential suppliers for the client role.
pub struct ClientCallbacks {
    pub get_username: Box<dyn Fn() -> String + Send + Sync>,
    pub get_password: Box<dyn Fn() -> String + Send + Sync>,
}

pub struct ServerSessionBuilder {
    tls: bool,
    store: Option<Arc<PasswordStore>>,
    rbac: Option<Arc<PrivilegeDatabaseHolder>>,
    nonce_override: Option<String>,
}

impl ServerSessionBuilder {
    /// Mark the transport as confidentiality protected, which is what
    /// gates the PLAIN mechanism.
    pub fn tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Authenticate against a private password store instead of the
    /// process-wide one.
    pub fn store(mut self, store: Arc<PasswordStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Resolve privileges against a private database instead of the
    /// process-wide one.
    pub fn rbac(mut self, rbac: Arc<PrivilegeDatabaseHolder>) -> Self {
        self.rbac = Some(rbac);
        self
    }

    /// Test hook: pin the server nonce instead of drawing a random one.
    pub fn nonce_override(mut self, nonce: impl Into<String>) -> Self {
        self.nonce_override = Some(nonce.into());
        self
    }

    pub fn build(self) -> ServerSession {
        let rbac = self.rbac.unwrap_or_else(rbac::privilege_database);
        let privilege_context = rbac.uninitialized_context();
        ServerSession {
            tls: self.tls,
            store: self.store.unwrap_or_else(pwdb::store),
            rbac,
            nonce_override: self.nonce_override,
            mechanism: None,
            backend: None,
            username: String::new(),
            domain: Domain::Local,
            internal: false,
            uuid: None,
            privilege_context,
            bucket: String::new(),
        }
    }
}

pub struct ServerSession {
    tls: bool,
    store: Arc<PasswordStore>,
    rbac: Arc<PrivilegeDatabaseHolder>,
    nonce_override: Option<String>,

    mechanism: Option<Mechanism>,
    backend: Option<Box<dyn ServerMechanism>>,

    username: String,
    domain: Domain,
    internal: bool,

    /// Correlation id for fail-path log lines; cleared on every
    /// `start`/`step` and materialized lazily when something fails.
    uuid: Option<Uuid>,

    privilege_context: PrivilegeContext,
    bucket: String,
}

impl ServerSession {
    pub fn builder() -> ServerSessionBuilder {
        ServerSessionBuilder {
            tls: false,
            store: None,
            rbac: None,
            nonce_override: None,
        }
    }

    /// `LIST_MECHANISMS`: what this connection may authenticate with.
    pub fn list_mechanisms(&self) -> (String, usize) {
        sasl::registry().list(self.tls, None, Some(" "), None)
    }

    /// `SASL_AUTH`: begin authentication with the named mechanism.
    pub fn start(&mut self, mechanism: &str, input: &[u8]) -> Result<Step> {
        self.uuid = None;

        let mechanism = match Mechanism::parse(mechanism) {
            Ok(mechanism) => mechanism,
            Err(error) => {
                self.log_failure(&error, mechanism);
                return Err(error);
            }
        };
        debug!(mechanism = %mechanism, "client requests mechanism");
        self.mechanism = Some(mechanism);

        let mut backend = sasl::registry().create_server(
            mechanism,
            self.tls,
            ServerMechanismConfig {
                store: Arc::clone(&self.store),
                nonce_override: self.nonce_override.clone(),
            },
        )?;

        let result = backend.start(input);
        self.backend = Some(backend);
        self.conclude(result)
    }

    /// `SASL_STEP`: continue a multi-step exchange.
    pub fn step(&mut self, input: &[u8]) -> Result<Step> {
        self.uuid = None;

        let Some(mut backend) = self.backend.take() else {
            return Err(Error::BadParameter("step without a started mechanism"));
        };
        let result = backend.step(input);
        self.backend = Some(backend);
        self.conclude(result)
    }

    /// Common tail of `start`/`step`: adopt the identity on success,
    /// stamp and log the failure otherwise.
    fn conclude(&mut self, result: Result<Step>) -> Result<Step> {
        match result {
            Ok(step) => {
                let backend = self.backend.as_ref().expect("set by start");
                self.username = backend.username().to_owned();
                self.domain = backend.domain();
                Ok(step)
            }
            Err(error) => {
                let subject = self
                    .backend
                    .as_ref()
                    .map_or_else(String::new, |b| b.username().to_owned());
                self.log_failure(&error, &subject);
                Err(error)
            }
        }
    }

    fn log_failure(&mut self, error: &Error, subject: &str) {
        let uuid = *self.uuid.get_or_insert_with(Uuid::new_v4);
        warn!(%uuid, subject, %error, "authentication failure");
    }

    /// Drop all authentication state, as if the connection had just
    /// been accepted.
    pub fn restart_authentication(&mut self) {
        self.mechanism = None;
        self.backend = None;
        self.username.clear();
        self.domain = Domain::Local;
        self.internal = false;
        self.uuid = None;
        self.privilege_context = self.rbac.uninitialized_context();
        self.bucket.clear();
    }

    /// Bind the authenticated identity to its RBAC profile. Called by
    /// the dispatcher once `start`/`step` returned [`Step::Success`];
    /// a missing profile surfaces as `NO_RBAC_PROFILE` on the wire.
    pub fn bind_rbac_profile(&mut self) -> Result<()> {
        let (mut context, internal) = self
            .rbac
            .create_initial_context(&self.username, self.domain)
            .inspect_err(|error| {
                let uuid = *self.uuid.get_or_insert_with(Uuid::new_v4);
                warn!(%uuid, username = %self.username, %error, "no RBAC profile");
            })?;
        // Until a bucket is selected the connection sits on the
        // sentinel "no bucket", which grants every bucket privilege.
        context.set_bucket_privileges();
        self.privilege_context = context;
        self.internal = internal;
        self.bucket.clear();
        Ok(())
    }

    /// `SELECT_BUCKET`: attach the connection to a bucket and swap in
    /// the matching privilege context. The empty name selects the
    /// sentinel "no bucket".
    pub fn select_bucket(&mut self, bucket: &str) -> Result<()> {
        if bucket.is_empty() {
            return self.bind_rbac_profile();
        }

        let context = self.rbac.create_context(&self.username, bucket)?;
        self.privilege_context = context;
        self.bucket = bucket.to_owned();
        Ok(())
    }

    /// The per-command privilege gate. Recovers from [`Stale`] locally
    /// by rebuilding the context against the current database; the
    /// caller only ever sees `Ok` or `Fail`.
    ///
    /// [`Stale`]: PrivilegeAccess::Stale
    pub fn check_privilege(&mut self, privilege: Privilege) -> PrivilegeAccess {
        let access = self.privilege_context.check(privilege);
        if access != PrivilegeAccess::Stale {
            return access;
        }

        match self.rbac.create_context(&self.username, &self.bucket) {
            Ok(context) => self.privilege_context = context,
            Err(Error::NoSuchBucket(bucket)) => {
                // The bucket went away (or access was revoked): fall
                // back to a context with no bucket access at all.
                match self.rbac.create_context(&self.username, "") {
                    Ok(context) => {
                        debug!(
                            username = %self.username,
                            bucket = %bucket,
                            context = %context,
                            "no access to bucket, dropping bucket privileges"
                        );
                        self.privilege_context = context;
                    }
                    Err(error) => {
                        warn!(username = %self.username, %error, "privilege recheck failed");
                        self.privilege_context = self.rbac.empty_context();
                        return PrivilegeAccess::Fail;
                    }
                }
            }
            Err(error) => {
                warn!(username = %self.username, %error, "privilege recheck failed");
                self.privilege_context = self.rbac.empty_context();
                return PrivilegeAccess::Fail;
            }
        }

        self.privilege_context.check(privilege)
    }

    pub fn mechanism(&self) -> Option<Mechanism> {
        self.mechanism
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn is_internal(&self) -> bool {
        self.internal
    }

    /// The correlation id attached to the most recent failure, if any.
    pub fn identity_uuid(&self) -> Option<Uuid> {
        self.uuid
    }

    pub fn privilege_context(&self) -> &PrivilegeContext {
        &self.privilege_context
    }
}

pub struct ClientSession {
    callbacks: ClientCallbacks,
    nonce_override: Option<String>,
    mechanism: Option<Mechanism>,
    backend: Option<Box<dyn ClientMechanism>>,
}

impl ClientSession {
    pub fn new(
        get_username: impl Fn() -> String + Send + Sync + 'static,
        get_password: impl Fn() -> String + Send + Sync + 'static,
    ) -> Self {
        ClientSession {
            callbacks: ClientCallbacks {
                get_username: Box::new(get_username),
                get_password: Box::new(get_password),
            },
            nonce_override: None,
            mechanism: None,
            backend: None,
        }
    }

    /// Test hook: pin the client nonce instead of drawing a random one.
    pub fn set_nonce_override(&mut self, nonce: impl Into<String>) {
        self.nonce_override = Some(nonce.into());
    }

    /// Pick the strongest enabled mechanism from the server-advertised
    /// list and produce the initial message (empty for PLAIN-style
    /// server-first mechanisms, the client-first-message for SCRAM).
    pub fn start(&mut self, offered: &str) -> Result<Step> {
        let mechanism = sasl::registry().select(offered, true)?;
        debug!(mechanism = %mechanism, "selected mechanism");
        self.mechanism = Some(mechanism);

        let mut backend =
            sasl::registry().create_client(mechanism, self.nonce_override.clone())?;
        let result = backend.start(&self.callbacks);
        self.backend = Some(backend);
        result
    }

    /// Feed a server challenge through the active mechanism.
    pub fn step(&mut self, input: &[u8]) -> Result<Step> {
        let Some(mut backend) = self.backend.take() else {
            return Err(Error::BadParameter("step without a started mechanism"));
        };
        let result = backend.step(&self.callbacks, input);
        self.backend = Some(backend);
        result
    }

    pub fn mechanism(&self) -> Option<Mechanism> {
        self.mechanism
    }
}
