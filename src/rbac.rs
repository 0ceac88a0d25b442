//! Role-based access control.
//!
//! The privilege database maps each user to a set of global privileges
//! plus per-bucket privilege sets. Connections don't consult it
//! directly on the hot path; they carry a cheap [`PrivilegeContext`]
//! snapshot stamped with the database generation, and rebuild it when a
//! check comes back [`PrivilegeAccess::Stale`].

mod database;
mod privileges;

pub use database::{
    PrivilegeContext, PrivilegeDatabase, PrivilegeDatabaseHolder, UserEntry, create_context,
    create_initial_context, load_privilege_database, may_access_bucket, privilege_database,
};
pub use privileges::{Privilege, PrivilegeMask};

/// The outcome of a privilege check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeAccess {
    Ok,
    Fail,
    /// The context was created from an older generation of the
    /// privilege database and must be recomputed.
    Stale,
}
