//! The privilege enumeration and the fixed-width mask over it.

use std::fmt;

use crate::error::{Error, Result};

/// Every capability the command dispatcher may ask about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Privilege {
    /// Read documents in the selected bucket.
    Read,
    /// Create, update or delete documents in the selected bucket.
    Write,
    /// Basic statistics, restricted to the selected bucket.
    SimpleStats,
    /// All statistics in the system.
    Stats,
    /// Create and delete buckets, toggle vbucket states.
    BucketManagement,
    /// Verbosity changes, configuration reload.
    NodeManagement,
    /// Session context management.
    SessionManagement,
    /// Add events to the audit trail.
    Audit,
    /// Reconfigure the audit subsystem.
    AuditManagement,
    /// Set up a DCP stream to apply mutations.
    DcpConsumer,
    /// Set up a DCP stream to produce mutations.
    DcpProducer,
    /// Set up a TAP stream.
    Tap,
    /// Read document meta information.
    MetaRead,
    /// Update document meta information.
    MetaWrite,
    /// Hold an idle connection without being disconnected.
    IdleConnection,
    /// Read document attributes.
    XattrRead,
    /// Read system document attributes.
    SystemXattrRead,
    /// Write document attributes.
    XattrWrite,
    /// Write system document attributes.
    SystemXattrWrite,
    /// Create and delete collections.
    CollectionManagement,
    /// Reload the password database, RBAC database, certificates.
    SecurityManagement,
    /// Execute commands under a different authentication context.
    Impersonate,
}

pub(crate) const PRIVILEGE_COUNT: usize = Privilege::Impersonate as usize + 1;

impl Privilege {
    pub fn parse(name: &str) -> Result<Privilege> {
        use Privilege::*;
        Ok(match name {
            "Read" => Read,
            "Write" => Write,
            "SimpleStats" => SimpleStats,
            "Stats" => Stats,
            "BucketManagement" => BucketManagement,
            "NodeManagement" => NodeManagement,
            "SessionManagement" => SessionManagement,
            "Audit" => Audit,
            "AuditManagement" => AuditManagement,
            "DcpConsumer" => DcpConsumer,
            "DcpProducer" => DcpProducer,
            "Tap" | "TapProducer" | "TapConsumer" => Tap,
            "MetaRead" => MetaRead,
            "MetaWrite" => MetaWrite,
            "IdleConnection" => IdleConnection,
            "XattrRead" => XattrRead,
            "SystemXattrRead" => SystemXattrRead,
            "XattrWrite" => XattrWrite,
            "SystemXattrWrite" => SystemXattrWrite,
            "CollectionManagement" => CollectionManagement,
            "SecurityManagement" => SecurityManagement,
            "Impersonate" => Impersonate,
            _ => {
                return Err(Error::InvalidFormat(format!("unknown privilege: {name}")));
            }
        })
    }

    pub fn as_str(self) -> &'static str {
        use Privilege::*;
        match self {
            Read => "Read",
            Write => "Write",
            SimpleStats => "SimpleStats",
            Stats => "Stats",
            BucketManagement => "BucketManagement",
            NodeManagement => "NodeManagement",
            SessionManagement => "SessionManagement",
            Audit => "Audit",
            AuditManagement => "AuditManagement",
            DcpConsumer => "DcpConsumer",
            DcpProducer => "DcpProducer",
            Tap => "Tap",
            MetaRead => "MetaRead",
            MetaWrite => "MetaWrite",
            IdleConnection => "IdleConnection",
            XattrRead => "XattrRead",
            SystemXattrRead => "SystemXattrRead",
            XattrWrite => "XattrWrite",
            SystemXattrWrite => "SystemXattrWrite",
            CollectionManagement => "CollectionManagement",
            SecurityManagement => "SecurityManagement",
            Impersonate => "Impersonate",
        }
    }

    fn from_index(index: usize) -> Option<Privilege> {
        use Privilege::*;
        const ALL: [Privilege; PRIVILEGE_COUNT] = [
            Read,
            Write,
            SimpleStats,
            Stats,
            BucketManagement,
            NodeManagement,
            SessionManagement,
            Audit,
            AuditManagement,
            DcpConsumer,
            DcpProducer,
            Tap,
            MetaRead,
            MetaWrite,
            IdleConnection,
            XattrRead,
            SystemXattrRead,
            XattrWrite,
            SystemXattrWrite,
            CollectionManagement,
            SecurityManagement,
            Impersonate,
        ];
        ALL.get(index).copied()
    }
}

impl fmt::Display for Privilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Privileges that only make sense outside a bucket; they are masked
/// out of per-bucket privilege lists.
const GLOBAL_ONLY: &[Privilege] = &[
    Privilege::BucketManagement,
    Privilege::NodeManagement,
    Privilege::SessionManagement,
    Privilege::Audit,
    Privilege::AuditManagement,
    Privilege::IdleConnection,
    Privilege::CollectionManagement,
    Privilege::Impersonate,
];

/// Privileges scoped to the selected bucket; the sentinel no-bucket
/// context grants all of them.
const BUCKET_SCOPED: &[Privilege] = &[
    Privilege::Read,
    Privilege::Write,
    Privilege::SimpleStats,
    Privilege::DcpConsumer,
    Privilege::DcpProducer,
    Privilege::Tap,
    Privilege::MetaRead,
    Privilege::MetaWrite,
    Privilege::XattrRead,
    Privilege::SystemXattrRead,
    Privilege::XattrWrite,
    Privilege::SystemXattrWrite,
];

/// A fixed-width bitset covering the whole [`Privilege`] enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrivilegeMask(u32);

impl PrivilegeMask {
    pub fn empty() -> Self {
        PrivilegeMask(0)
    }

    pub fn all() -> Self {
        PrivilegeMask((1 << PRIVILEGE_COUNT) - 1)
    }

    pub fn set(&mut self, privilege: Privilege) {
        self.0 |= 1 << privilege as u32;
    }

    pub fn clear(&mut self, privilege: Privilege) {
        self.0 &= !(1 << privilege as u32);
    }

    pub fn test(&self, privilege: Privilege) -> bool {
        self.0 & (1 << privilege as u32) != 0
    }

    pub fn union(&self, other: PrivilegeMask) -> PrivilegeMask {
        PrivilegeMask(self.0 | other.0)
    }

    pub fn any(&self) -> bool {
        self.0 != 0
    }

    pub fn none(&self) -> bool {
        self.0 == 0
    }

    pub fn is_all(&self) -> bool {
        *self == Self::all()
    }

    /// Drop the privileges that can't be granted at bucket scope.
    pub(crate) fn mask_to_bucket_scope(&mut self) {
        for &privilege in GLOBAL_ONLY {
            self.clear(privilege);
        }
    }

    pub(crate) fn set_bucket_privileges(&mut self) {
        for &privilege in BUCKET_SCOPED {
            self.set(privilege);
        }
    }

    pub(crate) fn clear_bucket_privileges(&mut self) {
        for &privilege in BUCKET_SCOPED {
            self.clear(privilege);
        }
    }
}

impl fmt::Display for PrivilegeMask {
    /// `[none]`, `[all]`, or the granted privileges by name.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_all() {
            return f.write_str("[all]");
        }
        if self.none() {
            return f.write_str("[none]");
        }

        f.write_str("[")?;
        let mut first = true;
        for index in 0..PRIVILEGE_COUNT {
            let privilege = Privilege::from_index(index).expect("index is in range");
            if self.test(privilege) {
                if !first {
                    f.write_str(",")?;
                }
                f.write_str(privilege.as_str())?;
                first = false;
            }
        }
        f.write_str("]")
    }
}
