//! The error taxonomy shared by the whole authentication core.
//!
//! Every fallible operation in this crate reports one of these kinds;
//! nothing panics on untrusted input. The dispatcher turns an [`Error`]
//! into the stable wire code via [`Error::wire_code`].

use std::io;

use thiserror::Error;

use crate::crypto::Algorithm;

/// A convenient result type for the authentication core.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// JSON, flat-file or attribute-list content that doesn't follow
    /// the documented format.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(Algorithm),

    /// AES-256 requires a 32 byte key and a 16 byte IV.
    #[error("invalid key or iv length")]
    InvalidKeyOrIv,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("system random generator failure")]
    RngFailure,

    /// Missing or illegal input supplied by the peer (or the embedder).
    #[error("bad parameter: {0}")]
    BadParameter(&'static str),

    /// The requested mechanism is unknown or disabled.
    #[error("unknown or disabled mechanism")]
    NoMechanism,

    /// The user doesn't exist. Only reported after the full amount of
    /// cryptographic work has been performed against a dummy secret.
    #[error("no such user")]
    NoUser,

    /// The user exists but the supplied proof/password doesn't match.
    #[error("password verification failed")]
    PasswordError,

    /// Generic mechanism failure (server signature mismatch on the
    /// client, explicit `e=` attribute from the server, ...).
    #[error("authentication failed: {0}")]
    Fail(&'static str),

    /// The authenticated user has no entry in the privilege database.
    #[error("no RBAC profile for user")]
    NoRbacProfile,

    /// The user's RBAC profile doesn't cover the requested bucket.
    #[error("no access to bucket [{0}]")]
    NoSuchBucket(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The return codes surfaced to the binary protocol dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WireCode {
    Ok = 0,
    Continue = 1,
    Fail = 2,
    NoMem = 3,
    BadParam = 4,
    NoMech = 5,
    NoUser = 6,
    PasswordError = 7,
    NoRbacProfile = 8,
}

impl Error {
    pub fn wire_code(&self) -> WireCode {
        match self {
            Error::BadParameter(_) => WireCode::BadParam,
            Error::NoMechanism => WireCode::NoMech,
            Error::NoUser => WireCode::NoUser,
            Error::PasswordError => WireCode::PasswordError,
            Error::NoRbacProfile => WireCode::NoRbacProfile,
            Error::InvalidFormat(_)
            | Error::UnsupportedAlgorithm(_)
            | Error::InvalidKeyOrIv
            | Error::DecryptionFailed
            | Error::RngFailure
            | Error::Fail(_)
            | Error::NoSuchBucket(_)
            | Error::Io(_) => WireCode::Fail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_are_stable() {
        assert_eq!(WireCode::Ok as u8, 0);
        assert_eq!(WireCode::Continue as u8, 1);
        assert_eq!(WireCode::NoRbacProfile as u8, 8);
        assert_eq!(Error::NoUser.wire_code(), WireCode::NoUser);
        assert_eq!(Error::PasswordError.wire_code(), WireCode::PasswordError);
        assert_eq!(
            Error::BadParameter("missing attribute").wire_code(),
            WireCode::BadParam
        );
        assert_eq!(Error::DecryptionFailed.wire_code(), WireCode::Fail);
    }
}
