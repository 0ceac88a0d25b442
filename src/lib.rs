//! SASL authentication and role-based access control for a memcached
//! binary-protocol server.
//!
//! The crate owns everything between "bytes arrived for `SASL_AUTH`" and
//! "this connection may run this command against this bucket": the SCRAM
//! and PLAIN mechanisms (both server and client halves), the password
//! database with its on-disk formats, and the privilege database that is
//! consulted on every command dispatch. All I/O is mediated by the
//! caller; the core itself never touches the network.

pub mod crypto;
pub mod error;
mod parse;
mod plain;
pub mod pwdb;
pub mod rbac;
pub mod sasl;
pub mod saslauthd;
mod scram;
pub mod session;

pub use error::{Error, Result, WireCode};
pub use sasl::{Domain, Mechanism, Step};
