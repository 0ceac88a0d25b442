//! The password database.
//!
//! The canonical on-disk representation is a JSON document
//! `{"users": [...]}` where each user carries one entry per enabled
//! mechanism (see [`User`]). A human-editable flat format exists for
//! bootstrapping and is converted by [`convert`]. The process-wide
//! [`PasswordStore`] owns the current snapshot and swaps it atomically
//! on refresh.

mod convert;
mod store;
mod user;

use std::collections::HashMap;

use serde_json::Value;

pub use convert::{convert, convert_files};
pub use store::{PasswordStore, SECRETS_ENV, read_password_file, store, write_password_file};
pub use user::{
    PasswordMetaData, User, UserFactory, default_iteration_count, set_default_iteration_count,
};

use crate::error::{Error, Result};

/// An immutable snapshot of all users. Replaced wholesale on reload;
/// never mutated in place while installed.
#[derive(Default)]
pub struct PasswordDatabase {
    users: HashMap<String, User>,
}

impl PasswordDatabase {
    /// Parse the canonical JSON representation. Any error rejects the
    /// whole document.
    pub fn parse(content: &str) -> Result<Self> {
        let root: Value = serde_json::from_str(content)
            .map_err(|e| Error::InvalidFormat(format!("password database: {e}")))?;
        let root = root
            .as_object()
            .ok_or_else(|| Error::InvalidFormat("password database: not an object".into()))?;

        if root.len() != 1 {
            return Err(Error::InvalidFormat(
                "password database: expected a single \"users\" attribute".into(),
            ));
        }
        let users = root
            .get("users")
            .ok_or_else(|| Error::InvalidFormat("password database: \"users\" not present".into()))?
            .as_array()
            .ok_or_else(|| {
                Error::InvalidFormat("password database: \"users\" must be an array".into())
            })?;

        let mut db = PasswordDatabase::default();
        for user in users {
            db.insert(User::from_json(user)?);
        }
        Ok(db)
    }

    pub fn find(&self, username: &str) -> Option<&User> {
        self.users.get(username)
    }

    pub fn insert(&mut self, user: User) {
        self.users.insert(user.username().to_owned(), user);
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn to_json(&self) -> Value {
        let users: Vec<Value> = self.users.values().map(User::to_json).collect();
        serde_json::json!({ "users": users })
    }

    pub fn to_string_pretty(&self) -> String {
        serde_json::to_string_pretty(&self.to_json()).expect("serializing a Value cannot fail")
    }
}
