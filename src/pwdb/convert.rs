//! Conversion from the flat bootstrap password format to the canonical
//! JSON database.
//!
//! The flat format is line oriented: `#` starts a comment, blank lines
//! are skipped, carriage returns are tolerated, and each remaining line
//! is `USER [SP PASSWORD]` where a missing password means the empty
//! password.

use std::io::{BufRead, Write};

use serde_json::Value;
use tracing::trace;

use super::{UserFactory, read_password_file, write_password_file};
use crate::error::Result;

/// Split one flat-format line into `(username, password)`. Returns
/// `None` for comments and blank lines.
pub(crate) fn parse_flat_line(line: &str) -> Option<(&str, &str)> {
    if line.starts_with('#') {
        return None;
    }
    let line = match line.find('\r') {
        Some(index) => &line[..index],
        None => line,
    };
    if line.is_empty() {
        return None;
    }
    Some(match line.find(' ') {
        Some(index) => (&line[..index], &line[index + 1..]),
        None => (line, ""),
    })
}

/// Convert a flat password stream into the canonical JSON document.
pub fn convert<R: BufRead, W: Write>(input: R, mut output: W) -> Result<()> {
    let mut users: Vec<Value> = Vec::new();

    for line in input.lines() {
        let line = line?;
        let Some((username, password)) = parse_flat_line(&line) else {
            continue;
        };
        trace!(username, "creating user entry");
        users.push(UserFactory::create(username, password)?.to_json());
    }

    let root = serde_json::json!({ "users": users });
    writeln!(
        output,
        "{}",
        serde_json::to_string_pretty(&root).expect("serializing a Value cannot fail")
    )?;
    Ok(())
}

/// File-to-file conversion honoring the secrets environment variable on
/// both sides, with `-` designating stdin/stdout.
pub fn convert_files(input: &str, output: &str) -> Result<()> {
    let content = read_password_file(input)?;
    let mut converted = Vec::new();
    convert(content.as_bytes(), &mut converted)?;
    let converted = String::from_utf8(converted).expect("conversion emits UTF-8");
    write_password_file(output, &converted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pwdb::PasswordDatabase;
    use crate::sasl::Mechanism;

    #[test]
    fn flat_lines_are_parsed() {
        assert_eq!(parse_flat_line("user password"), Some(("user", "password")));
        assert_eq!(parse_flat_line("user"), Some(("user", "")));
        assert_eq!(parse_flat_line("user pass word"), Some(("user", "pass word")));
        assert_eq!(parse_flat_line("user password\r"), Some(("user", "password")));
        assert_eq!(parse_flat_line("# a comment"), None);
        assert_eq!(parse_flat_line(""), None);
        assert_eq!(parse_flat_line("\r"), None);
    }

    #[test]
    fn convert_produces_a_loadable_database() {
        let flat = "# comment line\n\
                    trond barn\n\
                    \n\
                    mike\n\
                    bob secret with spaces\r\n";
        let mut out = Vec::new();
        convert(flat.as_bytes(), &mut out).unwrap();

        let db = PasswordDatabase::parse(std::str::from_utf8(&out).unwrap()).unwrap();
        assert_eq!(db.len(), 3);
        assert!(db.find("trond").is_some());
        // Missing password means empty password.
        let mike = db.find("mike").unwrap();
        assert!(mike.password_for(Mechanism::Plain).is_ok());
        assert!(db.find("bob").is_some());
        assert!(db.find("# comment line").is_none());
    }
}
