//! The SCRAM attribute-list codec.
//!
//! Messages are comma-separated `k=v` pairs with single-character keys.
//! Validation happens on both sides of the codec: the decoder rejects
//! malformed lists, and the encoder refuses to write a value that would
//! produce one.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use tracing::debug;

use crate::error::{Error, Result};

fn is_printable(c: char) -> bool {
    ('!'..='~').contains(&c) || c == ' '
}

/// Decode `k=value,y=value` into a key → value map. Multi-character and
/// duplicate keys are format errors.
pub(crate) fn decode_attribute_list(list: &str) -> Result<BTreeMap<char, String>> {
    debug!(list, "decoding attribute list");

    let mut attributes = BTreeMap::new();
    let mut rest = list;
    while !rest.is_empty() {
        let equal = rest
            .find('=')
            .ok_or_else(|| Error::InvalidFormat(format!("attribute list [{list}]: no '='")))?;
        if equal != 1 {
            return Err(Error::InvalidFormat(format!(
                "attribute list [{list}]: key is not a single character"
            )));
        }

        let key = rest.chars().next().expect("checked non-empty");
        let value = &rest[2..];
        let (value, tail) = match value.find(',') {
            Some(comma) => (&value[..comma], &value[comma + 1..]),
            None => (value, ""),
        };

        if attributes.insert(key, value.to_owned()).is_some() {
            return Err(Error::InvalidFormat(format!(
                "attribute list [{list}]: duplicated key [{key}]"
            )));
        }
        rest = tail;
    }

    Ok(attributes)
}

/// Append a textual attribute. Only `n` (username), `r` (nonce) and `e`
/// (error text) carry text; using any other key here is a bug in the
/// caller.
pub(crate) fn add_attribute(out: &mut String, key: char, value: &str, more: bool) -> Result<()> {
    out.push(key);
    out.push('=');

    match key {
        'n' => {
            let prepared = saslprep(value)?;
            out.push_str(&encode_username(&prepared));
        }
        'r' | 'e' => {
            if value.chars().any(|c| c == ',' || !is_printable(c)) {
                return Err(Error::BadParameter("invalid character in attribute value"));
            }
            out.push_str(value);
        }
        _ => unreachable!("attribute key [{key}] does not carry text"),
    }

    if more {
        out.push(',');
    }
    Ok(())
}

/// Append a binary attribute, base64-encoded. Only the GS2 header
/// (`c`), salt (`s`), client proof (`p`) and server signature (`v`)
/// carry binary payloads.
pub(crate) fn add_attribute_b64(out: &mut String, key: char, value: &[u8], more: bool) {
    assert!(
        matches!(key, 'c' | 's' | 'p' | 'v'),
        "attribute key [{key}] does not carry a base64 payload"
    );
    out.push(key);
    out.push('=');
    out.push_str(&BASE64_STANDARD.encode(value));
    if more {
        out.push(',');
    }
}

/// Append the iteration-count attribute (`i`).
pub(crate) fn add_iteration_count(out: &mut String, count: u32, more: bool) {
    out.push_str("i=");
    out.push_str(&count.to_string());
    if more {
        out.push(',');
    }
}

/// SASLprep (RFC 4013) normalization of a username.
pub(crate) fn saslprep(username: &str) -> Result<String> {
    stringprep::saslprep(username)
        .map(|prepared| prepared.into_owned())
        .map_err(|_| Error::BadParameter("invalid character in username"))
}

/// Escape the characters with meaning inside an attribute list:
/// `,` becomes `=2C` and `=` becomes `=3D`.
pub(crate) fn encode_username(username: &str) -> String {
    let mut out = String::with_capacity(username.len());
    for c in username.chars() {
        match c {
            ',' => out.push_str("=2C"),
            '=' => out.push_str("=3D"),
            _ => out.push(c),
        }
    }
    out
}

/// Inverse of [`encode_username`]. Any `=` not followed by `2C` or `3D`
/// is a format error.
pub(crate) fn decode_username(username: &str) -> Result<String> {
    let mut out = String::with_capacity(username.len());
    let mut chars = username.chars();
    while let Some(c) = chars.next() {
        if c != '=' {
            out.push(c);
            continue;
        }
        match (chars.next(), chars.next()) {
            (Some('2'), Some('C')) => out.push(','),
            (Some('3'), Some('D')) => out.push('='),
            _ => {
                return Err(Error::BadParameter(
                    "invalid username escape sequence, should be =2C or =3D",
                ));
            }
        }
    }
    Ok(out)
}

/// Decode a base64 attribute value.
pub(crate) fn decode_base64(value: &str) -> Result<Vec<u8>> {
    BASE64_STANDARD
        .decode(value)
        .map_err(|_| Error::InvalidFormat("illegal base64 in attribute value".into()))
}

/// Parse the decimal iteration-count attribute.
pub(crate) fn parse_iteration_count(value: &str) -> Result<u32> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidFormat(format!(
            "invalid iteration count [{value}]"
        )));
    }
    value
        .parse()
        .map_err(|_| Error::InvalidFormat(format!("invalid iteration count [{value}]")))
}
