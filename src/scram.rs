//! Salted Challenge Response Authentication Mechanism.
//!
//! RFC: <https://datatracker.ietf.org/doc/html/rfc5802>.
//!
//! Both halves of the exchange live here: [`server`] answers
//! `SASL_AUTH`/`SASL_STEP` for SCRAM-SHA1/256/512, [`client`] produces
//! the matching messages for outgoing connections. The two share the
//! attribute codec in [`messages`] and the key-derivation helpers
//! below; the hash algorithm itself is a runtime [`Algorithm`] tag
//! resolved by the crypto layer.

pub(crate) mod client;
pub(crate) mod messages;
pub(crate) mod server;

use std::fmt::Write as _;

use zeroize::Zeroizing;

use crate::crypto::{self, Algorithm};
use crate::error::{Error, Result};

/// Nonces are this many random bytes, hex-encoded to twice as many
/// characters.
const RAW_NONCE_LEN: usize = 8;

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(out, "{byte:02x}").expect("writing to a String cannot fail");
    }
    out
}

/// Generate a fresh hex-encoded nonce, or validate and adopt the
/// override installed by a test hook.
fn generate_nonce(nonce_override: Option<String>) -> Result<String> {
    match nonce_override {
        Some(nonce) => {
            if nonce.is_empty()
                || nonce
                    .chars()
                    .any(|c| c == ',' || !c.is_ascii() || !(' '..='~').contains(&c))
            {
                return Err(Error::BadParameter("invalid character in nonce"));
            }
            Ok(nonce)
        }
        None => Ok(hex_encode(&crypto::random_bytes(RAW_NONCE_LEN)?)),
    }
}

/// The concatenation both proofs are computed over:
/// `client-first-message-bare , server-first-message ,
/// client-final-message-without-proof`.
fn auth_message(
    client_first_message_bare: &str,
    server_first_message: &str,
    client_final_message_without_proof: &str,
) -> String {
    format!("{client_first_message_bare},{server_first_message},{client_final_message_without_proof}")
}

/// ClientProof := ClientKey XOR HMAC(H(ClientKey), AuthMessage)
fn client_proof(algorithm: Algorithm, salted_password: &[u8], auth_message: &str) -> Vec<u8> {
    let client_key = Zeroizing::new(crypto::hmac(algorithm, salted_password, b"Client Key"));
    let stored_key = Zeroizing::new(crypto::digest(algorithm, &client_key));
    let client_signature = crypto::hmac(algorithm, &stored_key, auth_message.as_bytes());

    std::iter::zip(client_key.iter(), client_signature.iter())
        .map(|(k, s)| k ^ s)
        .collect()
}

/// ServerSignature := HMAC(HMAC(SaltedPassword, "Server Key"), AuthMessage)
fn server_signature(algorithm: Algorithm, salted_password: &[u8], auth_message: &str) -> Vec<u8> {
    let server_key = Zeroizing::new(crypto::hmac(algorithm, salted_password, b"Server Key"));
    crypto::hmac(algorithm, &server_key, auth_message.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_is_hex_of_eight_bytes() {
        let nonce = generate_nonce(None).unwrap();
        assert_eq!(nonce.len(), 16);
        assert!(nonce.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn nonce_override_is_validated() {
        assert_eq!(
            generate_nonce(Some("fyko+d2lbbFgONRv9qkxdawL".into())).unwrap(),
            "fyko+d2lbbFgONRv9qkxdawL"
        );
        assert!(generate_nonce(Some("with,comma".into())).is_err());
        assert!(generate_nonce(Some("with\ttab".into())).is_err());
        assert!(generate_nonce(Some(String::new())).is_err());
    }
}
