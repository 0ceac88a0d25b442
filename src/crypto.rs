//! Cryptographic primitives.
//!
//! Everything algorithm-specific is funneled through this narrow module
//! so the SCRAM state machines stay generic over the hash family. The
//! primitives delegate to the RustCrypto implementations; no other
//! module talks to a hash or cipher directly.

use std::fmt;

use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use hmac::{Hmac, Mac};
use md5::Md5;
use rand::RngCore;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

use crate::error::{Error, Result};

pub const MD5_DIGEST_SIZE: usize = 16;
pub const SHA1_DIGEST_SIZE: usize = 20;
pub const SHA256_DIGEST_SIZE: usize = 32;
pub const SHA512_DIGEST_SIZE: usize = 64;

/// The hash algorithms the subsystem knows about. MD5 is accepted for
/// digest and HMAC but never for key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl Algorithm {
    pub fn digest_size(self) -> usize {
        match self {
            Algorithm::Md5 => MD5_DIGEST_SIZE,
            Algorithm::Sha1 => SHA1_DIGEST_SIZE,
            Algorithm::Sha256 => SHA256_DIGEST_SIZE,
            Algorithm::Sha512 => SHA512_DIGEST_SIZE,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Algorithm::Md5 => "MD5",
            Algorithm::Sha1 => "SHA-1",
            Algorithm::Sha256 => "SHA-256",
            Algorithm::Sha512 => "SHA-512",
        })
    }
}

/// Capability probe used by the mechanism registry. With the bundled
/// implementations every algorithm is available on every platform, but
/// the registry still goes through this function so availability stays
/// a property of the crypto layer.
pub fn is_supported(_algorithm: Algorithm) -> bool {
    true
}

pub fn digest(algorithm: Algorithm, data: &[u8]) -> Vec<u8> {
    match algorithm {
        Algorithm::Md5 => Md5::digest(data).to_vec(),
        Algorithm::Sha1 => Sha1::digest(data).to_vec(),
        Algorithm::Sha256 => Sha256::digest(data).to_vec(),
        Algorithm::Sha512 => Sha512::digest(data).to_vec(),
    }
}

macro_rules! hmac_with {
    ($digest:ty, $key:expr, $data:expr) => {{
        let mut mac = Hmac::<$digest>::new_from_slice($key).expect("hmac accepts any key size");
        mac.update($data);
        mac.finalize().into_bytes().to_vec()
    }};
}

/// RFC 2104 HMAC. Any key length is accepted; the output length equals
/// the digest size of the algorithm.
pub fn hmac(algorithm: Algorithm, key: &[u8], data: &[u8]) -> Vec<u8> {
    match algorithm {
        Algorithm::Md5 => hmac_with!(Md5, key, data),
        Algorithm::Sha1 => hmac_with!(Sha1, key, data),
        Algorithm::Sha256 => hmac_with!(Sha256, key, data),
        Algorithm::Sha512 => hmac_with!(Sha512, key, data),
    }
}

/// RFC 8018 PBKDF2 with HMAC as the PRF. The output length equals the
/// digest size. MD5 is rejected.
pub fn pbkdf2_hmac(
    algorithm: Algorithm,
    passphrase: &[u8],
    salt: &[u8],
    iterations: u32,
) -> Result<Vec<u8>> {
    if iterations == 0 {
        return Err(Error::BadParameter("pbkdf2 iteration count must be >= 1"));
    }

    let mut out = vec![0u8; algorithm.digest_size()];
    match algorithm {
        Algorithm::Md5 => return Err(Error::UnsupportedAlgorithm(Algorithm::Md5)),
        Algorithm::Sha1 => pbkdf2::pbkdf2_hmac::<Sha1>(passphrase, salt, iterations, &mut out),
        Algorithm::Sha256 => pbkdf2::pbkdf2_hmac::<Sha256>(passphrase, salt, iterations, &mut out),
        Algorithm::Sha512 => pbkdf2::pbkdf2_hmac::<Sha512>(passphrase, salt, iterations, &mut out),
    }
    Ok(out)
}

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES-256-CBC with PKCS#7 padding.
pub fn aes_256_cbc_encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    use cbc::cipher::{BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};

    let cipher = Aes256CbcEnc::new_from_slices(key, iv).map_err(|_| Error::InvalidKeyOrIv)?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// Inverse of [`aes_256_cbc_encrypt`]. A padding failure (wrong key,
/// truncated or corrupted input) reports [`Error::DecryptionFailed`].
pub fn aes_256_cbc_decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    use cbc::cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};

    let cipher = Aes256CbcDec::new_from_slices(key, iv).map_err(|_| Error::InvalidKeyOrIv)?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| Error::DecryptionFailed)
}

/// Constant-time comparison over the common prefix of the two inputs,
/// folded with the length inequality. The accumulated value is zero iff
/// the inputs are identical; there is no data-dependent early exit, and
/// callers combine the raw accumulator with the dummy-user flag, so the
/// result is deliberately *not* normalized to 0/1.
pub fn secure_compare(a: &[u8], b: &[u8]) -> u32 {
    let mut acc = u32::from(a.len() != b.len());
    for (&x, &y) in std::iter::zip(a, b) {
        acc |= u32::from(x ^ y);
    }
    acc
}

/// Fill a buffer from the operating system's CSPRNG.
pub fn random_bytes(count: usize) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; count];
    rand::rngs::OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|_| Error::RngFailure)?;
    Ok(bytes)
}

/// Key material for wrapping files at rest, as carried by the
/// `COUCHBASE_CBSASL_SECRETS` environment variable:
/// `{"cipher": "AES_256_cbc", "key": "<b64>", "iv": "<b64>"}`.
pub struct CipherSpec {
    key: Vec<u8>,
    iv: Vec<u8>,
}

impl CipherSpec {
    pub fn parse(json: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| Error::InvalidFormat(format!("cipher spec: {e}")))?;
        let obj = value
            .as_object()
            .ok_or_else(|| Error::InvalidFormat("cipher spec must be an object".into()))?;

        let field = |name: &str| -> Result<&str> {
            obj.get(name)
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| Error::InvalidFormat(format!("cipher spec: missing \"{name}\"")))
        };

        let cipher = field("cipher")?;
        if cipher != "AES_256_cbc" {
            return Err(Error::InvalidFormat(format!("unknown cipher: {cipher}")));
        }

        let decode = |name: &str, data: &str| -> Result<Vec<u8>> {
            BASE64_STANDARD
                .decode(data)
                .map_err(|_| Error::InvalidFormat(format!("cipher spec: bad base64 in \"{name}\"")))
        };

        Ok(CipherSpec {
            key: decode("key", field("key")?)?,
            iv: decode("iv", field("iv")?)?,
        })
    }

    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        aes_256_cbc_encrypt(&self.key, &self.iv, data)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        aes_256_cbc_decrypt(&self.key, &self.iv, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_lengths() {
        for algorithm in [
            Algorithm::Md5,
            Algorithm::Sha1,
            Algorithm::Sha256,
            Algorithm::Sha512,
        ] {
            assert_eq!(digest(algorithm, b"data").len(), algorithm.digest_size());
            assert_eq!(
                hmac(algorithm, b"key", b"data").len(),
                algorithm.digest_size()
            );
            // HMAC must accept keys longer than the block size too.
            assert_eq!(
                hmac(algorithm, &[0xa5; 1024], b"data").len(),
                algorithm.digest_size()
            );
        }
    }

    #[test]
    fn hmac_sha1_rfc2202() {
        // RFC 2202, test case 2.
        let mac = hmac(Algorithm::Sha1, b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            mac,
            hex("effcdf6ae5eb2fa2d27416d5f184df9c259a7c79"),
        );
    }

    #[test]
    fn pbkdf2_sha1_rfc6070() {
        let derived = pbkdf2_hmac(Algorithm::Sha1, b"password", b"salt", 4096).unwrap();
        assert_eq!(derived, hex("4b007901b765489abead49d926f721d065a429c1"));
    }

    #[test]
    fn pbkdf2_sha256_rfc7677() {
        // The salted password from the SCRAM-SHA-256 example exchange.
        let salt = BASE64_STANDARD.decode("W22ZaJ0SNY7soEsUEjb6gQ==").unwrap();
        let derived = pbkdf2_hmac(Algorithm::Sha256, b"pencil", &salt, 4096).unwrap();
        assert_eq!(
            derived,
            hex("c4a49510323ab4f952cac1fa99441939e78ea74d6be81ddf7096e87513dc615d"),
        );
    }

    #[test]
    fn pbkdf2_sha512_published_vector() {
        let derived = pbkdf2_hmac(Algorithm::Sha512, b"password", b"salt", 1).unwrap();
        assert_eq!(
            derived,
            hex(
                "867f70cf1ade02cff3752599a3a53dc4af34c7a669815ae5d513554e1c8cf252\
                 c02d470a285a0501bad999bfe943c08f050235d7d68b1da55e63f73b60a57fce"
            ),
        );
    }

    #[test]
    fn pbkdf2_rejects_md5() {
        assert!(matches!(
            pbkdf2_hmac(Algorithm::Md5, b"p", b"s", 1),
            Err(Error::UnsupportedAlgorithm(Algorithm::Md5))
        ));
    }

    #[test]
    fn pbkdf2_rejects_zero_iterations() {
        assert!(matches!(
            pbkdf2_hmac(Algorithm::Sha1, b"p", b"s", 0),
            Err(Error::BadParameter(_))
        ));
    }

    #[test]
    fn aes_round_trip() {
        let key = [0x42u8; 32];
        let iv = [0x24u8; 16];
        for message in [&b""[..], b"x", b"exactly sixteen!", b"something a fair bit longer"] {
            let wrapped = aes_256_cbc_encrypt(&key, &iv, message).unwrap();
            assert_eq!(wrapped.len() % 16, 0);
            assert_eq!(aes_256_cbc_decrypt(&key, &iv, &wrapped).unwrap(), message);
        }
    }

    #[test]
    fn aes_rejects_bad_key_or_iv() {
        assert!(matches!(
            aes_256_cbc_encrypt(&[0u8; 16], &[0u8; 16], b"m"),
            Err(Error::InvalidKeyOrIv)
        ));
        assert!(matches!(
            aes_256_cbc_decrypt(&[0u8; 32], &[0u8; 8], b"m"),
            Err(Error::InvalidKeyOrIv)
        ));
    }

    #[test]
    fn aes_rejects_corrupted_padding() {
        let key = [1u8; 32];
        let iv = [2u8; 16];
        let mut wrapped = aes_256_cbc_encrypt(&key, &iv, b"payload").unwrap();
        let last = wrapped.len() - 1;
        wrapped[last] ^= 0xff;
        assert!(matches!(
            aes_256_cbc_decrypt(&key, &iv, &wrapped),
            Err(Error::DecryptionFailed)
        ));
    }

    #[test]
    fn secure_compare_semantics() {
        assert_eq!(secure_compare(b"abc", b"abc"), 0);
        assert_ne!(secure_compare(b"abc", b"abd"), 0);
        assert_ne!(secure_compare(b"abc", b"ab"), 0);
        // Differences in every byte position are all observed.
        assert_ne!(secure_compare(b"xbc", b"abc"), 0);
        assert_ne!(secure_compare(b"abx", b"abc"), 0);
        assert_eq!(secure_compare(b"", b""), 0);
    }

    #[test]
    fn cipher_spec_round_trip() {
        let spec = format!(
            r#"{{"cipher":"AES_256_cbc","key":"{}","iv":"{}"}}"#,
            BASE64_STANDARD.encode([7u8; 32]),
            BASE64_STANDARD.encode([9u8; 16]),
        );
        let spec = CipherSpec::parse(&spec).unwrap();
        let wrapped = spec.encrypt(b"secret database").unwrap();
        assert_eq!(spec.decrypt(&wrapped).unwrap(), b"secret database");
    }

    #[test]
    fn cipher_spec_rejects_unknown_cipher() {
        let spec = r#"{"cipher":"ROT13","key":"","iv":""}"#;
        assert!(matches!(
            CipherSpec::parse(spec),
            Err(Error::InvalidFormat(_))
        ));
    }

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }
}
