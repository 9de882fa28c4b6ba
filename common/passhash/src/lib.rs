//! Password hash verification across the hash families found in real user
//! databases, dispatched on the serialized prefix. New hashes are always
//! written as Argon2id; the remaining families exist so that records
//! imported from other systems keep working.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;
use thiserror::Error;

mod apr1;

pub const ARGON2ID_PREFIX: &str = "$argon2id$";
pub const BCRYPT_PREFIX: &str = "$2a$";
pub const PBKDF2_SHA1_PREFIX: &str = "$pbkdf2-sha1$";
pub const PBKDF2_SHA256_PREFIX: &str = "$pbkdf2-sha256$";
pub const PBKDF2_SHA512_PREFIX: &str = "$pbkdf2-sha512$";
pub const MD5_CRYPT_PREFIX: &str = "$1$";
pub const APR1_CRYPT_PREFIX: &str = "$apr1$";
pub const SHA512_CRYPT_PREFIX: &str = "$6$";

const HASH_PREFIXES: &[&str] = &[
    ARGON2ID_PREFIX,
    BCRYPT_PREFIX,
    PBKDF2_SHA1_PREFIX,
    PBKDF2_SHA256_PREFIX,
    PBKDF2_SHA512_PREFIX,
    MD5_CRYPT_PREFIX,
    APR1_CRYPT_PREFIX,
    SHA512_CRYPT_PREFIX,
];

#[derive(Debug, Error)]
pub enum PasswordHashError {
    #[error("unsupported password hash format")]
    UnsupportedFormat,
    #[error("malformed {scheme} hash")]
    Malformed { scheme: &'static str },
    #[error("password hashing error: {0}")]
    Hash(argon2::password_hash::Error),
}

/// Whether `value` starts with one of the recognized hash family prefixes.
pub fn is_hashed(value: &str) -> bool {
    HASH_PREFIXES.iter().any(|prefix| value.starts_with(prefix))
}

/// Hash a plaintext password with Argon2id, default parameters, producing a
/// PHC string.
pub fn hash_password(plain: &str) -> Result<String, PasswordHashError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(plain.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(PasswordHashError::Hash)
}

/// Compare `candidate` against a stored hash. `Ok(false)` is a clean
/// mismatch; errors mean the stored value could not be interpreted at all.
pub fn verify_password(stored: &str, candidate: &str) -> Result<bool, PasswordHashError> {
    if stored.starts_with(ARGON2ID_PREFIX) {
        verify_argon2(stored, candidate)
    } else if stored.starts_with(BCRYPT_PREFIX) {
        bcrypt::verify(candidate, stored)
            .map_err(|_| PasswordHashError::Malformed { scheme: "bcrypt" })
    } else if stored.starts_with(PBKDF2_SHA1_PREFIX)
        || stored.starts_with(PBKDF2_SHA256_PREFIX)
        || stored.starts_with(PBKDF2_SHA512_PREFIX)
    {
        verify_pbkdf2(stored, candidate)
    } else if stored.starts_with(APR1_CRYPT_PREFIX) {
        apr1::verify(candidate, stored)
    } else if stored.starts_with(MD5_CRYPT_PREFIX) {
        Ok(pwhash::md5_crypt::verify(candidate, stored))
    } else if stored.starts_with(SHA512_CRYPT_PREFIX) {
        Ok(pwhash::sha512_crypt::verify(candidate, stored))
    } else {
        Err(PasswordHashError::UnsupportedFormat)
    }
}

fn verify_argon2(stored: &str, candidate: &str) -> Result<bool, PasswordHashError> {
    let parsed =
        PasswordHash::new(stored).map_err(|_| PasswordHashError::Malformed { scheme: "argon2id" })?;
    match Argon2::default().verify_password(candidate.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(err) => Err(PasswordHashError::Hash(err)),
    }
}

// Stored form: $pbkdf2-<digest>$<iterations>$<salt b64>$<derived key b64>,
// exactly five `$`-separated fields. The derived key length is the digest
// size of the named hash.
fn verify_pbkdf2(stored: &str, candidate: &str) -> Result<bool, PasswordHashError> {
    let malformed = PasswordHashError::Malformed { scheme: "pbkdf2" };
    let fields: Vec<&str> = stored.split('$').collect();
    if fields.len() != 5 {
        return Err(malformed);
    }
    let iterations: u32 = fields[2]
        .parse()
        .map_err(|_| PasswordHashError::Malformed { scheme: "pbkdf2" })?;
    if iterations == 0 {
        return Err(malformed);
    }
    let salt = BASE64_STANDARD
        .decode(fields[3])
        .map_err(|_| PasswordHashError::Malformed { scheme: "pbkdf2" })?;
    let expected = fields[4];

    let mut derived = vec![0u8; pbkdf2_digest_size(stored)?];
    if stored.starts_with(PBKDF2_SHA1_PREFIX) {
        pbkdf2_hmac::<Sha1>(candidate.as_bytes(), &salt, iterations, &mut derived);
    } else if stored.starts_with(PBKDF2_SHA256_PREFIX) {
        pbkdf2_hmac::<Sha256>(candidate.as_bytes(), &salt, iterations, &mut derived);
    } else {
        pbkdf2_hmac::<Sha512>(candidate.as_bytes(), &salt, iterations, &mut derived);
    }
    let encoded = BASE64_STANDARD.encode(&derived);
    Ok(encoded.as_bytes().ct_eq(expected.as_bytes()).into())
}

fn pbkdf2_digest_size(stored: &str) -> Result<usize, PasswordHashError> {
    if stored.starts_with(PBKDF2_SHA1_PREFIX) {
        Ok(20)
    } else if stored.starts_with(PBKDF2_SHA256_PREFIX) {
        Ok(32)
    } else if stored.starts_with(PBKDF2_SHA512_PREFIX) {
        Ok(64)
    } else {
        Err(PasswordHashError::UnsupportedFormat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argon2_round_trip() {
        let hash = hash_password("s3cr3t").expect("hash");
        assert!(hash.starts_with(ARGON2ID_PREFIX));
        assert!(is_hashed(&hash));
        assert!(verify_password(&hash, "s3cr3t").expect("verify"));
        assert!(!verify_password(&hash, "wrong").expect("verify"));
    }

    #[test]
    fn bcrypt_round_trip() {
        // stored bcrypt hashes carry the $2a$ marker
        let hash = bcrypt::hash_with_result("letmein", 4)
            .expect("hash")
            .format_for_version(bcrypt::Version::TwoA);
        assert!(hash.starts_with(BCRYPT_PREFIX));
        assert!(verify_password(&hash, "letmein").expect("verify"));
        assert!(!verify_password(&hash, "letmeout").expect("verify"));
    }

    #[test]
    fn pbkdf2_sha256_round_trip() {
        // A derived key that is not the digest size must never verify; the
        // stored key length is fixed per scheme.
        let mut derived = [0u8; 64];
        pbkdf2_hmac::<Sha256>(b"passwd", b"salt", 1, &mut derived);
        let stored = format!(
            "$pbkdf2-sha256$1${}${}",
            BASE64_STANDARD.encode(b"salt"),
            BASE64_STANDARD.encode(derived),
        );
        assert!(!verify_password(&stored, "passwd").expect("verify"));

        let mut derived = [0u8; 32];
        pbkdf2_hmac::<Sha256>(b"hello", b"salt", 10_000, &mut derived);
        let stored = format!(
            "$pbkdf2-sha256$10000${}${}",
            BASE64_STANDARD.encode(b"salt"),
            BASE64_STANDARD.encode(derived),
        );
        assert!(verify_password(&stored, "hello").expect("verify"));
        assert!(!verify_password(&stored, "hell0").expect("verify"));
    }

    #[test]
    fn pbkdf2_sha512_round_trip() {
        let mut derived = [0u8; 64];
        pbkdf2_hmac::<Sha512>(b"hunter2", b"pepper", 1000, &mut derived);
        let stored = format!(
            "$pbkdf2-sha512$1000${}${}",
            BASE64_STANDARD.encode(b"pepper"),
            BASE64_STANDARD.encode(derived),
        );
        assert!(verify_password(&stored, "hunter2").expect("verify"));
        assert!(!verify_password(&stored, "hunter3").expect("verify"));
    }

    #[test]
    fn pbkdf2_field_count_is_enforced() {
        assert!(matches!(
            verify_password("$pbkdf2-sha256$10000$c2FsdA", "hello"),
            Err(PasswordHashError::Malformed { scheme: "pbkdf2" })
        ));
        assert!(matches!(
            verify_password("$pbkdf2-sha256$ten$c2FsdA$aGFzaA==", "hello"),
            Err(PasswordHashError::Malformed { scheme: "pbkdf2" })
        ));
    }

    #[test]
    fn md5_crypt_known_answer() {
        // openssl passwd -1 -salt xxxxxxxx password
        let stored = "$1$xxxxxxxx$UYCIxa628.9qXjpQCjM4a.";
        assert!(verify_password(stored, "password").expect("verify"));
        assert!(!verify_password(stored, "Password").expect("verify"));
    }

    #[test]
    fn sha512_crypt_known_answer() {
        // Reference vector from the sha-crypt specification.
        let stored = "$6$saltstring$svn8UoSVapNtMuq1ukKS4tPQd8iKwSMHWjl/O817G3uBnIFNjnQJu\
esI68u4OTLiBFdcbYEdFCoEOfaS35inz1";
        assert!(verify_password(stored, "Hello world!").expect("verify"));
        assert!(!verify_password(stored, "Hello world").expect("verify"));
    }

    #[test]
    fn unsupported_formats_are_rejected() {
        assert!(matches!(
            verify_password("plaintext", "plaintext"),
            Err(PasswordHashError::UnsupportedFormat)
        ));
        assert!(matches!(
            verify_password("$sha256$whatever", "pw"),
            Err(PasswordHashError::UnsupportedFormat)
        ));
        assert!(!is_hashed("plaintext"));
        assert!(is_hashed("$2a$10$abcdefghijklmnopqrstuv"));
    }
}
