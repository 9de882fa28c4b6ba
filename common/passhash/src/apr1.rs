//! Apache `$apr1$` MD5-crypt, the htpasswd variant of the FreeBSD MD5
//! password scheme. pwhash covers `$1$` but not the Apache magic, so the
//! digest loop is implemented here on top of the md-5 crate.

use md5::{Digest, Md5};
use subtle::ConstantTimeEq;

use crate::PasswordHashError;

const MAGIC: &[u8] = b"$apr1$";
const CRYPT64: &[u8; 64] = b"./0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

pub(crate) fn verify(candidate: &str, stored: &str) -> Result<bool, PasswordHashError> {
    let rest = stored
        .strip_prefix("$apr1$")
        .ok_or(PasswordHashError::Malformed { scheme: "apr1" })?;
    let (salt, expected) = rest
        .split_once('$')
        .ok_or(PasswordHashError::Malformed { scheme: "apr1" })?;
    if salt.is_empty() || salt.len() > 8 || expected.len() != 22 {
        return Err(PasswordHashError::Malformed { scheme: "apr1" });
    }
    let computed = md5_crypt(candidate.as_bytes(), salt.as_bytes());
    Ok(computed.as_bytes().ct_eq(expected.as_bytes()).into())
}

fn md5_crypt(password: &[u8], salt: &[u8]) -> String {
    let mut alternate = Md5::new();
    alternate.update(password);
    alternate.update(salt);
    alternate.update(password);
    let alternate = alternate.finalize();

    let mut context = Md5::new();
    context.update(password);
    context.update(MAGIC);
    context.update(salt);
    let mut remaining = password.len();
    while remaining > 0 {
        let take = remaining.min(16);
        context.update(&alternate[..take]);
        remaining -= take;
    }
    let mut length_bits = password.len();
    while length_bits > 0 {
        if length_bits & 1 != 0 {
            context.update([0u8]);
        } else {
            context.update(&password[..1]);
        }
        length_bits >>= 1;
    }
    let mut digest = context.finalize();

    // 1000 strengthening rounds, mixing password and salt per the reference
    // implementation's schedule.
    for round in 0..1000 {
        let mut ctx = Md5::new();
        if round & 1 != 0 {
            ctx.update(password);
        } else {
            ctx.update(&digest);
        }
        if round % 3 != 0 {
            ctx.update(salt);
        }
        if round % 7 != 0 {
            ctx.update(password);
        }
        if round & 1 != 0 {
            ctx.update(&digest);
        } else {
            ctx.update(password);
        }
        digest = ctx.finalize();
    }

    let mut encoded = String::with_capacity(22);
    for &(a, b, c) in &[(0usize, 6usize, 12usize), (1, 7, 13), (2, 8, 14), (3, 9, 15), (4, 10, 5)] {
        let group =
            ((digest[a] as u32) << 16) | ((digest[b] as u32) << 8) | digest[c] as u32;
        push_crypt64(&mut encoded, group, 4);
    }
    push_crypt64(&mut encoded, digest[11] as u32, 2);
    encoded
}

fn push_crypt64(out: &mut String, mut value: u32, count: usize) {
    for _ in 0..count {
        out.push(CRYPT64[(value & 0x3f) as usize] as char);
        value >>= 6;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // openssl passwd -apr1 -salt xxxxxxxx password
    const KNOWN_HASH: &str = "$apr1$xxxxxxxx$dxHfLAsjHkDRmG83UXe8K0";

    #[test]
    fn matching_password_verifies() {
        assert!(verify("password", KNOWN_HASH).expect("verify"));
    }

    #[test]
    fn wrong_password_is_rejected() {
        assert!(!verify("passw0rd", KNOWN_HASH).expect("verify"));
    }

    #[test]
    fn malformed_hashes_are_rejected() {
        assert!(verify("password", "$apr1$missingdigest").is_err());
        assert!(verify("password", "$1$xxxxxxxx$dxHfLAsjHkDRmG83UXe8K0").is_err());
        assert!(verify("password", "$apr1$$dxHfLAsjHkDRmG83UXe8K0").is_err());
    }
}
