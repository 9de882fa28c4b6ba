use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

const KEY_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 12;
const ENVELOPE_MARKER: &str = "$aes$";

/// Errors produced by the common-crypto helpers.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("malformed envelope secret")]
    MalformedEnvelope,
    #[error("envelope decryption key has been removed")]
    MissingKey,
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
    #[error("ciphertext missing nonce")]
    MissingNonce,
    #[error("encryption failure")]
    EncryptFailure,
    #[error("decryption failure")]
    DecryptFailure,
    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
    #[error("plaintext is not valid UTF-8")]
    InvalidPlaintext,
}

/// Encrypt `plaintext` under a freshly generated data key and serialize the
/// result as an envelope secret: `$aes$<key>$<payload>`, both segments
/// base64, the payload carrying nonce plus ciphertext. Splitting a full
/// envelope on `$` yields exactly four fields. The key travels inside the
/// envelope so the secret is self-contained until the key segment is
/// stripped for external exposure.
pub fn encrypt(plaintext: &str) -> Result<String, CryptoError> {
    let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
    OsRng.fill_bytes(key.as_mut());
    let mut nonce_bytes = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce_bytes);

    let cipher = Aes256Gcm::new_from_slice(key.as_ref()).map_err(|_| {
        CryptoError::InvalidKeyLength {
            expected: KEY_LENGTH,
            actual: key.len(),
        }
    })?;
    let mut ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
        .map_err(|_| CryptoError::EncryptFailure)?;
    let mut payload = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
    payload.extend_from_slice(&nonce_bytes);
    payload.append(&mut ciphertext);

    Ok(format!(
        "{}{}${}",
        ENVELOPE_MARKER,
        BASE64_STANDARD.encode(key.as_ref()),
        BASE64_STANDARD.encode(payload),
    ))
}

/// Decrypt an envelope secret produced by [`encrypt`]. Fails with
/// [`CryptoError::MissingKey`] if the key segment was stripped.
pub fn decrypt(envelope: &str) -> Result<String, CryptoError> {
    let (key, payload) = split_envelope(envelope)?;
    if key.is_empty() {
        return Err(CryptoError::MissingKey);
    }
    let key = Zeroizing::new(BASE64_STANDARD.decode(key)?);
    if key.len() != KEY_LENGTH {
        return Err(CryptoError::InvalidKeyLength {
            expected: KEY_LENGTH,
            actual: key.len(),
        });
    }
    let payload = BASE64_STANDARD.decode(payload)?;
    if payload.len() <= NONCE_LENGTH {
        return Err(CryptoError::MissingNonce);
    }
    let (nonce_bytes, ciphertext) = payload.split_at(NONCE_LENGTH);

    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::InvalidKeyLength {
        expected: KEY_LENGTH,
        actual: key.len(),
    })?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::DecryptFailure)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::InvalidPlaintext)
}

/// Blank the key segment of an envelope secret, leaving the ciphertext body
/// in place. Idempotent; values that are not envelope secrets are returned
/// unchanged.
pub fn remove_decryption_key(envelope: &str) -> String {
    match split_envelope(envelope) {
        Ok((_, payload)) => format!("{ENVELOPE_MARKER}${payload}"),
        Err(_) => envelope.to_string(),
    }
}

/// Whether `value` is serialized in envelope form (marker plus key and
/// payload segments, four `$`-separated fields in total).
pub fn is_envelope(value: &str) -> bool {
    split_envelope(value).is_ok()
}

/// Whether an envelope secret still carries its decryption key.
pub fn has_decryption_key(value: &str) -> bool {
    matches!(split_envelope(value), Ok((key, _)) if !key.is_empty())
}

fn split_envelope(value: &str) -> Result<(&str, &str), CryptoError> {
    let rest = value
        .strip_prefix(ENVELOPE_MARKER)
        .ok_or(CryptoError::MalformedEnvelope)?;
    let mut segments = rest.split('$');
    let key = segments.next().ok_or(CryptoError::MalformedEnvelope)?;
    let payload = segments.next().ok_or(CryptoError::MalformedEnvelope)?;
    if segments.next().is_some() || payload.is_empty() {
        return Err(CryptoError::MalformedEnvelope);
    }
    Ok((key, payload))
}
