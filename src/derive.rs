//! SMTP password derivation.
//!
//! The email provider's SMTP endpoint recomputes this value on its side, so the
//! output has to be bit-exact. `SIGNATURE_VERSION` and `MESSAGE` are part of
//! the provider's scheme and only change together with it.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::controller::Error;

pub const SIGNATURE_VERSION: u8 = 0x04;
pub const MESSAGE: &str = "SendRawEmail";

/// Computes `base64(HMAC-SHA256(SIGNATURE_VERSION || secret_key, MESSAGE))`.
pub fn derive_smtp_password(secret_key: &str) -> Result<String, Error> {
    let mut key = Vec::with_capacity(secret_key.len() + 1);
    key.push(SIGNATURE_VERSION);
    key.extend_from_slice(secret_key.as_bytes());

    let mut mac = <Hmac<Sha256>>::new_from_slice(&key)
        .map_err(|e| Error::Credential(format!("invalid signing key: {}", e)))?;
    mac.update(MESSAGE.as_bytes());
    let digest = mac.finalize().into_bytes();

    Ok(STANDARD.encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_known_answer() {
        assert_eq!(
            derive_smtp_password("secretKeyValue").unwrap(),
            "iM4wCBq/bG6srvGmRniCJF0ayTK9Mm7LMRF9Y3vUtvQ="
        );
        assert_eq!(
            derive_smtp_password("wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY").unwrap(),
            "yaOW5qyf0Ite2wIhBNP4pBhREakfFmZAQd9PO8gEMsg="
        );
    }

    #[test]
    fn is_deterministic() {
        let first = derive_smtp_password("secretKeyValue").unwrap();
        for _ in 0..10 {
            assert_eq!(derive_smtp_password("secretKeyValue").unwrap(), first);
        }
    }

    #[test]
    fn empty_secret_still_uses_version_byte() {
        assert_eq!(
            derive_smtp_password("").unwrap(),
            "UWUW+E3tHSscH7ZroT/7SdtS2tI544uTFzN6GY8Ni8c="
        );
    }

    #[test]
    fn different_secrets_differ() {
        assert_ne!(
            derive_smtp_password("secretKeyValue").unwrap(),
            derive_smtp_password("secretKeyValuf").unwrap()
        );
    }
}
