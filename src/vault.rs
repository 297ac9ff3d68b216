//! Credential vault: authenticated encryption for OAuth tokens and device
//! push secrets.
//!
//! The 256-bit key is derived once at process start from a configured secret
//! (PBKDF2-HMAC-SHA256) and held as process-wide state for the process
//! lifetime. Ciphertexts are self-describing three-part strings:
//!
//! ```text
//! base64(nonce):base64(tag):base64(ciphertext)
//! ```
//!
//! `decrypt` passes non-three-part input through unchanged so legacy
//! plaintext credentials keep working; real authentication failures are hard
//! errors and never surface plaintext.

use crate::error::IngestError;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use sha2::Sha256;
use std::sync::OnceLock;
use subtle::ConstantTimeEq;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;
const PBKDF2_ITERATIONS: u32 = 100_000;
const KEY_SALT: &[u8] = b"vitalgate-credential-vault-v1";

static VAULT_KEY: OnceLock<[u8; KEY_LEN]> = OnceLock::new();

/// Derive and install the process-wide key. Idempotent: repeated calls with
/// the same secret are no-ops, which lets tests inject a throwaway key
/// deterministically.
pub fn init(secret: &str) {
    VAULT_KEY.get_or_init(|| derive_key(secret));
}

fn derive_key(secret: &str) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), KEY_SALT, PBKDF2_ITERATIONS, &mut key);
    key
}

fn cipher() -> Result<Aes256Gcm, IngestError> {
    let key = VAULT_KEY.get().ok_or(IngestError::VaultUninitialized)?;
    Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)))
}

/// Encrypt a plaintext credential with a fresh random nonce.
pub fn encrypt(plaintext: &str) -> Result<String, IngestError> {
    let cipher = cipher()?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    // aes-gcm appends the 16-byte tag to the ciphertext.
    let sealed = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| IngestError::Encrypt)?;
    let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

    Ok(format!(
        "{}:{}:{}",
        BASE64.encode(nonce_bytes),
        BASE64.encode(tag),
        BASE64.encode(ciphertext)
    ))
}

/// Decrypt a vault-format credential.
///
/// Input without exactly three colon-delimited parts is returned unchanged
/// (legacy plaintext leniency). Any failure on a well-formed input is a hard
/// error; callers must not log plaintext on failure.
pub fn decrypt(value: &str) -> Result<String, IngestError> {
    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() != 3 {
        tracing::debug!("credential not in vault format, passing through");
        return Ok(value.to_string());
    }

    let cipher = cipher()?;

    let nonce_bytes = BASE64.decode(parts[0]).map_err(|_| IngestError::Decrypt)?;
    let tag = BASE64.decode(parts[1]).map_err(|_| IngestError::Decrypt)?;
    let ciphertext = BASE64.decode(parts[2]).map_err(|_| IngestError::Decrypt)?;
    if nonce_bytes.len() != NONCE_LEN || tag.len() != TAG_LEN {
        return Err(IngestError::Decrypt);
    }

    let mut sealed = ciphertext;
    sealed.extend_from_slice(&tag);

    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), sealed.as_ref())
        .map_err(|_| IngestError::Decrypt)?;

    String::from_utf8(plaintext).map_err(|_| IngestError::Decrypt)
}

/// Constant-time string comparison for signatures and tokens.
pub fn secure_compare(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn init_test_key() {
        init("vitalgate-test-secret");
    }

    #[test]
    fn test_round_trip() {
        init_test_key();
        for plaintext in ["", "a", "token-1234", "長いトークン🔒"] {
            let sealed = encrypt(plaintext).unwrap();
            assert_eq!(decrypt(&sealed).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        init_test_key();
        let a = encrypt("same plaintext").unwrap();
        let b = encrypt("same plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_output_has_three_parts() {
        init_test_key();
        let sealed = encrypt("secret").unwrap();
        assert_eq!(sealed.split(':').count(), 3);
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        init_test_key();
        let sealed = encrypt("secret").unwrap();
        let mut parts: Vec<String> = sealed.split(':').map(String::from).collect();
        parts[2] = BASE64.encode(b"tampered-ciphertext");
        let tampered = parts.join(":");
        assert!(matches!(decrypt(&tampered), Err(IngestError::Decrypt)));
    }

    #[test]
    fn test_legacy_plaintext_passes_through() {
        init_test_key();
        assert_eq!(decrypt("not-encrypted").unwrap(), "not-encrypted");
        assert_eq!(decrypt("one:two").unwrap(), "one:two");
    }

    #[test]
    fn test_secure_compare() {
        assert!(secure_compare("abc", "abc"));
        assert!(!secure_compare("abc", "abd"));
        assert!(!secure_compare("abc", "abcd"));
        assert!(secure_compare("", ""));
    }
}
