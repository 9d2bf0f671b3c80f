//! Encryption-at-rest for export archives plus the pseudonym tokens used by
//! anonymizing erasure.
//!
//! Archives are sealed with AES-256-GCM under a key derived from the install
//! secret via PBKDF2-HMAC-SHA256. Salt and nonce travel base64-encoded in the
//! archive's metadata sidecar, never inside the ciphertext file itself.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use sha2::{Digest, Sha256};

use crate::{errors::Error, Result};

pub struct Sealed {
    pub ciphertext: Vec<u8>,
    /// Base64-encoded PBKDF2 salt.
    pub salt: String,
    /// Base64-encoded AES-GCM nonce.
    pub nonce: String,
}

fn derive_key(secret: &str, salt: &[u8]) -> Key<Aes256Gcm> {
    use pbkdf2::pbkdf2_hmac_array;

    // Lowered work factor under test to keep the suite fast.
    #[cfg(test)]
    const ITERATIONS: u32 = 1_000;
    #[cfg(not(test))]
    const ITERATIONS: u32 = 100_000;

    let key_bytes: [u8; 32] = pbkdf2_hmac_array::<Sha256, 32>(secret.as_bytes(), salt, ITERATIONS);
    *Key::<Aes256Gcm>::from_slice(&key_bytes)
}

pub fn seal(secret: &str, plaintext: &[u8]) -> Result<Sealed> {
    use aes_gcm::aead::rand_core::RngCore;

    let mut salt = [0u8; 32];
    OsRng.fill_bytes(&mut salt);

    let key = derive_key(secret, &salt);
    let cipher = Aes256Gcm::new(&key);
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| Error::Crypto(format!("encrypt failed: {e}")))?;

    Ok(Sealed {
        ciphertext,
        salt: general_purpose::STANDARD.encode(salt),
        nonce: general_purpose::STANDARD.encode(nonce),
    })
}

pub fn open(secret: &str, ciphertext: &[u8], salt_b64: &str, nonce_b64: &str) -> Result<Vec<u8>> {
    let salt = general_purpose::STANDARD
        .decode(salt_b64)
        .map_err(|e| Error::Crypto(format!("bad salt: {e}")))?;
    let nonce_bytes = general_purpose::STANDARD
        .decode(nonce_b64)
        .map_err(|e| Error::Crypto(format!("bad nonce: {e}")))?;
    if nonce_bytes.len() != 12 {
        return Err(Error::Crypto("invalid nonce size".to_string()));
    }

    let key = derive_key(secret, &salt);
    let cipher = Aes256Gcm::new(&key);
    let nonce = Nonce::from_slice(&nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| Error::Crypto(format!("decrypt failed: {e}")))
}

/// Irreversible replacement token for anonymizing erasure.
///
/// Derived from the install secret and the subject id, so the same subject maps
/// to the same token across stores (referential integrity survives), while the
/// id cannot be recovered from the token without the secret.
pub fn pseudonym_token(secret: &str, subject_id: &str) -> String {
    let mut h = Sha256::new();
    h.update(secret.as_bytes());
    h.update(b":");
    h.update(subject_id.as_bytes());
    let digest = h.finalize();
    hex_prefix(&digest, 16)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    let digest = h.finalize();
    hex_prefix(&digest, 64)
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(len);
    for b in bytes {
        let _ = write!(&mut out, "{:02x}", b);
        if out.len() >= len {
            out.truncate(len);
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let sealed = seal("install-secret", b"subject data").unwrap();
        let plain = open(
            "install-secret",
            &sealed.ciphertext,
            &sealed.salt,
            &sealed.nonce,
        )
        .unwrap();
        assert_eq!(plain, b"subject data");
    }

    #[test]
    fn wrong_secret_fails_to_open() {
        let sealed = seal("correct", b"payload").unwrap();
        let res = open("wrong", &sealed.ciphertext, &sealed.salt, &sealed.nonce);
        assert!(res.is_err());
    }

    #[test]
    fn sealing_twice_differs() {
        let a = seal("s", b"same input").unwrap();
        let b = seal("s", b"same input").unwrap();
        // Fresh salt and nonce every time.
        assert_ne!(a.ciphertext, b.ciphertext);
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.nonce, b.nonce);
    }

    #[test]
    fn pseudonym_is_stable_and_secret_dependent() {
        let t1 = pseudonym_token("secret", "alice@example.com");
        let t2 = pseudonym_token("secret", "alice@example.com");
        let t3 = pseudonym_token("other", "alice@example.com");
        let t4 = pseudonym_token("secret", "bob@example.com");

        assert_eq!(t1, t2);
        assert_ne!(t1, t3);
        assert_ne!(t1, t4);
        assert_eq!(t1.len(), 16);
        assert!(!t1.contains("alice"));
    }

    #[test]
    fn sha256_hex_is_full_digest() {
        let h = sha256_hex(b"bytes");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
