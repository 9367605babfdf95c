//! AES-256-GCM encryption with a PBKDF2 key derived from the master password.
//!
//! Blob layout: `[salt (16)] [nonce (12)] [ciphertext+tag]`.
//!
//! The master password itself is never stored. A [`MasterPasswordVerifier`]
//! (salt plus HMAC over a fixed label, keyed with the derived key) lets the
//! client tell a wrong master password apart from corrupt data.

use super::error::{CredentialError, CredentialResult};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use zeroize::Zeroizing;

const SALT_SIZE: usize = 16;
const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;
const TAG_SIZE: usize = 16;
pub const PBKDF2_ROUNDS: u32 = 10_000;
const VERIFIER_LABEL: &[u8] = b"salftp master password verifier";

type HmacSha256 = Hmac<Sha256>;

/// Derive a 256-bit key from a password and salt using PBKDF2-HMAC-SHA256.
fn derive_key(password: &str, salt: &[u8]) -> Zeroizing<[u8; KEY_SIZE]> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut *key);
    key
}

fn check_master(master: &str) -> CredentialResult<()> {
    if master.is_empty() {
        return Err(CredentialError::InvalidPassword(
            "master password must not be empty".into(),
        ));
    }
    Ok(())
}

/// Encrypt `plaintext` with a key derived from `master`.
pub fn encrypt(plaintext: &[u8], master: &str) -> CredentialResult<Vec<u8>> {
    check_master(master)?;
    let mut rng = rand::thread_rng();
    let mut salt = [0u8; SALT_SIZE];
    rng.fill(&mut salt);
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rng.fill(&mut nonce_bytes);

    let key = derive_key(master, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key[..])
        .map_err(|e| CredentialError::Crypto(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| CredentialError::Crypto(e.to_string()))?;

    let mut out = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a blob produced by [`encrypt`]. A failed tag check reports
/// [`CredentialError::WrongMasterPassword`].
pub fn decrypt(data: &[u8], master: &str) -> CredentialResult<Zeroizing<Vec<u8>>> {
    check_master(master)?;
    if data.len() < SALT_SIZE + NONCE_SIZE + TAG_SIZE {
        return Err(CredentialError::Corrupt("encrypted data too short".into()));
    }
    let (salt, rest) = data.split_at(SALT_SIZE);
    let (nonce_bytes, ciphertext) = rest.split_at(NONCE_SIZE);
    let key = derive_key(master, salt);
    let cipher = Aes256Gcm::new_from_slice(&key[..])
        .map_err(|e| CredentialError::Crypto(e.to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| CredentialError::WrongMasterPassword)
}

/// Proof of the master password, safe to store.
#[derive(Clone, PartialEq, Eq)]
pub struct MasterPasswordVerifier {
    salt: [u8; SALT_SIZE],
    mac: Vec<u8>,
}

impl std::fmt::Debug for MasterPasswordVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterPasswordVerifier").finish_non_exhaustive()
    }
}

impl MasterPasswordVerifier {
    pub fn create(master: &str) -> CredentialResult<Self> {
        check_master(master)?;
        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill(&mut salt);
        let mac = Self::compute(master, &salt)?;
        Ok(Self { salt, mac })
    }

    fn compute(master: &str, salt: &[u8]) -> CredentialResult<Vec<u8>> {
        let key = derive_key(master, salt);
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&key[..])
            .map_err(|e| CredentialError::Crypto(e.to_string()))?;
        mac.update(VERIFIER_LABEL);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    pub fn verify(&self, master: &str) -> bool {
        if master.is_empty() {
            return false;
        }
        let key = derive_key(master, &self.salt);
        let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(&key[..]) else {
            return false;
        };
        mac.update(VERIFIER_LABEL);
        mac.verify_slice(&self.mac).is_ok()
    }

    pub fn to_base64(&self) -> String {
        let mut raw = Vec::with_capacity(SALT_SIZE + self.mac.len());
        raw.extend_from_slice(&self.salt);
        raw.extend_from_slice(&self.mac);
        B64.encode(raw)
    }

    pub fn from_base64(text: &str) -> CredentialResult<Self> {
        let raw = B64.decode(text)?;
        if raw.len() != SALT_SIZE + 32 {
            return Err(CredentialError::Corrupt("master password verifier has a bad size".into()));
        }
        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&raw[..SALT_SIZE]);
        Ok(Self {
            salt,
            mac: raw[SALT_SIZE..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt() {
        let blob = encrypt(b"hunter2", "master").unwrap();
        assert_eq!(blob.len(), SALT_SIZE + NONCE_SIZE + 7 + TAG_SIZE);
        assert_eq!(decrypt(&blob, "master").unwrap().as_slice(), b"hunter2");
    }

    #[test]
    fn wrong_master_password() {
        let blob = encrypt(b"hunter2", "master").unwrap();
        assert_eq!(decrypt(&blob, "other").unwrap_err(), CredentialError::WrongMasterPassword);
    }

    #[test]
    fn truncated_blob() {
        assert!(matches!(decrypt(&[0u8; 10], "m"), Err(CredentialError::Corrupt(_))));
    }

    #[test]
    fn empty_master_is_rejected() {
        assert!(encrypt(b"x", "").is_err());
        assert!(MasterPasswordVerifier::create("").is_err());
    }

    #[test]
    fn verifier() {
        let v = MasterPasswordVerifier::create("master").unwrap();
        assert!(v.verify("master"));
        assert!(!v.verify("Master"));
        let restored = MasterPasswordVerifier::from_base64(&v.to_base64()).unwrap();
        assert_eq!(restored, v);
        assert!(restored.verify("master"));
        assert!(MasterPasswordVerifier::from_base64("AAAA").is_err());
    }
}
