//! Password manager: decides how a saved password is protected.
//!
//! Stored blobs are base64 of `[form tag] [payload]`, where the payload is a
//! scrambled password or an AES blob.

use super::aes::{self, MasterPasswordVerifier};
use super::error::{CredentialError, CredentialResult};
use super::scramble::{scramble_password, unscramble_password};
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use zeroize::Zeroizing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordForm {
    Scrambled,
    Aes,
}

impl PasswordForm {
    fn tag(self) -> u8 {
        match self {
            PasswordForm::Scrambled => 1,
            PasswordForm::Aes => 2,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(PasswordForm::Scrambled),
            2 => Some(PasswordForm::Aes),
            _ => None,
        }
    }
}

/// A saved password as it sits in the config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPassword {
    pub form: PasswordForm,
    pub bytes: Vec<u8>,
}

impl EncryptedPassword {
    pub fn to_base64(&self) -> String {
        let mut raw = Vec::with_capacity(1 + self.bytes.len());
        raw.push(self.form.tag());
        raw.extend_from_slice(&self.bytes);
        B64.encode(raw)
    }

    pub fn from_base64(text: &str) -> CredentialResult<Self> {
        let raw = B64.decode(text.trim())?;
        let (&tag, bytes) = raw
            .split_first()
            .ok_or_else(|| CredentialError::Corrupt("empty password blob".into()))?;
        let form = PasswordForm::from_tag(tag)
            .ok_or_else(|| CredentialError::Corrupt(format!("unknown password form {}", tag)))?;
        Ok(Self {
            form,
            bytes: bytes.to_vec(),
        })
    }

    pub fn is_encrypted_with_master(&self) -> bool {
        self.form == PasswordForm::Aes
    }
}

/// Protects saved passwords, optionally with a master password.
///
/// With a master password set, AES blobs can only be read or written after
/// [`PasswordManager::unlock`]. Scrambled blobs are always readable.
#[derive(Default)]
pub struct PasswordManager {
    verifier: Option<MasterPasswordVerifier>,
    master: Option<Zeroizing<String>>,
}

impl std::fmt::Debug for PasswordManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordManager")
            .field("using_master_password", &self.verifier.is_some())
            .field("unlocked", &self.master.is_some())
            .finish()
    }
}

impl PasswordManager {
    pub fn new(verifier: Option<MasterPasswordVerifier>) -> Self {
        Self {
            verifier,
            master: None,
        }
    }

    pub fn is_using_master_password(&self) -> bool {
        self.verifier.is_some()
    }

    pub fn is_unlocked(&self) -> bool {
        self.master.is_some()
    }

    pub fn verifier(&self) -> Option<&MasterPasswordVerifier> {
        self.verifier.as_ref()
    }

    /// Enter the master password for this session.
    pub fn unlock(&mut self, master: &str) -> CredentialResult<()> {
        let verifier = self.verifier.as_ref().ok_or(CredentialError::NoMasterPassword)?;
        if !verifier.verify(master) {
            log::warn!("Wrong master password entered");
            return Err(CredentialError::WrongMasterPassword);
        }
        self.master = Some(Zeroizing::new(master.to_string()));
        Ok(())
    }

    pub fn lock(&mut self) {
        self.master = None;
    }

    /// Set, change (`Some`) or remove (`None`) the master password. Changing
    /// or removing one requires the manager to be unlocked. Blobs sealed
    /// with the old master password must be re-encrypted by the caller
    /// (decrypt before, encrypt after).
    pub fn set_master_password(&mut self, new: Option<&str>) -> CredentialResult<()> {
        if self.verifier.is_some() && self.master.is_none() {
            return Err(CredentialError::Locked);
        }
        match new {
            Some(master) => {
                self.verifier = Some(MasterPasswordVerifier::create(master)?);
                self.master = Some(Zeroizing::new(master.to_string()));
                log::info!("Master password set");
            }
            None => {
                self.verifier = None;
                self.master = None;
                log::info!("Master password removed");
            }
        }
        Ok(())
    }

    fn master(&self) -> CredentialResult<&str> {
        if self.verifier.is_none() {
            return Err(CredentialError::NoMasterPassword);
        }
        self.master
            .as_ref()
            .map(|m| m.as_str())
            .ok_or(CredentialError::Locked)
    }

    pub fn encrypt_password(&self, plain: &str, use_master: bool) -> CredentialResult<EncryptedPassword> {
        if use_master {
            Ok(EncryptedPassword {
                form: PasswordForm::Aes,
                bytes: aes::encrypt(plain.as_bytes(), self.master()?)?,
            })
        } else {
            Ok(EncryptedPassword {
                form: PasswordForm::Scrambled,
                bytes: scramble_password(plain)?,
            })
        }
    }

    pub fn decrypt_password(&self, enc: &EncryptedPassword) -> CredentialResult<String> {
        match enc.form {
            PasswordForm::Scrambled => unscramble_password(&enc.bytes),
            PasswordForm::Aes => {
                let plain = aes::decrypt(&enc.bytes, self.master()?)?;
                String::from_utf8(plain.to_vec())
                    .map_err(|_| CredentialError::Corrupt("decrypted password is not UTF-8".into()))
            }
        }
    }

    /// Re-encrypt a scrambled blob with the master password.
    pub fn migrate_to_master(&self, enc: &EncryptedPassword) -> CredentialResult<EncryptedPassword> {
        if enc.form == PasswordForm::Aes {
            return Ok(enc.clone());
        }
        let plain = Zeroizing::new(self.decrypt_password(enc)?);
        self.encrypt_password(&plain, true)
    }

    /// Turn an AES blob back into the scrambled form.
    pub fn migrate_to_scrambled(&self, enc: &EncryptedPassword) -> CredentialResult<EncryptedPassword> {
        if enc.form == PasswordForm::Scrambled {
            return Ok(enc.clone());
        }
        let plain = Zeroizing::new(self.decrypt_password(enc)?);
        self.encrypt_password(&plain, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_master() -> PasswordManager {
        let mut m = PasswordManager::new(None);
        m.set_master_password(Some("master")).unwrap();
        m
    }

    #[test]
    fn scrambled_without_master() {
        let m = PasswordManager::new(None);
        let enc = m.encrypt_password("pw", false).unwrap();
        assert_eq!(enc.form, PasswordForm::Scrambled);
        let restored = EncryptedPassword::from_base64(&enc.to_base64()).unwrap();
        assert_eq!(m.decrypt_password(&restored).unwrap(), "pw");
        assert_eq!(m.encrypt_password("pw", true).unwrap_err(), CredentialError::NoMasterPassword);
    }

    #[test]
    fn aes_needs_unlock() {
        let m = with_master();
        let enc = m.encrypt_password("pw", true).unwrap();
        assert!(enc.is_encrypted_with_master());

        let mut fresh = PasswordManager::new(m.verifier().cloned());
        assert_eq!(fresh.decrypt_password(&enc).unwrap_err(), CredentialError::Locked);
        assert_eq!(fresh.unlock("nope").unwrap_err(), CredentialError::WrongMasterPassword);
        fresh.unlock("master").unwrap();
        assert_eq!(fresh.decrypt_password(&enc).unwrap(), "pw");
    }

    #[test]
    fn migration_both_ways() {
        let m = with_master();
        let scrambled = m.encrypt_password("pw", false).unwrap();
        let aes = m.migrate_to_master(&scrambled).unwrap();
        assert_eq!(aes.form, PasswordForm::Aes);
        assert_eq!(m.decrypt_password(&aes).unwrap(), "pw");
        let back = m.migrate_to_scrambled(&aes).unwrap();
        assert_eq!(back.form, PasswordForm::Scrambled);
        assert_eq!(m.decrypt_password(&back).unwrap(), "pw");
    }

    #[test]
    fn locked_manager_cannot_change_master() {
        let m = with_master();
        let mut locked = PasswordManager::new(m.verifier().cloned());
        assert_eq!(locked.set_master_password(None).unwrap_err(), CredentialError::Locked);
        locked.unlock("master").unwrap();
        locked.set_master_password(None).unwrap();
        assert!(!locked.is_using_master_password());
    }

    #[test]
    fn bad_blobs() {
        assert!(EncryptedPassword::from_base64("").is_err());
        assert!(EncryptedPassword::from_base64("CQ==").is_err());
        assert!(EncryptedPassword::from_base64("not base64!").is_err());
    }
}
