//! Error types for the credentials crate.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("Wrong master password")]
    WrongMasterPassword,
    /// Encryption with the master password was requested but none is set.
    #[error("No master password is set")]
    NoMasterPassword,
    /// A master password is set but has not been entered yet.
    #[error("Master password has not been entered")]
    Locked,
    #[error("Password cannot be stored: {0}")]
    InvalidPassword(String),
    #[error("Stored password is corrupt: {0}")]
    Corrupt(String),
    #[error("Encryption error: {0}")]
    Crypto(String),
}

pub type CredentialResult<T> = Result<T, CredentialError>;

impl From<base64::DecodeError> for CredentialError {
    fn from(e: base64::DecodeError) -> Self {
        Self::Corrupt(format!("invalid base64: {}", e))
    }
}
