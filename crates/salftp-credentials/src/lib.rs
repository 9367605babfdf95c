//! # salftp – saved passwords
//!
//! Passwords of bookmarks and proxy servers are stored either scrambled
//! (reversible, no secret) or encrypted with a key derived from a master
//! password.

pub mod credentials;

pub use credentials::aes::MasterPasswordVerifier;
pub use credentials::error::{CredentialError, CredentialResult};
pub use credentials::manager::{EncryptedPassword, PasswordForm, PasswordManager};
pub use credentials::scramble::{scramble_password, unscramble_password};
