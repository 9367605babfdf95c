//! Architecture:
//! - `error` — credential error type
//! - `scramble` — legacy reversible scrambling
//! - `aes` — PBKDF2 + AES-256-GCM, master password verifier
//! - `manager` — password manager and stored blob format

pub mod aes;
pub mod error;
pub mod manager;
pub mod scramble;
