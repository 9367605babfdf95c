//! Architecture:
//! - `error` — script errors
//! - `version` — version strings to comparable numbers
//! - `script` — script parser
//! - `compare` — classification against installed modules

pub mod compare;
pub mod error;
pub mod script;
pub mod version;

/// First line of every script.
pub const SCRIPT_SIGNATURE_BEGIN: &str = "SALAMANDER_VERINFO_BEGIN";
/// Last line of every script.
pub const SCRIPT_SIGNATURE_EOF: &str = "SALAMANDER_VERINFO_EOF";
/// Scripts larger than this are rejected unread.
pub const MAX_SCRIPT_SIZE: u64 = 512 * 1024;
