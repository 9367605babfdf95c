//! # salftp – update check
//!
//! Reads the line-oriented `SALAMANDER_VERINFO` script published on the
//! update server and tells which listed modules are newer than the ones
//! installed.

pub mod verinfo;

pub use verinfo::compare::{classify, CheckOptions, CheckReport, Filters, InstalledModule, ModuleStatus};
pub use verinfo::error::{VerInfoError, VerInfoResult};
pub use verinfo::script::{parse_script, read_script_file, ScriptModule};
pub use verinfo::version::ResolvedVersion;
