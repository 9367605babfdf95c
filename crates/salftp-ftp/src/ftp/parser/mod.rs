//! Listing parser: server types described by a small rule language.
//!
//! A server type is a list of columns plus rule text. Each rule is a
//! sequence of parsing functions; at every line start the rules are tried in
//! order and the first one that consumes the whole line wins. Rules that do
//! not assign the name column only skip text (headers, blank lines).
//!
//! - `ast` — compiled rule form
//! - `compiler` — rule and autodetect-condition compiler
//! - `engine` — rule interpreter
//! - `builtin` — server types shipped with the client
//! - `autodetect` — choosing a server type for an unknown server

pub mod ast;
pub mod autodetect;
pub mod builtin;
pub mod compiler;
pub mod engine;

use std::sync::{Arc, RwLock};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::ftp::error::{FtpError, FtpResult};

pub use ast::{ColumnDef, ColumnKind};
pub use autodetect::{autodetect, Detection};
pub use compiler::Condition;
pub use engine::ParsedListing;

/// User-visible definition of a server type, as persisted in the config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerType {
    pub name: String,
    /// Autodetect condition; `None` means the type is only tried after all
    /// types whose condition holds.
    #[serde(default)]
    pub autodetect: Option<String>,
    pub columns: Vec<ColumnDef>,
    pub rules: String,
}

impl ServerType {
    pub fn compile(&self) -> FtpResult<CompiledServerType> {
        let condition = match self.autodetect.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => Some(compiler::compile_condition(text).map_err(
                |e| FtpError::invalid_config(format!("{}: autodetect: {}", self.name, e.message)),
            )?),
            _ => None,
        };
        let rules = compiler::compile_rules(&self.rules, &self.columns).map_err(|e| {
            FtpError::invalid_config(format!("{}: rules: {}", self.name, e.message))
        })?;
        Ok(CompiledServerType {
            name: self.name.clone(),
            condition,
            columns: self.columns.clone(),
            rules,
        })
    }
}

/// Server type ready for parsing.
#[derive(Debug, Clone)]
pub struct CompiledServerType {
    name: String,
    condition: Option<Condition>,
    columns: Vec<ColumnDef>,
    rules: Vec<ast::Rule>,
}

impl CompiledServerType {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// `false` for types without a condition.
    pub fn condition_holds(&self, welcome: &str, syst: &str) -> bool {
        self.condition
            .as_ref()
            .is_some_and(|c| c.evaluate(welcome, syst))
    }

    /// Parses raw listing bytes. `today` drives year guessing for
    /// `year_or_time`.
    pub fn parse(&self, raw: &[u8], incomplete: bool, today: NaiveDate) -> ParsedListing {
        let text = decode_listing(raw);
        self.parse_chars(&text, incomplete, today)
    }

    pub(crate) fn parse_chars(
        &self,
        text: &[char],
        incomplete: bool,
        today: NaiveDate,
    ) -> ParsedListing {
        engine::ParseRun::new(text, &self.columns, today, incomplete).run(&self.rules)
    }
}

/// UTF-8 when valid, otherwise one char per byte (Latin-1).
pub fn decode_listing(raw: &[u8]) -> Vec<char> {
    match std::str::from_utf8(raw) {
        Ok(s) => s.chars().collect(),
        Err(_) => raw.iter().map(|&b| char::from(b)).collect(),
    }
}

/// Ordered, shared list of compiled server types.
#[derive(Debug, Default)]
pub struct ServerTypeList {
    types: RwLock<Vec<Arc<CompiledServerType>>>,
}

impl ServerTypeList {
    pub fn with_builtins() -> FtpResult<Self> {
        Self::from_types(builtin::BUILTIN_SERVER_TYPES.iter())
    }

    pub fn from_types<'a>(types: impl IntoIterator<Item = &'a ServerType>) -> FtpResult<Self> {
        let list = Self::default();
        for ty in types {
            list.add(ty)?;
        }
        Ok(list)
    }

    /// Adds a type, replacing one with the same name (case-insensitive).
    pub fn add(&self, ty: &ServerType) -> FtpResult<()> {
        let compiled = Arc::new(ty.compile()?);
        let mut types = self.types.write().map_err(|_| poisoned())?;
        match types
            .iter()
            .position(|t| t.name.eq_ignore_ascii_case(&ty.name))
        {
            Some(i) => types[i] = compiled,
            None => types.push(compiled),
        }
        Ok(())
    }

    pub fn remove(&self, name: &str) -> FtpResult<bool> {
        let mut types = self.types.write().map_err(|_| poisoned())?;
        let before = types.len();
        types.retain(|t| !t.name.eq_ignore_ascii_case(name));
        Ok(types.len() != before)
    }

    pub fn get(&self, name: &str) -> Option<Arc<CompiledServerType>> {
        self.types
            .read()
            .ok()?
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<CompiledServerType>> {
        self.types.read().map(|t| t.clone()).unwrap_or_default()
    }

    pub fn names(&self) -> Vec<String> {
        self.all().iter().map(|t| t.name.clone()).collect()
    }
}

fn poisoned() -> FtpError {
    FtpError::new(
        crate::ftp::error::FtpErrorKind::Unknown,
        "server type list lock poisoned",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::types::FtpEntryKind;
    use chrono::{Datelike, NaiveTime};

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 15).unwrap()
    }

    #[test]
    fn unix_listing() {
        let list = ServerTypeList::with_builtins().unwrap();
        let unix = list.get("unix").unwrap();
        let raw = b"total 12\r\n\
drwxr-xr-x   2 ftp      ftp          4096 Mar  3 09:15 pub\r\n\
-rw-r--r--   1 ftp      ftp        123456 Dec 24  2019 README.txt\r\n\
lrwxrwxrwx   1 root     root            7 Jan  5 12:00 latest -> v1.2\r\n\
-rw-------   1 ftp      ftp            10 Jul  1 10:00 .hidden\r\n";
        let out = unix.parse(raw, false, today());
        assert_eq!(out.skipped_lines, 0);
        assert_eq!(out.entries.len(), 4);

        let pub_dir = &out.entries[0];
        assert_eq!(pub_dir.name, "pub");
        assert_eq!(pub_dir.kind, FtpEntryKind::Directory);
        assert_eq!(pub_dir.size, 0);
        assert_eq!(pub_dir.date, NaiveDate::from_ymd_opt(2024, 3, 3).unwrap());
        assert_eq!(pub_dir.time, NaiveTime::from_hms_opt(9, 15, 0).unwrap());
        assert_eq!(pub_dir.owner.as_deref(), Some("ftp"));

        let readme = &out.entries[1];
        assert_eq!(readme.size, 123456);
        assert_eq!(readme.date.year(), 2019);
        assert_eq!(readme.extension(), Some("txt"));
        assert_eq!(readme.permissions.as_deref(), Some("-rw-r--r--"));

        let link = &out.entries[2];
        assert_eq!(link.kind, FtpEntryKind::Symlink);
        assert_eq!(link.name, "latest");
        assert_eq!(link.link_target.as_deref(), Some("v1.2"));

        // July is after June, so the year is corrected back
        let hidden = &out.entries[3];
        assert!(hidden.hidden);
        assert_eq!(hidden.date, NaiveDate::from_ymd_opt(2023, 7, 1).unwrap());
    }

    #[test]
    fn iis_listing() {
        let list = ServerTypeList::with_builtins().unwrap();
        let iis = list.get("Microsoft IIS").unwrap();
        let raw = b"06-14-24  01:05PM       <DIR>          docs\r\n06-01-24  09:00AM                 2048 a b.zip\r\n";
        let out = iis.parse(raw, false, today());
        assert_eq!(out.skipped_lines, 0);
        assert_eq!(out.entries[0].name, "docs");
        assert!(out.entries[0].is_dir());
        assert_eq!(out.entries[0].time, NaiveTime::from_hms_opt(13, 5, 0).unwrap());
        assert_eq!(out.entries[1].name, "a b.zip");
        assert_eq!(out.entries[1].size, 2048);
        assert_eq!(out.entries[1].date, NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());
    }

    #[test]
    fn latin1_fallback() {
        assert_eq!(decode_listing(b"caf\xe9"), vec!['c', 'a', 'f', 'é']);
        assert_eq!(decode_listing("café".as_bytes()), vec!['c', 'a', 'f', 'é']);
    }

    #[test]
    fn add_replaces_by_name() {
        let list = ServerTypeList::with_builtins().unwrap();
        let count = list.names().len();
        let custom = ServerType {
            name: "unix".into(),
            autodetect: None,
            columns: vec![ColumnDef::new("name", ColumnKind::Name)],
            rules: "* rest_of_line(<name>);".into(),
        };
        list.add(&custom).unwrap();
        assert_eq!(list.names().len(), count);
        assert!(list.remove("UNIX").unwrap());
        assert!(list.get("unix").is_none());
    }

    #[test]
    fn invalid_type_is_rejected() {
        let bad = ServerType {
            name: "bad".into(),
            autodetect: Some("syst_contains(".into()),
            columns: vec![ColumnDef::new("name", ColumnKind::Name)],
            rules: "* rest_of_line(<name>);".into(),
        };
        assert!(bad.compile().is_err());
    }
}
