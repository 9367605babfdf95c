//! Script parser.
//!
//! ```text
//! SALAMANDER_VERINFO_BEGIN
//! salamand.exe              module file name
//! Open Salamander           display name
//! 4.0                       release version (blank line: none)
//! https://example.org/      URL
//! What is new ...           info lines, ended by a blank line
//!
//! 4.1 beta 1                beta version (blank line: none)
//! https://example.org/beta
//! ...
//!
//! SALAMANDER_VERINFO_EOF
//! ```
//!
//! A module lists a release, a beta or both; each one becomes its own
//! [`ScriptModule`].

use super::error::{VerInfoError, VerInfoResult};
use super::version::ResolvedVersion;
use super::{MAX_SCRIPT_SIZE, SCRIPT_SIGNATURE_BEGIN, SCRIPT_SIGNATURE_EOF};
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptModule {
    /// File name of the module, e.g. `salamand.exe`.
    pub module: String,
    pub name: String,
    pub version: String,
    pub resolved: ResolvedVersion,
    /// Listed in the beta slot of its block.
    pub beta_section: bool,
    pub url: String,
    pub infos: Vec<String>,
}

/// Split into lines. Accepts `\n`, `\r\n`, `\n\r`, a lone `\r` and the
/// `\r\r\n` that an ASCII-mode FTP download makes of `\r\n`. Trailing
/// spaces are dropped; nothing after the EOF signature is read.
fn split_lines(text: &str) -> Vec<String> {
    let bytes = text.as_bytes();
    let mut lines = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i <= bytes.len() {
        if i == bytes.len() || bytes[i] == b'\r' || bytes[i] == b'\n' {
            let line = text[start..i].trim_end_matches(' ').to_string();
            let at_eof = line == SCRIPT_SIGNATURE_EOF;
            lines.push(line);
            if at_eof || i == bytes.len() {
                break;
            }
            let rest = &bytes[i..];
            i += if rest.starts_with(b"\r\r\n") {
                3
            } else if rest.starts_with(b"\r\n") || rest.starts_with(b"\n\r") {
                2
            } else {
                1
            };
            if i == bytes.len() {
                break;
            }
            start = i;
        } else {
            i += 1;
        }
    }
    lines
}

enum ReadMode {
    Module,
    Name,
    Version,
    Url,
}

pub fn parse_script(text: &str) -> VerInfoResult<Vec<ScriptModule>> {
    let lines = split_lines(text);
    let count = lines.len();
    if count == 0 || text.is_empty() {
        return Err(VerInfoError::Empty);
    }
    if lines[0] != SCRIPT_SIGNATURE_BEGIN {
        return Err(VerInfoError::MissingBegin);
    }
    if count < 2 || lines[count - 1] != SCRIPT_SIGNATURE_EOF {
        return Err(VerInfoError::MissingEof);
    }

    let mut modules = Vec::new();
    let mut mode = ReadMode::Module;
    let (mut module, mut name, mut version) = ("", "", "");
    // 0 = release slot, 1 = beta slot
    let mut slot = 0;
    let mut filled = false;

    let mut index = 1;
    while index < count - 1 {
        let line = lines[index].as_str();
        let empty = line.is_empty();
        match mode {
            ReadMode::Module => {
                if empty {
                    return Err(VerInfoError::syntax(index + 1, "module expected"));
                }
                module = line;
                slot = 0;
                filled = false;
                mode = ReadMode::Name;
            }
            ReadMode::Name => {
                if empty {
                    return Err(VerInfoError::syntax(index + 1, "name expected"));
                }
                name = line;
                mode = ReadMode::Version;
            }
            ReadMode::Version => {
                if !empty {
                    if slot > 1 {
                        return Err(VerInfoError::syntax(index + 1, "too many versions"));
                    }
                    filled = true;
                    version = line;
                    mode = ReadMode::Url;
                } else {
                    if slot == 1 {
                        if !filled {
                            return Err(VerInfoError::syntax(
                                index + 1,
                                "neither release nor beta version given",
                            ));
                        }
                        mode = ReadMode::Module;
                    }
                    slot += 1;
                }
            }
            ReadMode::Url => {
                if empty {
                    return Err(VerInfoError::syntax(index + 1, "URL expected"));
                }
                let mut infos = Vec::new();
                while index + 1 < count - 1 {
                    index += 1;
                    let info = lines[index].as_str();
                    if info.is_empty() {
                        break;
                    }
                    infos.push(info.to_string());
                }
                modules.push(ScriptModule {
                    module: module.to_string(),
                    name: name.to_string(),
                    version: version.to_string(),
                    resolved: ResolvedVersion::parse(version),
                    beta_section: slot == 1,
                    url: line.to_string(),
                    infos,
                });
                mode = if slot == 0 { ReadMode::Version } else { ReadMode::Module };
                slot += 1;
            }
        }
        index += 1;
    }

    if !matches!(mode, ReadMode::Module) {
        return Err(VerInfoError::syntax(index, "unexpected end of script"));
    }
    log::debug!("Update script lists {} module version(s)", modules.len());
    Ok(modules)
}

/// Read and parse a script file.
pub fn read_script_file(path: &Path) -> VerInfoResult<Vec<ScriptModule>> {
    let size = std::fs::metadata(path)?.len();
    if size > MAX_SCRIPT_SIZE {
        return Err(VerInfoError::TooLarge(size));
    }
    let bytes = std::fs::read(path)?;
    parse_script(&String::from_utf8_lossy(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "SALAMANDER_VERINFO_BEGIN\r\n\
salamand.exe\r\n\
Open Salamander\r\n\
4.0\r\n\
https://example.org/\r\n\
Bug fixes.\r\n\
New viewer.\r\n\
\r\n\
4.1 beta 1\r\n\
https://example.org/beta\r\n\
\r\n\
ftp.spl\r\n\
FTP Client\r\n\
\r\n\
4.1 beta 1 (PB 7)\r\n\
https://example.org/pb\r\n\
\r\n\
SALAMANDER_VERINFO_EOF\r\n";

    #[test]
    fn parses_modules() {
        let modules = parse_script(SAMPLE).unwrap();
        assert_eq!(modules.len(), 3);
        assert_eq!(modules[0].module, "salamand.exe");
        assert_eq!(modules[0].infos, vec!["Bug fixes.", "New viewer."]);
        assert!(!modules[0].beta_section);
        assert!(modules[1].beta_section);
        assert!(modules[1].resolved.beta);
        assert_eq!(modules[2].name, "FTP Client");
        assert_eq!(modules[2].resolved.special_build, 7);
        assert!(modules[2].infos.is_empty());
    }

    #[test]
    fn odd_line_ends() {
        let text = SAMPLE.replace("\r\n", "\r\r\n");
        assert_eq!(parse_script(&text).unwrap().len(), 3);
        let text = SAMPLE.replace("\r\n", "\n");
        assert_eq!(parse_script(&text).unwrap().len(), 3);
    }

    #[test]
    fn release_only_module() {
        let text = "SALAMANDER_VERINFO_BEGIN\nm\nName\n1.0\nurl\n\n\nSALAMANDER_VERINFO_EOF";
        let modules = parse_script(text).unwrap();
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].version, "1.0");
    }

    #[test]
    fn signatures_are_required() {
        assert!(matches!(parse_script(""), Err(VerInfoError::Empty)));
        assert!(matches!(parse_script("hello\nSALAMANDER_VERINFO_EOF"), Err(VerInfoError::MissingBegin)));
        assert!(matches!(parse_script("SALAMANDER_VERINFO_BEGIN\nm\n"), Err(VerInfoError::MissingEof)));
    }

    #[test]
    fn module_without_versions_is_an_error() {
        let text = "SALAMANDER_VERINFO_BEGIN\nm\nName\n\n\nSALAMANDER_VERINFO_EOF";
        assert!(matches!(parse_script(text), Err(VerInfoError::Syntax { .. })));
    }

    #[test]
    fn truncated_block_is_an_error() {
        let text = "SALAMANDER_VERINFO_BEGIN\nm\nName\n1.0\nSALAMANDER_VERINFO_EOF";
        assert!(matches!(parse_script(text), Err(VerInfoError::Syntax { .. })));
    }

    #[test]
    fn reads_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("salupdate.txt");
        std::fs::write(&path, SAMPLE).unwrap();
        assert_eq!(read_script_file(&path).unwrap().len(), 3);
    }
}
