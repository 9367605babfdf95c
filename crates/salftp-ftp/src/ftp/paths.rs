//! Remote path conventions.
//!
//! FTP servers expose very different path syntaxes (`/pub/x`, `C:\x`,
//! `DKA0:[DIR.SUB]`, `'USER.DATA'`, `VMUSER.191:`). The control connection
//! detects the type from SYST, the banner and the first PWD, and everything
//! that compares paths (reconnect verification, the listing cache) goes
//! through [`is_same_server_path`] / [`is_prefix_of_server_path`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Path syntax family of an FTP server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum ServerPathType {
    /// Not yet known (no PWD done).
    #[default]
    Empty,
    Unknown,
    Unix,
    Windows,
    Netware,
    OpenVms,
    Mvs,
    IbmZVm,
    Os2,
    Tandem,
    As400,
}

impl fmt::Display for ServerPathType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerPathType::Empty => "empty",
            ServerPathType::Unknown => "unknown",
            ServerPathType::Unix => "UNIX",
            ServerPathType::Windows => "Windows",
            ServerPathType::Netware => "Netware",
            ServerPathType::OpenVms => "OpenVMS",
            ServerPathType::Mvs => "MVS",
            ServerPathType::IbmZVm => "IBM z/VM",
            ServerPathType::Os2 => "OS/2",
            ServerPathType::Tandem => "Tandem",
            ServerPathType::As400 => "AS/400",
        };
        f.write_str(s)
    }
}

const KNOWN_OS_NAMES: &[&str] = &[
    "UNIX", "Windows", "NETWARE", "TANDEM", "OS/2", "VMS", "MVS", "VM", "OS/400",
];

fn has_substring(text: &str, sub: &str) -> bool {
    text.to_ascii_lowercase().contains(&sub.to_ascii_lowercase())
}

fn is_known_os_name(word: &str) -> bool {
    KNOWN_OS_NAMES.iter().any(|os| os.eq_ignore_ascii_case(word))
}

/// Extract the system name word from a SYST reply (`215 UNIX Type: L8`).
///
/// Uses the last line of a multi-line reply. When the first word is not a
/// known OS name, later words are searched (`215 Betriebssystem OS/2`).
pub fn server_system_name(syst_reply: &str) -> String {
    let reply = syst_reply.trim_end_matches(['\r', '\n']);
    if !reply.starts_with('2') || reply.len() <= 4 {
        return String::new();
    }
    let last = reply.rsplit(['\r', '\n']).next().unwrap_or(reply);
    let body = last.get(4..).unwrap_or("");
    let mut words = body.split_whitespace();
    let first = match words.next() {
        Some(w) => w,
        None => return String::new(),
    };
    let chosen = if is_known_os_name(first) {
        first
    } else {
        words.find(|w| is_known_os_name(w)).unwrap_or(first)
    };
    chosen.chars().take(200).collect()
}

fn is_hellsoft_netware(banner: Option<&str>) -> bool {
    banner.is_some_and(|b| has_substring(b, " NW 3") && has_substring(b, " HellSoft"))
}

fn is_tandem(banner: Option<&str>, sys: &str) -> bool {
    banner.is_some_and(|b| has_substring(b, " TANDEM "))
        && (sys.is_empty() || has_substring(sys, "TANDEM"))
}

/// Guess the path type from the banner, the SYST reply and a server path.
pub fn detect_path_type(banner: Option<&str>, syst_reply: Option<&str>, path: &str) -> ServerPathType {
    let sys = syst_reply.map(server_system_name).unwrap_or_default();
    let b = path.as_bytes();

    let mut slash = 0;
    let mut backslash = 0;
    let mut apostroph = 0;
    let mut apostroph_at_end = 0;
    let mut bracket = 0;
    let mut open_bracket = 0;
    let mut close_bracket = 0;
    let mut colon = 0;
    let mut periods_after_colon = 0;
    let mut periods_before_colon = 0;
    let mut spaces = 0;
    let mut vms_escape = false;

    for (i, &c) in b.iter().enumerate() {
        if c == b'^' {
            vms_escape = !vms_escape;
            continue;
        }
        match c {
            b'/' if i > 0 => slash += 1,
            b'\\' if i > 0 => backslash += 1,
            b'\'' if i > 0 => {
                if i + 1 == b.len() {
                    apostroph_at_end += 1;
                } else {
                    apostroph += 1;
                }
            }
            b'[' => {
                if i == 0 || b[i - 1] == b':' {
                    if !vms_escape {
                        open_bracket += 1;
                    }
                } else if !vms_escape {
                    bracket += 1;
                }
            }
            b']' => {
                if !vms_escape {
                    if closes_vms_directory(&b[i + 1..]) {
                        close_bracket += 1;
                    } else {
                        bracket += 1;
                    }
                }
            }
            b':' => colon += 1,
            b'.' => {
                if colon > 0 {
                    periods_after_colon += 1;
                } else {
                    periods_before_colon += 1;
                }
            }
            b' ' => spaces += 1,
            _ => {}
        }
        vms_escape = false;
    }

    let first = b.first().copied();
    if first == Some(b'/') {
        return if has_substring(&sys, "Windows") {
            ServerPathType::Windows
        } else if has_substring(&sys, "NETWARE") || is_hellsoft_netware(banner) {
            ServerPathType::Netware
        } else if has_substring(&sys, "OS/400") {
            ServerPathType::As400
        } else {
            ServerPathType::Unix
        };
    }
    if first == Some(b'\\') {
        return if has_substring(&sys, "NETWARE") || is_hellsoft_netware(banner) {
            ServerPathType::Netware
        } else if slash == 0 && backslash == 0 && is_tandem(banner, &sys) {
            ServerPathType::Tandem
        } else {
            ServerPathType::Windows
        };
    }
    let drive_letter = first.is_some_and(|c| c.is_ascii_alphabetic()) && b.get(1) == Some(&b':');
    if drive_letter && colon == 1 && (b.len() == 2 || slash > 0 || backslash > 0) {
        return ServerPathType::Os2;
    }
    if open_bracket == 1 && close_bracket == 1 && bracket == 0 && slash + backslash == 0 {
        let quoted = first == Some(b'\'') || apostroph_at_end > 0;
        if !quoted {
            return ServerPathType::OpenVms;
        }
    }
    if first == Some(b'\'') && apostroph_at_end > 0 && apostroph == 0 {
        return ServerPathType::Mvs;
    }
    if slash == 0
        && backslash == 0
        && colon == 1
        && periods_after_colon > 0
        && periods_before_colon == 0
        && spaces == 0
    {
        return ServerPathType::IbmZVm;
    }

    if path.is_empty() {
        if has_substring(&sys, "UNIX") {
            return ServerPathType::Unix;
        }
        if has_substring(&sys, "Windows") {
            return ServerPathType::Windows;
        }
        if has_substring(&sys, "NETWARE") || is_hellsoft_netware(banner) {
            return ServerPathType::Netware;
        }
        if has_substring(&sys, "OS/2") {
            return ServerPathType::Os2;
        }
        if has_substring(&sys, "VMS") {
            return ServerPathType::OpenVms;
        }
        if has_substring(&sys, "MVS") {
            return ServerPathType::Mvs;
        }
        if has_substring(&sys, "VM") {
            return ServerPathType::IbmZVm;
        }
        if is_tandem(banner, &sys) {
            return ServerPathType::Tandem;
        }
    }
    if has_substring(&sys, "OS/400") {
        return ServerPathType::As400;
    }
    ServerPathType::Unknown
}

/// `]` closes the directory part if only a file name follows it.
fn closes_vms_directory(rest: &[u8]) -> bool {
    let mut esc = false;
    for &c in rest {
        if c == b'/' || c == b'\\' {
            return false;
        }
        if c == b'^' {
            esc = !esc;
            continue;
        }
        if esc {
            esc = false;
        } else if c == b'[' || c == b']' {
            return false;
        }
    }
    true
}

/// Odd number of `^` before `idx` means the char is escaped (VMS ODS-5).
fn is_vms_escaped(path: &[u8], idx: usize) -> bool {
    let carets = path[..idx].iter().rev().take_while(|&&c| c == b'^').count();
    carets % 2 == 1
}

pub fn path_delimiter(ty: ServerPathType) -> char {
    match ty {
        ServerPathType::Tandem
        | ServerPathType::IbmZVm
        | ServerPathType::OpenVms
        | ServerPathType::Mvs => '.',
        _ => '/',
    }
}

/// Append `name` to the directory `dir`; the inverse of splitting a path
/// at its last delimiter.
pub fn join_server_path(ty: ServerPathType, dir: &str, name: &str) -> String {
    let delim = path_delimiter(ty);
    if dir.is_empty() {
        return name.to_string();
    }
    format!("{}{}{}", dir.trim_end_matches(delim), delim, name)
}

pub fn is_case_sensitive(ty: ServerPathType) -> bool {
    ty == ServerPathType::Unix
}

pub fn path_ends_with_delimiter(ty: ServerPathType, path: &str) -> bool {
    let b = path.as_bytes();
    let l = b.len();
    match ty {
        ServerPathType::OpenVms => {
            l > 1
                && b[l - 1] == b']'
                && !is_vms_escaped(b, l - 1)
                && b[l - 2] == b'.'
                && !is_vms_escaped(b, l - 2)
        }
        ServerPathType::Mvs => l > 1 && b[l - 1] == b'\'' && b[l - 2] == b'.',
        ServerPathType::Tandem | ServerPathType::IbmZVm => l > 0 && b[l - 1] == b'.',
        ServerPathType::Netware | ServerPathType::Windows | ServerPathType::Os2 => {
            l > 0 && (b[l - 1] == b'/' || b[l - 1] == b'\\')
        }
        _ => l > 0 && b[l - 1] == b'/',
    }
}

/// Path as sent to the server: strips the leading '/' that path strings
/// carry for systems whose paths do not start with one.
pub fn local_path(path: &str, ty: ServerPathType) -> &str {
    match ty {
        ServerPathType::IbmZVm | ServerPathType::OpenVms | ServerPathType::Os2 | ServerPathType::Mvs => {
            path.strip_prefix(['/', '\\']).unwrap_or(path)
        }
        _ => path,
    }
}

pub fn is_same_server_path(ty: ServerPathType, p1: &str, p2: &str) -> bool {
    prefix_of_server_path(ty, p1, p2, true)
}

/// `prefix` equals `path` or is one of its ancestors.
pub fn is_prefix_of_server_path(ty: ServerPathType, prefix: &str, path: &str) -> bool {
    prefix_of_server_path(ty, prefix, path, false)
}

fn eq_ci(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.eq_ignore_ascii_case(b)
}

fn prefix_of_server_path(ty: ServerPathType, prefix: &str, path: &str, must_be_same: bool) -> bool {
    let p = prefix.as_bytes();
    let q = path.as_bytes();
    match ty {
        ServerPathType::OpenVms => {
            let l1 = vms_trimmed_len(p);
            let l2 = vms_trimmed_len(q);
            (l1 == l2 || !must_be_same && l1 < l2)
                && eq_ci(&p[..l1], &q[..l1])
                && (l1 == l2
                    || (l1 > 0 && p[l1 - 1] == b'[' && !is_vms_escaped(p, l1 - 1))
                    || ((q[l1] == b'.' || q[l1] == b']') && !is_vms_escaped(q, l1)))
        }
        ServerPathType::Mvs => {
            let trim = |s: &[u8]| {
                let mut l = s.len();
                if l > 1 && s[l - 1] == b'\'' {
                    l -= 1;
                    if s[l - 1] == b'.' {
                        l -= 1;
                    }
                }
                l
            };
            let l1 = trim(p);
            let l2 = trim(q);
            (l1 == l2 || !must_be_same && l1 < l2)
                && eq_ci(&p[..l1], &q[..l1])
                && (l1 == l2 || q[l1] == b'.' || q[l1] == b'\'')
        }
        ServerPathType::Netware | ServerPathType::Windows | ServerPathType::Os2 => {
            let is_sep = |c: u8| c == b'/' || c == b'\\';
            let mut i = 0;
            let mut j = 0;
            while i < p.len()
                && j < q.len()
                && ((is_sep(p[i]) && is_sep(q[j])) || p[i].eq_ignore_ascii_case(&q[j]))
            {
                i += 1;
                j += 1;
            }
            if i < p.len() && is_sep(p[i]) {
                i += 1;
            }
            if j < q.len() && is_sep(q[j]) {
                j += 1;
            }
            (i == p.len() && j == q.len())
                || (!must_be_same && i == p.len() && j > 0 && is_sep(q[j - 1]))
        }
        ServerPathType::IbmZVm | ServerPathType::Tandem => {
            let trim = |s: &[u8]| if s.len() > 1 && s[s.len() - 1] == b'.' { s.len() - 1 } else { s.len() };
            let l1 = trim(p);
            let l2 = trim(q);
            (l1 == l2 || !must_be_same && l1 < l2)
                && eq_ci(&p[..l1], &q[..l1])
                && (l1 == l2 || q[l1] == b'.')
        }
        ServerPathType::As400 => {
            let mut i = 0;
            let mut j = 0;
            while i < p.len() && j < q.len() && p[i].eq_ignore_ascii_case(&q[j]) {
                i += 1;
                j += 1;
            }
            if i < p.len() && p[i] == b'/' {
                i += 1;
            }
            if j < q.len() && q[j] == b'/' {
                j += 1;
            }
            (i == p.len() && j == q.len())
                || (!must_be_same && i == p.len() && j > 0 && q[j - 1] == b'/')
        }
        _ => {
            let l1 = if p.last() == Some(&b'/') { p.len() - 1 } else { p.len() };
            let l2 = if q.last() == Some(&b'/') { q.len() - 1 } else { q.len() };
            (l1 == l2 || !must_be_same && l1 < l2)
                && p[..l1] == q[..l1]
                && (l1 == l2 || q[l1] == b'/')
        }
    }
}

/// Length of a VMS path without its closing `]`, `.]` and `[000000`.
fn vms_trimmed_len(s: &[u8]) -> usize {
    let mut l = s.len();
    if l > 1 && s[l - 1] == b']' && !is_vms_escaped(s, l - 1) {
        l -= 1;
        if s[l - 1] == b'.' && !is_vms_escaped(s, l - 1) {
            l -= 1;
        }
        if l >= 7 && &s[l - 7..l] == b"[000000" && !is_vms_escaped(s, l - 7) {
            l -= 6;
        }
    }
    l
}

// ─── User-part paths ("//user:password@host:port/path") ─────────────

/// A parsed `//user:password@host:port/path` string.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserPart {
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    /// Path without the separator that follows the host; `None` = root.
    pub path: Option<String>,
}

impl UserPart {
    /// Split a user-part path. Returns `None` when the host is empty or the
    /// port is not a number.
    pub fn parse(s: &str) -> Option<Self> {
        let rest = s.strip_prefix("//").unwrap_or(s);
        // The user name may contain '@', the path may too: split on the last
        // '@' before the first separator that follows it.
        let at = rest
            .find(['/', '\\'])
            .map(|sep| rest[..sep].rfind('@'))
            .unwrap_or_else(|| rest.rfind('@'));
        let (userinfo, hostpart) = match at {
            Some(i) => (Some(&rest[..i]), &rest[i + 1..]),
            None => (None, rest),
        };
        let (user, password) = match userinfo {
            Some(ui) => match ui.find(':') {
                Some(c) => (Some(ui[..c].trim().to_string()), Some(ui[c + 1..].to_string())),
                None => (Some(ui.trim().to_string()), None),
            },
            None => (None, None),
        };
        let sep = hostpart.find(['/', '\\']);
        let (hostport, path) = match sep {
            Some(i) => (&hostpart[..i], Some(hostpart[i + 1..].to_string())),
            None => (hostpart, None),
        };
        let (host, port) = match hostport.rfind(':') {
            Some(c) => {
                let port = hostport[c + 1..].trim();
                let port = if port.is_empty() { None } else { Some(port.parse().ok()?) };
                (hostport[..c].trim(), port)
            }
            None => (hostport.trim(), None),
        };
        if host.is_empty() {
            return None;
        }
        Some(UserPart {
            user: user.filter(|u| !u.is_empty()),
            password,
            host: host.to_string(),
            port,
            path,
        })
    }

    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(21)
    }

    /// User name with "anonymous" folded into `None`.
    pub fn effective_user(&self) -> Option<&str> {
        self.user
            .as_deref()
            .filter(|u| !u.eq_ignore_ascii_case(crate::ftp::types::ANONYMOUS_USER))
    }

    /// Server path (with the leading '/' that path strings always carry).
    pub fn server_path(&self) -> String {
        format!("/{}", self.path.as_deref().unwrap_or(""))
    }

    /// Format back without the password.
    pub fn to_display_string(&self) -> String {
        let mut s = String::from("//");
        if let Some(u) = &self.user {
            s.push_str(u);
            s.push('@');
        }
        s.push_str(&self.host);
        if let Some(p) = self.port.filter(|&p| p != 21) {
            s.push_str(&format!(":{}", p));
        }
        s.push('/');
        if let Some(p) = &self.path {
            s.push_str(p);
        }
        s
    }
}

/// Two user-part paths address the same server directory.
pub fn is_same_user_part_path(ty: ServerPathType, a: &str, b: &str) -> bool {
    let (a, b) = match (UserPart::parse(a), UserPart::parse(b)) {
        (Some(a), Some(b)) => (a, b),
        _ => return false,
    };
    a.effective_user() == b.effective_user()
        && a.host.eq_ignore_ascii_case(&b.host)
        && a.port_or_default() == b.port_or_default()
        && match (&a.path, &b.path) {
            (Some(p1), Some(p2)) => is_same_server_path(ty, p1, p2),
            (None, None) => true,
            (None, Some(p)) | (Some(p), None) => p.is_empty(),
        }
}
