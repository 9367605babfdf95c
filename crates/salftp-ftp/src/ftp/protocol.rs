//! FTP reply grammar (RFC 959 §4.2) and command-line helpers.
//!
//! Everything here is pure: the control connection accumulates bytes in its
//! socket buffer and calls [`read_ftp_reply`] to cut complete replies off the
//! front.
//!
//! - `NNN text` single-line replies
//! - `NNN-text … NNN text` multi-line replies
//! - bare LF line ends are tolerated (some servers ignore the CRLF rule)
//! - a line that does not start with three digits is returned with
//!   `code == None` so the caller can log it and keep going

use crate::ftp::types::FtpReply;
use std::borrow::Cow;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Longest non-FTP line we buffer before handing it up without its line end.
pub const MAX_NON_FTP_LINE: usize = 1000;

/// Try to cut one complete reply from the front of `buf`.
///
/// Returns the reply and the number of bytes consumed, or `None` when more
/// bytes are needed.
pub fn read_ftp_reply(buf: &[u8]) -> Option<(FtpReply, usize)> {
    if buf.is_empty() {
        return None;
    }

    let code = parse_code(buf);
    let code = match code {
        Some(c) => c,
        None => return read_non_ftp_line(buf),
    };

    let mut lines = Vec::new();
    let mut pos = 0usize;
    let multi = buf.get(3) == Some(&b'-');
    if buf.len() < 4 {
        return None;
    }

    loop {
        let (line, next) = next_line(buf, pos)?;
        lines.push(decode_text(line));
        pos = next;
        if !multi || lines.len() > 1 && is_final_line(line, code) {
            break;
        }
    }

    if !multi && buf[3] != b' ' && buf[3] != b'\r' && buf[3] != b'\n' {
        log::warn!("Unexpected syntax of FTP reply (no space after code)");
    }

    Some((
        FtpReply {
            code: Some(code),
            lines,
        },
        pos,
    ))
}

fn parse_code(buf: &[u8]) -> Option<u16> {
    let mut code = 0u16;
    for i in 0..3 {
        let b = *buf.get(i)?;
        if !b.is_ascii_digit() {
            return None;
        }
        code = code * 10 + u16::from(b - b'0');
    }
    Some(code)
}

fn is_final_line(line: &[u8], code: u16) -> bool {
    line.len() >= 4 && parse_code(line) == Some(code) && line[3] == b' '
}

/// Return the line starting at `pos` (without CRLF/LF) and the offset after it.
fn next_line(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let rest = &buf[pos..];
    let lf = rest.iter().position(|&b| b == b'\n')?;
    let mut end = lf;
    if end > 0 && rest[end - 1] == b'\r' {
        end -= 1;
    }
    Some((&rest[..end], pos + lf + 1))
}

fn read_non_ftp_line(buf: &[u8]) -> Option<(FtpReply, usize)> {
    if let Some((line, next)) = next_line(buf, 0) {
        let line = &line[..line.len().min(MAX_NON_FTP_LINE)];
        return Some((
            FtpReply {
                code: None,
                lines: vec![decode_text(line)],
            },
            next,
        ));
    }
    if buf.len() >= MAX_NON_FTP_LINE {
        return Some((
            FtpReply {
                code: None,
                lines: vec![decode_text(&buf[..MAX_NON_FTP_LINE])],
            },
            MAX_NON_FTP_LINE,
        ));
    }
    None
}

/// Decode server text; servers without UTF8 send arbitrary 8-bit text.
pub fn decode_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Text of a command as it may appear in logs.
pub fn loggable_command(cmd: &str) -> Cow<'_, str> {
    let upper = cmd.get(..5).map(|s| s.to_ascii_uppercase());
    match upper.as_deref() {
        Some("PASS ") | Some("ACCT ") => Cow::Owned(format!("{}(hidden)", &cmd[..5])),
        _ => Cow::Borrowed(cmd),
    }
}

// ─── Reply payloads ──────────────────────────────────────────────────

/// Extract the directory from a `257` reply.
///
/// RFC 959 form is `257 "<dir>" comment` with `""` escaping a quote. Some
/// servers put text before the quoted path; German AIX quotes with `'`.
pub fn parse_directory_from_257(reply_line: &str) -> Option<String> {
    let bytes = reply_line.as_bytes();
    let mut s = 4.min(bytes.len());
    while s < bytes.len() && bytes[s] != b'"' && bytes[s] != b'\'' {
        s += 1;
    }
    if s < bytes.len() && bytes[s] == b'\'' {
        let rest = &reply_line[s + 1..];
        if let Some(last) = rest.rfind('\'') {
            if !rest[last..].contains('"') {
                return Some(rest[..last].to_string());
            }
        }
        while s < bytes.len() && bytes[s] != b'"' {
            s += 1;
        }
    }
    if s >= bytes.len() {
        return None;
    }

    let mut dir = Vec::new();
    let mut i = s + 1;
    while i < bytes.len() {
        if bytes[i] == b'"' {
            if bytes.get(i + 1) == Some(&b'"') {
                i += 1;
            } else {
                return Some(String::from_utf8_lossy(&dir).into_owned());
            }
        }
        dir.push(bytes[i]);
        i += 1;
    }
    None
}

/// Parse the address from a `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`.
///
/// Scans for six numbers below 256 separated by commas, skipping the code.
pub fn parse_pasv_reply(reply_line: &str) -> Option<SocketAddrV4> {
    let bytes = reply_line.as_bytes();
    let mut s = 4.min(bytes.len());
    while s < bytes.len() {
        if bytes[s].is_ascii_digit() {
            let mut nums = [0u32; 6];
            let mut ok = true;
            for (i, slot) in nums.iter_mut().enumerate() {
                let mut n = 0u32;
                while s < bytes.len() && bytes[s].is_ascii_digit() {
                    n = n.saturating_mul(10).saturating_add(u32::from(bytes[s] - b'0'));
                    s += 1;
                }
                if n > 255 {
                    ok = false;
                    break;
                }
                *slot = n;
                if i == 5 {
                    break;
                }
                while s < bytes.len() && bytes[s] == b' ' {
                    s += 1;
                }
                if s < bytes.len() && bytes[s] == b',' {
                    s += 1;
                } else {
                    ok = false;
                    break;
                }
                while s < bytes.len() && bytes[s] == b' ' {
                    s += 1;
                }
                if s >= bytes.len() || !bytes[s].is_ascii_digit() {
                    ok = false;
                    break;
                }
            }
            if ok {
                let ip = Ipv4Addr::new(nums[0] as u8, nums[1] as u8, nums[2] as u8, nums[3] as u8);
                let port = ((nums[4] << 8) + nums[5]) as u16;
                return Some(SocketAddrV4::new(ip, port));
            }
        } else {
            s += 1;
        }
    }
    None
}

/// `PORT h1,h2,h3,h4,p1,p2` for an active-mode listener.
pub fn format_port_command(addr: SocketAddrV4) -> String {
    let o = addr.ip().octets();
    format!(
        "PORT {},{},{},{},{},{}",
        o[0],
        o[1],
        o[2],
        o[3],
        addr.port() >> 8,
        addr.port() & 0xff
    )
}

/// Some servers answer LIST of an empty directory with an error reply.
pub fn is_empty_dir_list_err_reply(reply_line: &str) -> bool {
    let text = match reply_line.get(4..) {
        Some(t) if !t.is_empty() => t.to_ascii_lowercase(),
        _ => return false,
    };
    text.starts_with("file not found") || text.starts_with("the specified directory is empty")
}

/// Quote a path argument the way servers expect (no quoting, CR/LF refused).
pub fn build_command(verb: &str, arg: Option<&str>) -> Option<String> {
    match arg {
        Some(a) if a.contains('\r') || a.contains('\n') => None,
        Some(a) => Some(format!("{} {}", verb, a)),
        None => Some(verb.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_line_reply() {
        let (r, used) = read_ftp_reply(b"220 Welcome\r\nextra").unwrap();
        assert_eq!(r.code, Some(220));
        assert_eq!(r.lines, vec!["220 Welcome"]);
        assert_eq!(used, 13);
    }

    #[test]
    fn test_multi_line_reply_waits_for_terminator() {
        let partial = b"230-Hello\r\n230-still\r\n";
        assert!(read_ftp_reply(partial).is_none());
        let full = b"230-Hello\r\n230-still\r\n 230 inner\r\n230 Done\r\n";
        let (r, used) = read_ftp_reply(full).unwrap();
        assert_eq!(r.code, Some(230));
        assert_eq!(r.lines.len(), 4);
        assert_eq!(used, full.len());
    }

    #[test]
    fn test_lf_only_line_ends() {
        let (r, used) = read_ftp_reply(b"200 ok\n").unwrap();
        assert_eq!(r.code, Some(200));
        assert_eq!(used, 7);
    }

    #[test]
    fn test_non_ftp_line() {
        let (r, _) = read_ftp_reply(b"hello there\r\n").unwrap();
        assert_eq!(r.code, None);
        assert_eq!(r.lines[0], "hello there");
        let long = vec![b'x'; MAX_NON_FTP_LINE + 5];
        let (r, used) = read_ftp_reply(&long).unwrap();
        assert_eq!(used, MAX_NON_FTP_LINE);
        assert_eq!(r.lines[0].len(), MAX_NON_FTP_LINE);
    }

    #[test]
    fn test_257_variants() {
        assert_eq!(
            parse_directory_from_257("257 \"/pub/a\"\"b\" is current").as_deref(),
            Some("/pub/a\"b")
        );
        assert_eq!(
            parse_directory_from_257("257 Current directory is \"mars:\"").as_deref(),
            Some("mars:")
        );
        assert_eq!(
            parse_directory_from_257("257 '/projects/a'g'f' ist das aktuelle Verzeichnis.").as_deref(),
            Some("/projects/a'g'f")
        );
        assert_eq!(parse_directory_from_257("257 no path"), None);
    }

    #[test]
    fn test_pasv_parsing() {
        let a = parse_pasv_reply("227 Entering Passive Mode (192,168,1,2,19,137)").unwrap();
        assert_eq!(a, "192.168.1.2:5001".parse().unwrap());
        let b = parse_pasv_reply("227 =10,0,0,1,4,1").unwrap();
        assert_eq!(b.port(), 1025);
        assert!(parse_pasv_reply("227 Entering Passive Mode (300,1,1,1,1,1)").is_none());
    }

    #[test]
    fn test_port_command() {
        let cmd = format_port_command("127.0.0.1:5001".parse().unwrap());
        assert_eq!(cmd, "PORT 127,0,0,1,19,137");
    }

    #[test]
    fn test_empty_dir_error_reply() {
        assert!(is_empty_dir_list_err_reply("550 File not found"));
        assert!(is_empty_dir_list_err_reply("550 The specified directory is empty"));
        assert!(!is_empty_dir_list_err_reply("550 Permission denied"));
    }

    #[test]
    fn test_password_hidden_in_log() {
        assert_eq!(loggable_command("PASS secret"), "PASS (hidden)");
        assert_eq!(loggable_command("USER bob"), "USER bob");
    }
}
