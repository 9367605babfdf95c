//! Version strings such as `2.5`, `2.52 beta 2c` or `3.0 beta 1 (PB 75 x86)`.
//!
//! The packed number holds the release part times 1000 in the high word and
//! the beta part times 100 in the low word, so `2.52 beta 2` is
//! `2520 << 16 | 200`. A trailing letter on the beta number counts as a
//! decimal: `2c` is `2.3`.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Special-build markers recognised inside parentheses.
const SPECIAL_BUILDS: [&str; 4] = ["ib", "db", "pb", "cb"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResolvedVersion {
    pub packed: u32,
    pub beta: bool,
    /// 0 for a regular build, otherwise the IB/DB/PB/CB number (never 0).
    pub special_build: u32,
}

impl ResolvedVersion {
    pub fn parse(text: &str) -> Self {
        let mut text = text.to_lowercase();
        let mut special_build = 0;

        if let Some(open) = text.find('(') {
            let after = &text[open + 1..];
            if SPECIAL_BUILDS.iter().any(|m| after.starts_with(m)) {
                let num = after[2..].strip_prefix(' ').unwrap_or(&after[2..]);
                special_build = num
                    .chars()
                    .take_while(char::is_ascii_digit)
                    .fold(0u32, |n, c| n.wrapping_mul(10).wrapping_add(c as u32 - '0' as u32));
                if special_build == 0 {
                    special_build = 1;
                }
                let cut = if text[..open].ends_with(' ') { open - 1 } else { open };
                text.truncate(cut);
            }
        }

        let (left, right, beta) = match text.find("beta") {
            Some(i) => {
                let left = text[..i].trim_end().to_string();
                let mut right = text[i + 4..].trim_start_matches(' ').to_string();
                if let Some(last) = right.chars().last().filter(char::is_ascii_lowercase) {
                    right.pop();
                    right.push_str(&format!(".{}", last as u32 - 'a' as u32 + 1));
                }
                (left, right, true)
            }
            None => (text.clone(), String::new(), false),
        };

        let mut packed = ((leading_float(&left) * 1000.0 + 0.5) as u16 as u32) << 16;
        if !right.is_empty() {
            packed |= (leading_float(&right) * 100.0 + 0.5) as u16 as u32;
        }
        Self {
            packed,
            beta,
            special_build,
        }
    }

    /// Release part only (beta number cleared).
    pub fn release_part(&self) -> u32 {
        self.packed & 0xffff_0000
    }

    pub fn is_special_build(&self) -> bool {
        self.special_build != 0
    }

    /// Order of two builds with the same beta flag: version first; at equal
    /// versions a special build precedes the final build, and between
    /// special builds the higher number is newer.
    pub fn cmp_same_channel(&self, other: &Self) -> Ordering {
        self.packed.cmp(&other.packed).then_with(|| {
            match (self.special_build, other.special_build) {
                (0, 0) => Ordering::Equal,
                (0, _) => Ordering::Greater,
                (_, 0) => Ordering::Less,
                (a, b) => a.cmp(&b),
            }
        })
    }
}

/// Whether a version string names a preview build, e.g. `2.53 beta 1 (PB 38)`.
pub fn is_preview_build(text: &str) -> bool {
    text.to_lowercase().contains(" (pb")
}

/// Numeric prefix of `s` the way C `atof` reads it; 0 when there is none.
fn leading_float(s: &str) -> f64 {
    let s = s.trim_start();
    let mut end = 0;
    let mut seen_dot = false;
    for (i, c) in s.char_indices() {
        match c {
            '0'..='9' => end = i + 1,
            '.' if !seen_dot => seen_dot = true,
            '+' | '-' if i == 0 => {}
            _ => break,
        }
    }
    s[..end].parse().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release() {
        let v = ResolvedVersion::parse("2.5");
        assert_eq!(v.packed, 2500 << 16);
        assert!(!v.beta);
        assert_eq!(v.special_build, 0);
    }

    #[test]
    fn beta_with_letter() {
        assert_eq!(ResolvedVersion::parse("2.52 beta 2").packed, 2520 << 16 | 200);
        assert_eq!(ResolvedVersion::parse("2.52 Beta 2c").packed, 2520 << 16 | 230);
        assert!(ResolvedVersion::parse("2.52 beta 2").beta);
    }

    #[test]
    fn special_builds() {
        let v = ResolvedVersion::parse("3.0 beta 1 (PB75 x86)");
        assert_eq!(v.special_build, 75);
        assert_eq!(v.packed, 3000 << 16 | 100);
        assert_eq!(ResolvedVersion::parse("2.53 beta 1 (PB 38)").special_build, 38);
        assert_eq!(ResolvedVersion::parse("4.0 (IB)").special_build, 1);
        assert_eq!(ResolvedVersion::parse("4.0 (x64)").special_build, 0);
    }

    #[test]
    fn ordering_at_equal_versions() {
        let fin = ResolvedVersion::parse("4.0");
        let pb1 = ResolvedVersion::parse("4.0 (PB 1)");
        let pb2 = ResolvedVersion::parse("4.0 (PB 2)");
        assert_eq!(pb1.cmp_same_channel(&fin), Ordering::Less);
        assert_eq!(pb1.cmp_same_channel(&pb2), Ordering::Less);
        assert_eq!(fin.cmp_same_channel(&fin), Ordering::Equal);
        assert_eq!(ResolvedVersion::parse("4.1 (PB 1)").cmp_same_channel(&fin), Ordering::Greater);
    }

    #[test]
    fn preview_detection() {
        assert!(is_preview_build("2.53 beta 1 (PB 38)"));
        assert!(!is_preview_build("2.53 beta 1"));
    }

    #[test]
    fn atof_prefix() {
        assert_eq!(leading_float("2.5 x"), 2.5);
        assert_eq!(leading_float(""), 0.0);
        assert_eq!(leading_float("abc"), 0.0);
    }
}
