//! Legacy password scrambling.
//!
//! Not encryption: anyone with this code can reverse it. It only keeps
//! passwords from being readable at a glance in the config files.
//!
//! Layout before substitution: random padding (no digits, no zero bytes),
//! the password length as three digits (units, tens, hundreds), then the
//! password. The padding brings the total length to a multiple of 17. Each
//! byte is then replaced through [`SCRAMBLE_TABLE`] indexed by a running sum.

use super::error::{CredentialError, CredentialResult};
use rand::Rng;
use zeroize::Zeroizing;

/// Longest password the three length digits can describe.
pub const MAX_PASSWORD_LEN: usize = 999;

const BLOCK: usize = 17;
const SEED: u32 = 31;

#[rustfmt::skip]
static SCRAMBLE_TABLE: [u8; 256] = [
    0, 223, 235, 233, 240, 185, 88, 102, 22, 130, 27, 53, 79, 125, 66, 201,
    90, 71, 51, 60, 134, 104, 172, 244, 139, 84, 91, 12, 123, 155, 237, 151,
    192, 6, 87, 32, 211, 38, 149, 75, 164, 145, 52, 200, 224, 226, 156, 50,
    136, 190, 232, 63, 129, 209, 181, 120, 28, 99, 168, 94, 198, 40, 238, 112,
    55, 217, 124, 62, 227, 30, 36, 242, 208, 138, 174, 231, 26, 54, 214, 148,
    37, 157, 19, 137, 187, 111, 228, 39, 110, 17, 197, 229, 118, 246, 153, 80,
    21, 128, 69, 117, 234, 35, 58, 67, 92, 7, 132, 189, 5, 103, 10, 15,
    252, 195, 70, 147, 241, 202, 107, 49, 20, 251, 133, 76, 204, 73, 203, 135,
    184, 78, 194, 183, 1, 121, 109, 11, 143, 144, 171, 161, 48, 205, 245, 46,
    31, 72, 169, 131, 239, 160, 25, 207, 218, 146, 43, 140, 127, 255, 81, 98,
    42, 115, 173, 142, 114, 13, 2, 219, 57, 56, 24, 126, 3, 230, 47, 215,
    9, 44, 159, 33, 249, 18, 93, 95, 29, 113, 220, 89, 97, 182, 248, 64,
    68, 34, 4, 82, 74, 196, 213, 165, 179, 250, 108, 254, 59, 14, 236, 175,
    85, 199, 83, 106, 77, 178, 167, 225, 45, 247, 163, 158, 8, 221, 61, 191,
    119, 16, 253, 105, 186, 23, 170, 100, 216, 65, 162, 122, 150, 176, 154, 193,
    206, 222, 188, 152, 210, 243, 96, 41, 86, 180, 101, 177, 166, 141, 212, 116,
];

fn unscramble_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    for (i, &v) in SCRAMBLE_TABLE.iter().enumerate() {
        table[v as usize] = i as u8;
    }
    table
}

/// Scramble `password` (UTF-8 bytes, no NUL characters).
pub fn scramble_password(password: &str) -> CredentialResult<Vec<u8>> {
    let bytes = password.as_bytes();
    if bytes.len() > MAX_PASSWORD_LEN {
        return Err(CredentialError::InvalidPassword(format!(
            "longer than {} bytes",
            MAX_PASSWORD_LEN
        )));
    }
    if bytes.contains(&0) {
        return Err(CredentialError::InvalidPassword("contains a NUL character".into()));
    }
    let len = bytes.len();
    let padding = ((len + 3) / BLOCK) * BLOCK + BLOCK - 3 - len;

    let mut plain = Zeroizing::new(Vec::with_capacity(padding + 3 + len));
    let mut rng = rand::thread_rng();
    for _ in 0..padding {
        let pad = loop {
            let b: u8 = rng.gen_range(1..=255);
            if !b.is_ascii_digit() {
                break b;
            }
        };
        plain.push(pad);
    }
    plain.push(b'0' + (len % 10) as u8);
    plain.push(b'0' + (len / 10 % 10) as u8);
    plain.push(b'0' + (len / 100 % 10) as u8);
    plain.extend_from_slice(bytes);

    let mut last = SEED;
    Ok(plain
        .iter()
        .map(|&b| {
            last = (last + b as u32) % 255 + 1;
            SCRAMBLE_TABLE[last as usize]
        })
        .collect())
}

/// Reverse [`scramble_password`].
pub fn unscramble_password(scrambled: &[u8]) -> CredentialResult<String> {
    let table = unscramble_table();
    let mut last = SEED as i32;
    let mut plain = Zeroizing::new(Vec::with_capacity(scrambled.len()));
    for &s in scrambled {
        let mut x = table[s as usize] as i32 - 1 - (last % 255);
        if x <= 0 {
            x += 255;
        }
        plain.push(x as u8);
        last = (last + x) % 255 + 1;
    }

    let corrupt = || CredentialError::Corrupt("scrambled password has a bad layout".into());
    let digits = plain.iter().position(|b| b.is_ascii_digit()).ok_or_else(corrupt)?;
    let len_digits = plain.get(digits..digits + 3).ok_or_else(corrupt)?;
    if !len_digits.iter().all(u8::is_ascii_digit) {
        return Err(corrupt());
    }
    let len = (len_digits[0] - b'0') as usize
        + 10 * (len_digits[1] - b'0') as usize
        + 100 * (len_digits[2] - b'0') as usize;
    let total = ((len + 3) / BLOCK) * BLOCK + BLOCK;
    if total != plain.len() || total - digits - 3 != len {
        return Err(corrupt());
    }
    String::from_utf8(plain[plain.len() - len..].to_vec())
        .map_err(|_| CredentialError::Corrupt("scrambled password is not UTF-8".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_a_permutation() {
        let mut seen = [false; 256];
        for &v in SCRAMBLE_TABLE.iter() {
            assert!(!seen[v as usize]);
            seen[v as usize] = true;
        }
    }

    #[test]
    fn scramble_and_back() {
        for pw in ["", "a", "secret", "pässwörd with spaces", &"x".repeat(40)] {
            let s = scramble_password(pw).unwrap();
            assert_eq!(s.len() % BLOCK, 0);
            assert!(!s.contains(&0));
            assert_eq!(unscramble_password(&s).unwrap(), pw);
        }
    }

    #[test]
    fn padding_is_random() {
        let a = scramble_password("same").unwrap();
        let b = scramble_password("same").unwrap();
        assert_eq!(a.len(), b.len());
        assert_eq!(unscramble_password(&a).unwrap(), unscramble_password(&b).unwrap());
    }

    #[test]
    fn length_limits() {
        assert!(scramble_password(&"y".repeat(MAX_PASSWORD_LEN + 1)).is_err());
        assert!(scramble_password("a\0b").is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(unscramble_password(b"short").is_err());
        let mut s = scramble_password("secret").unwrap();
        s.pop();
        assert!(unscramble_password(&s).is_err());
    }
}
