//! Picks a server type for a listing from a server of unknown type.

use std::sync::Arc;

use chrono::NaiveDate;

use super::{decode_listing, CompiledServerType, ParsedListing};

/// Server type that parsed a listing without skipping a line.
#[derive(Debug, Clone)]
pub struct Detection {
    pub server_type: Arc<CompiledServerType>,
    pub listing: ParsedListing,
}

/// Tries the types whose condition holds for `welcome`/`syst` first, then
/// all remaining types, both in list order. The first type that parses every
/// line wins; `None` leaves the listing unparsed.
pub fn autodetect(
    types: &[Arc<CompiledServerType>],
    welcome: &str,
    syst: &str,
    raw: &[u8],
    incomplete: bool,
    today: NaiveDate,
) -> Option<Detection> {
    let text = decode_listing(raw);
    let (preferred, rest): (Vec<_>, Vec<_>) = types
        .iter()
        .partition(|t| t.condition_holds(welcome, syst));
    for ty in preferred.into_iter().chain(rest) {
        let listing = ty.parse_chars(&text, incomplete, today);
        if listing.skipped_lines == 0 {
            log::debug!(
                "listing autodetected as '{}' ({} entries)",
                ty.name(),
                listing.entries.len()
            );
            return Some(Detection {
                server_type: Arc::clone(ty),
                listing,
            });
        }
        log::trace!(
            "server type '{}' skipped {} lines",
            ty.name(),
            listing.skipped_lines
        );
    }
    log::debug!("no server type parses the listing");
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::parser::ServerTypeList;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 15).unwrap()
    }

    #[test]
    fn detects_unix_from_syst() {
        let list = ServerTypeList::with_builtins().unwrap();
        let raw = b"-rw-r--r--   1 ftp      ftp           512 Jan 10 10:00 a.txt\r\n";
        let found = autodetect(&list.all(), "220 ready", "215 UNIX Type: L8", raw, false, today())
            .unwrap();
        assert_eq!(found.server_type.name(), "UNIX");
        assert_eq!(found.listing.entries.len(), 1);
    }

    #[test]
    fn falls_back_to_unconditioned_types() {
        let list = ServerTypeList::with_builtins().unwrap();
        // Windows_NT rules out the UNIX and Netware conditions
        let raw = b"06-14-24  01:05PM       <DIR>          docs\r\n";
        let found =
            autodetect(&list.all(), "220 Microsoft FTP Service", "215 Windows_NT", raw, false, today())
                .unwrap();
        assert_eq!(found.server_type.name(), "Microsoft IIS");
    }

    #[test]
    fn unparsable_listing_stays_raw() {
        let list = ServerTypeList::with_builtins().unwrap();
        let raw = b"@@@ this is not a listing @@@\r\n";
        assert!(autodetect(&list.all(), "", "", raw, false, today()).is_none());
    }
}
