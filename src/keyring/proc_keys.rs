//! Parsing of the kernel's textual key listing.
//!
//! Each line of `/proc/keys` is
//! `serial flags usage timeout perms uid gid type description: summary`, with the
//! serial in hex. Only keys the caller may view are listed.

use std::collections::BTreeMap;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcKey {
    /// Time to expiry as the kernel renders it: `perm`, `expd`, or a short
    /// duration such as `9h` or `2d`.
    pub expiry: String,
    pub key_type: String,
    pub description: String,
}

/// Index the listing by key serial. Lines that do not have all nine leading
/// columns are ignored.
pub fn parse(text: &str) -> BTreeMap<i32, ProcKey> {
    let mut keys = BTreeMap::new();

    for line in text.lines() {
        let mut cols = line.split_whitespace();

        let Some(serial) = cols.next() else {
            continue;
        };
        let Ok(serial) = u32::from_str_radix(serial, 16) else {
            trace!(?line, "skipping unparseable /proc/keys line");
            continue;
        };

        // flags, usage
        let mut cols = cols.skip(2);
        let Some(expiry) = cols.next() else {
            continue;
        };
        // perms, uid, gid
        let mut cols = cols.skip(3);
        let (Some(key_type), Some(description)) = (cols.next(), cols.next()) else {
            continue;
        };

        let description = description.strip_suffix(':').unwrap_or(description);

        keys.insert(
            serial as i32,
            ProcKey {
                expiry: expiry.to_string(),
                key_type: key_type.to_string(),
                description: description.to_string(),
            },
        );
    }

    keys
}
