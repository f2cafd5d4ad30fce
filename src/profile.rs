//! A reader for the krb5 profile format used by `krb5.conf`.
//!
//! ```text
//! [libdefaults]
//!     default_realm = EXAMPLE.COM
//! [domain_realm]
//!     .example.com = EXAMPLE.COM
//! [appdefaults]
//!     pam-kafs-session = {
//!         create_pag = true
//!         EXAMPLE.COM = {
//!             shared_pag = yes
//!         }
//!     }
//! ```
//!
//! Only lookups are supported. Where a name repeats the first occurrence wins.

use crate::ccache::Krb5Context;
use crate::constants::PATH_KRB5_CONF;
use crate::error::KafsError;

use std::path::Path;
use std::str::FromStr;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Value(String),
    Group(Vec<Relation>),
}

type Relation = (String, Node);

#[derive(Debug, Clone, Default)]
pub struct Profile {
    sections: Vec<(String, Vec<Relation>)>,
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn attach(
    stack: &mut [(String, Vec<Relation>)],
    section: &mut Option<(String, Vec<Relation>)>,
    relation: Relation,
) {
    if let Some((_, relations)) = stack.last_mut() {
        relations.push(relation);
    } else if let Some((_, relations)) = section.as_mut() {
        relations.push(relation);
    } else {
        trace!(name = %relation.0, "relation outside of any section");
    }
}

fn lookup_in<'a>(relations: &'a [Relation], path: &[&str]) -> Option<&'a str> {
    let (first, rest) = path.split_first()?;
    relations
        .iter()
        .filter(|(name, _)| name == first)
        .find_map(|(_, node)| match node {
            Node::Value(v) if rest.is_empty() => Some(v.as_str()),
            Node::Group(g) if !rest.is_empty() => lookup_in(g, rest),
            _ => None,
        })
}

/// krb5 boolean spellings.
fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "y" | "yes" | "true" | "t" | "1" | "on" => Some(true),
        "n" | "no" | "false" | "nil" | "0" | "off" => Some(false),
        _ => None,
    }
}

impl FromStr for Profile {
    type Err = KafsError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut sections = Vec::new();
        let mut section: Option<(String, Vec<Relation>)> = None;
        let mut stack: Vec<(String, Vec<Relation>)> = Vec::new();

        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(header) = line.strip_prefix('[') {
                while let Some((name, relations)) = stack.pop() {
                    warn!(%name, "unterminated profile group");
                    attach(&mut stack, &mut section, (name, Node::Group(relations)));
                }
                sections.extend(section.take());
                let name = header.split(']').next().unwrap_or_default().trim();
                section = Some((name.to_string(), Vec::new()));
                continue;
            }

            if line.starts_with('}') {
                if let Some((name, relations)) = stack.pop() {
                    attach(&mut stack, &mut section, (name, Node::Group(relations)));
                }
                continue;
            }

            let Some((name, value)) = line.split_once('=') else {
                trace!(?line, "ignoring profile line");
                continue;
            };
            let name = name.trim().to_string();
            let value = value.trim();

            if value == "{" {
                stack.push((name, Vec::new()));
            } else {
                let value = unquote(value).to_string();
                attach(&mut stack, &mut section, (name, Node::Value(value)));
            }
        }

        while let Some((name, relations)) = stack.pop() {
            attach(&mut stack, &mut section, (name, Node::Group(relations)));
        }
        sections.extend(section);

        Ok(Profile { sections })
    }
}

impl Profile {
    /// Load the system profile: the first entry of `$KRB5_CONFIG`, else
    /// `/etc/krb5.conf`. A missing file is an empty profile.
    pub fn load() -> Result<Self, KafsError> {
        let path = std::env::var("KRB5_CONFIG")
            .ok()
            .and_then(|v| v.split(':').next().map(String::from))
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| PATH_KRB5_CONF.to_string());
        Self::from_file(Path::new(&path))
    }

    pub fn from_file(path: &Path) -> Result<Self, KafsError> {
        match std::fs::read_to_string(path) {
            Ok(text) => text.parse(),
            Err(io_err) if io_err.kind() == std::io::ErrorKind::NotFound => {
                debug!(?path, "no krb5 profile");
                Ok(Profile::default())
            }
            Err(io_err) => {
                warn!(?io_err, ?path, "Unable to read krb5 profile");
                Err(KafsError::IoError)
            }
        }
    }

    pub fn get(&self, path: &[&str]) -> Option<&str> {
        let (section, rest) = path.split_first()?;
        self.sections
            .iter()
            .filter(|(name, _)| name == section)
            .find_map(|(_, relations)| lookup_in(relations, rest))
    }

    /// Look up an application default, most specific first:
    /// `app/realm/option`, `app/option`, `realm/option`, `option`.
    pub fn appdefault_string(&self, app: &str, realm: Option<&str>, option: &str) -> Option<&str> {
        let mut paths: Vec<Vec<&str>> = Vec::with_capacity(4);
        if let Some(realm) = realm {
            paths.push(vec!["appdefaults", app, realm, option]);
        }
        paths.push(vec!["appdefaults", app, option]);
        if let Some(realm) = realm {
            paths.push(vec!["appdefaults", realm, option]);
        }
        paths.push(vec!["appdefaults", option]);

        paths.iter().find_map(|p| self.get(p))
    }

    pub fn appdefault_bool(
        &self,
        app: &str,
        realm: Option<&str>,
        option: &str,
        default: bool,
    ) -> bool {
        match self.appdefault_string(app, realm, option) {
            Some(v) => parse_bool(v).unwrap_or_else(|| {
                warn!(%option, value = %v, "not a boolean, using default");
                default
            }),
            None => default,
        }
    }

    pub fn appdefault_number<T: FromStr + Copy>(
        &self,
        app: &str,
        realm: Option<&str>,
        option: &str,
        default: T,
    ) -> T {
        match self.appdefault_string(app, realm, option) {
            Some(v) => v.parse().unwrap_or_else(|_| {
                warn!(%option, value = %v, "not a number, using default");
                default
            }),
            None => default,
        }
    }

    pub fn default_realm(&self) -> Option<&str> {
        self.get(&["libdefaults", "default_realm"])
    }
}

impl Krb5Context for Profile {
    /// `[domain_realm]` for the host, then for each parent domain written as
    /// `.example.com`. Failing that a dotted host maps to itself in upper case and an
    /// undotted one to the default realm.
    fn host_realm(&self, host: &str) -> Result<String, KafsError> {
        let host = host.trim_end_matches('.').to_ascii_lowercase();

        if let Some(realm) = self.get(&["domain_realm", &host]) {
            return Ok(realm.to_string());
        }

        let mut domain = host.as_str();
        while let Some(idx) = domain.find('.') {
            let parent = &domain[idx..];
            if let Some(realm) = self.get(&["domain_realm", parent]) {
                return Ok(realm.to_string());
            }
            domain = &domain[idx + 1..];
        }

        if host.contains('.') {
            return Ok(host.to_ascii_uppercase());
        }

        self.default_realm()
            .map(String::from)
            .ok_or(KafsError::NoRealm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KRB5_CONF: &str = r#"
# krb5.conf
[libdefaults]
    default_realm = EXAMPLE.COM
    dns_lookup_realm = false

[domain_realm]
    .example.com = EXAMPLE.COM
    special.example.com = SPECIAL.EXAMPLE.COM
    ; a comment
    .corp.org = "CORP.ORG"

[appdefaults]
    pam-kafs-session = {
        create_pag = yes
        minimum_uid = 500
        EXAMPLE.COM = {
            shared_pag = on
        }
    }
    OTHER.ORG = {
        shared_pag = nil
    }
    create_tokens = false
    verbosity = lots
"#;

    fn profile() -> Profile {
        KRB5_CONF.parse().expect("Unable to parse profile")
    }

    #[test]
    fn test_profile_get() {
        let p = profile();
        assert_eq!(p.default_realm(), Some("EXAMPLE.COM"));
        assert_eq!(p.get(&["libdefaults", "dns_lookup_realm"]), Some("false"));
        assert_eq!(p.get(&["domain_realm", ".corp.org"]), Some("CORP.ORG"));
        assert_eq!(p.get(&["libdefaults", "missing"]), None);
        // A group is not a value.
        assert_eq!(p.get(&["appdefaults", "pam-kafs-session"]), None);
    }

    #[test]
    fn test_appdefault_order() {
        let p = profile();
        let app = "pam-kafs-session";

        assert!(p.appdefault_bool(app, Some("EXAMPLE.COM"), "shared_pag", false));
        assert!(!p.appdefault_bool(app, Some("OTHER.ORG"), "shared_pag", true));
        assert!(!p.appdefault_bool(app, None, "shared_pag", false));
        assert!(p.appdefault_bool(app, None, "create_pag", false));
        assert!(!p.appdefault_bool(app, Some("EXAMPLE.COM"), "create_tokens", true));
        assert_eq!(p.appdefault_number(app, None, "minimum_uid", 1000u32), 500);
        // Unparseable values fall back to the default.
        assert_eq!(p.appdefault_number(app, None, "verbosity", 0u32), 0);
    }

    #[test]
    fn test_host_realm() -> Result<(), KafsError> {
        let p = profile();
        assert_eq!(p.host_realm("example.com")?, "EXAMPLE.COM");
        assert_eq!(p.host_realm("afs.example.com")?, "EXAMPLE.COM");
        assert_eq!(p.host_realm("special.example.com")?, "SPECIAL.EXAMPLE.COM");
        assert_eq!(p.host_realm("a.b.corp.org")?, "CORP.ORG");
        assert_eq!(p.host_realm("Grand.Central.Org")?, "GRAND.CENTRAL.ORG");
        assert_eq!(p.host_realm("localcell")?, "EXAMPLE.COM");

        let empty = Profile::default();
        assert!(matches!(empty.host_realm("localcell"), Err(KafsError::NoRealm)));
        Ok(())
    }

    #[test]
    fn test_missing_profile_is_empty() -> Result<(), KafsError> {
        let dir = tempfile::tempdir().expect("Unable to create tempdir");
        let p = Profile::from_file(&dir.path().join("krb5.conf"))?;
        assert_eq!(p.default_realm(), None);
        Ok(())
    }
}
