//! Kerberos credential caches.
//!
//! Tokens are made from service tickets that something else (kinit, sssd, a PAM
//! auth module) already put into the user's credential cache. This module reads
//! those caches and can copy one into another backend. It never talks to a KDC.

mod cc_file;
mod cc_keyring;

use crate::constants::KRB5CCNAME;
use crate::error::KafsError;
use crate::token::ServiceTicket;

use binrw::{binread, binwrite};
use rand::{distr::Alphanumeric, Rng};
use std::env;
use std::fmt;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, instrument};
use uzers::get_current_uid;

/// Realm of the pseudo principals MIT uses to keep configuration in a cache.
const CACHE_CONF_REALM: &str = "X-CACHECONF:";

const NT_PRINCIPAL: u32 = 1;
const NT_SRV_INST: u32 = 2;

#[binwrite]
#[bw(big)]
#[binread]
#[derive(Debug, Clone)]
struct DataComponent {
    #[bw(try_calc(u32::try_from(value.len())))]
    value_len: u32,
    #[br(count = value_len)]
    value: Vec<u8>,
}

impl DataComponent {
    fn lossy(&self) -> String {
        String::from_utf8_lossy(self.value.as_slice()).to_string()
    }
}

impl From<&str> for DataComponent {
    fn from(s: &str) -> Self {
        DataComponent {
            value: s.as_bytes().to_vec(),
        }
    }
}

#[binwrite]
#[bw(big)]
#[binread]
#[derive(Debug, Clone)]
pub(crate) struct PrincipalV4 {
    name_type: u32,
    #[bw(try_calc(u32::try_from(components.len())))]
    components_count: u32,
    realm: DataComponent,
    #[br(count = components_count)]
    components: Vec<DataComponent>,
}

#[binwrite]
#[bw(big)]
#[binread]
#[derive(Debug, Clone)]
struct KeyBlockV4 {
    enc_type: u16,
    data: DataComponent,
}

#[binwrite]
#[bw(big)]
#[binread]
#[derive(Debug, Clone)]
struct Address {
    addr_type: u16,
    data: DataComponent,
}

#[binwrite]
#[bw(big)]
#[binread]
#[derive(Debug, Clone)]
struct Addresses {
    #[bw(try_calc(u32::try_from(addresses.len())))]
    count: u32,
    #[br(count = count)]
    addresses: Vec<Address>,
}

#[binwrite]
#[bw(big)]
#[binread]
#[derive(Debug, Clone)]
struct AuthDataComponent {
    ad_type: u16,
    data: DataComponent,
}

#[binwrite]
#[bw(big)]
#[binread]
#[derive(Debug, Clone)]
struct AuthData {
    #[bw(try_calc(u32::try_from(auth_data.len())))]
    count: u32,
    #[br(count = count)]
    auth_data: Vec<AuthDataComponent>,
}

/// One credential as stored by both the FILE and KEYRING caches.
#[binwrite]
#[bw(big)]
#[binread]
#[derive(Debug, Clone)]
pub(crate) struct CredentialV4 {
    client: PrincipalV4,
    server: PrincipalV4,
    keyblock: KeyBlockV4,
    authtime: u32,
    starttime: u32,
    endtime: u32,
    renew_till: u32,
    is_skey: u8,
    ticket_flags: u32,
    addresses: Addresses,
    authdata: AuthData,
    ticket: DataComponent,
    second_ticket: DataComponent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalName {
    pub name_type: u32,
    pub components: Vec<String>,
    pub realm: String,
}

impl PrincipalName {
    pub fn user(name: &str, realm: &str) -> Self {
        PrincipalName {
            name_type: NT_PRINCIPAL,
            components: vec![name.to_string()],
            realm: realm.to_string(),
        }
    }

    /// `service/instance@realm`
    pub fn service(service: &str, instance: &str, realm: &str) -> Self {
        PrincipalName {
            name_type: NT_SRV_INST,
            components: vec![service.to_string(), instance.to_string()],
            realm: realm.to_string(),
        }
    }

    /// Principal comparison ignores the name type.
    pub fn same_name(&self, other: &PrincipalName) -> bool {
        self.components == other.components && self.realm == other.realm
    }
}

impl fmt::Display for PrincipalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.components.join("/"), self.realm)
    }
}

impl From<&PrincipalName> for PrincipalV4 {
    fn from(name: &PrincipalName) -> Self {
        PrincipalV4 {
            name_type: name.name_type,
            realm: name.realm.as_str().into(),
            components: name.components.iter().map(|c| c.as_str().into()).collect(),
        }
    }
}

impl From<&PrincipalV4> for PrincipalName {
    fn from(p: &PrincipalV4) -> Self {
        PrincipalName {
            name_type: p.name_type,
            components: p.components.iter().map(DataComponent::lossy).collect(),
            realm: p.realm.lossy(),
        }
    }
}

/// A credential read from, or to be stored in, a cache.
#[derive(Debug, Clone)]
pub struct Credential {
    inner: CredentialV4,
}

impl From<CredentialV4> for Credential {
    fn from(inner: CredentialV4) -> Self {
        Credential { inner }
    }
}

impl Credential {
    pub fn new(
        client: &PrincipalName,
        server: &PrincipalName,
        enctype: i32,
        session_key: &[u8],
        end_time: u32,
        ticket: &[u8],
    ) -> Result<Self, KafsError> {
        let enc_type = u16::try_from(enctype).map_err(|_| {
            error!(?enctype, "enctype does not fit a cache keyblock");
            KafsError::UnsupportedEncryption
        })?;
        Ok(Credential {
            inner: CredentialV4 {
                client: client.into(),
                server: server.into(),
                keyblock: KeyBlockV4 {
                    enc_type,
                    data: DataComponent {
                        value: session_key.to_vec(),
                    },
                },
                authtime: 0,
                starttime: 0,
                endtime: end_time,
                renew_till: 0,
                is_skey: 0,
                ticket_flags: 0,
                addresses: Addresses { addresses: vec![] },
                authdata: AuthData { auth_data: vec![] },
                ticket: DataComponent {
                    value: ticket.to_vec(),
                },
                second_ticket: DataComponent { value: vec![] },
            },
        })
    }

    pub(crate) fn as_v4(&self) -> &CredentialV4 {
        &self.inner
    }

    pub fn client(&self) -> PrincipalName {
        (&self.inner.client).into()
    }

    pub fn server(&self) -> PrincipalName {
        (&self.inner.server).into()
    }

    /// MIT keeps cache settings as fake credentials for `X-CACHECONF:` principals.
    pub fn is_config_entry(&self) -> bool {
        self.inner.server.realm.value == CACHE_CONF_REALM.as_bytes()
    }

    pub fn end_time(&self) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(self.inner.endtime as u64)
    }

    pub fn to_service_ticket(&self) -> ServiceTicket {
        ServiceTicket {
            enctype: self.inner.keyblock.enc_type as i32,
            session_key: self.inner.keyblock.data.value.clone(),
            end_time: self.end_time(),
            ticket: self.inner.ticket.value.clone(),
        }
    }
}

pub trait CredentialCache {
    /// The full cache name, including the type prefix.
    fn name(&self) -> String;

    /// The default principal of the cache.
    fn principal(&self) -> Result<PrincipalName, KafsError>;

    fn credentials(&self) -> Result<Vec<Credential>, KafsError>;

    /// Empty the cache and make `principal` its default principal.
    fn init(&mut self, principal: &PrincipalName) -> Result<(), KafsError>;

    fn store(&mut self, credential: &Credential) -> Result<(), KafsError>;

    /// The cached ticket for `server` that lasts the longest.
    fn service_ticket(&self, server: &PrincipalName) -> Result<ServiceTicket, KafsError> {
        self.credentials()?
            .into_iter()
            .filter(|c| !c.is_config_entry() && c.server().same_name(server))
            .max_by_key(|c| c.inner.endtime)
            .map(|c| c.to_service_ticket())
            .ok_or_else(|| {
                debug!(%server, cache = %self.name(), "no ticket in cache");
                KafsError::TicketNotFound
            })
    }
}

/// The parts of a Kerberos library the tools depend on.
pub trait Krb5Context {
    /// The realm that holds the service principals of `host`.
    fn host_realm(&self, host: &str) -> Result<String, KafsError>;

    fn resolve_cache(&self, name: &str) -> Result<Box<dyn CredentialCache>, KafsError> {
        resolve(name)
    }

    fn default_cache(&self) -> Result<Box<dyn CredentialCache>, KafsError> {
        self.resolve_cache(&default_cache_name())
    }
}

/// `$KRB5CCNAME`, else the traditional per-uid file.
pub fn default_cache_name() -> String {
    match env::var(KRB5CCNAME) {
        Ok(val) if !val.is_empty() => val,
        _ => format!("FILE:/tmp/krb5cc_{}", get_current_uid()),
    }
}

pub fn resolve(ccache_name: &str) -> Result<Box<dyn CredentialCache>, KafsError> {
    let uid = get_current_uid().to_string();
    let ccache_name = ccache_name.replace("%{uid}", uid.as_str());

    if ccache_name.starts_with('/') {
        return cc_file::resolve(&ccache_name);
    }

    match ccache_name.split_once(':').map(|(kind, _)| kind) {
        Some("FILE") | None => cc_file::resolve(&ccache_name),
        Some("KEYRING") => cc_keyring::resolve(&ccache_name),
        Some(kind) => {
            error!(%kind, "unsupported credential cache type");
            Err(KafsError::UnsupportedCredentialCacheType)
        }
    }
}

fn random_suffix() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(7)
        .map(char::from)
        .collect()
}

/// Copy `source` into a new cache of `target_type` owned by `uid` and return the new
/// cache's name. A cache that already has the requested type is left where it is.
#[instrument(level = "debug", skip(ctx, source))]
pub fn convert<C: Krb5Context + ?Sized>(
    ctx: &C,
    source: &dyn CredentialCache,
    target_type: &str,
    uid: u32,
) -> Result<String, KafsError> {
    let target_type = target_type.to_ascii_uppercase();
    let target_name = match target_type.as_str() {
        "FILE" => format!("FILE:/tmp/krb5cc_{uid}_{}", random_suffix()),
        "KEYRING" => format!("KEYRING:session:{uid}"),
        _ => {
            error!(%target_type, "cannot convert to this credential cache type");
            return Err(KafsError::UnsupportedCredentialCacheType);
        }
    };

    let source_name = source.name();
    if source_name.starts_with(&format!("{target_type}:")) {
        debug!(%source_name, "credential cache already has the requested type");
        return Ok(source_name);
    }

    let principal = source.principal()?;
    let credentials = source.credentials()?;

    let mut target = ctx.resolve_cache(&target_name)?;
    target.init(&principal)?;
    for credential in credentials.iter() {
        target.store(credential)?;
    }

    info!(from = %source_name, to = %target.name(), "converted credential cache");
    Ok(target.name())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryCache, MemoryKrb5};

    fn afs_ticket(cell: &str, end: u32, ticket: &[u8]) -> Credential {
        Credential::new(
            &PrincipalName::user("testuser", "EXAMPLE.COM"),
            &PrincipalName::service("afs", cell, "EXAMPLE.COM"),
            18,
            &[0x11; 32],
            end,
            ticket,
        )
        .expect("Unable to build credential")
    }

    #[test]
    fn test_principal_display() {
        let p = PrincipalName::service("afs", "example.com", "EXAMPLE.COM");
        assert_eq!(p.to_string(), "afs/example.com@EXAMPLE.COM");
        let p = PrincipalName::user("testuser", "EXAMPLE.COM");
        assert_eq!(p.to_string(), "testuser@EXAMPLE.COM");
    }

    #[test]
    fn test_service_ticket_picks_longest() -> Result<(), KafsError> {
        let mut cache = MemoryCache::new("MEMORY:test");
        cache.init(&PrincipalName::user("testuser", "EXAMPLE.COM"))?;
        cache.store(&afs_ticket("example.com", 100, b"old"))?;
        cache.store(&afs_ticket("example.com", 200, b"new"))?;
        cache.store(&afs_ticket("other.org", 300, b"other"))?;

        let server = PrincipalName::service("afs", "example.com", "EXAMPLE.COM");
        let ticket = cache.service_ticket(&server)?;
        assert_eq!(ticket.ticket, b"new");
        assert_eq!(ticket.enctype, 18);

        let server = PrincipalName::service("afs", "missing.net", "EXAMPLE.COM");
        assert!(matches!(
            cache.service_ticket(&server),
            Err(KafsError::TicketNotFound)
        ));
        Ok(())
    }

    #[test]
    fn test_resolve_unsupported() {
        assert!(matches!(
            resolve("KCM:1000"),
            Err(KafsError::UnsupportedCredentialCacheType)
        ));
        assert!(matches!(
            resolve("MEMORY:foo"),
            Err(KafsError::UnsupportedCredentialCacheType)
        ));
    }

    #[test]
    fn test_resolve_file_names() -> Result<(), KafsError> {
        assert_eq!(resolve("FILE:/tmp/krb5cc_x")?.name(), "FILE:/tmp/krb5cc_x");
        assert_eq!(resolve("/tmp/krb5cc_y")?.name(), "FILE:/tmp/krb5cc_y");
        let expect = format!("FILE:/tmp/krb5cc_{}", get_current_uid());
        assert_eq!(resolve("FILE:/tmp/krb5cc_%{uid}")?.name(), expect);
        Ok(())
    }

    #[test]
    fn test_convert_copies_everything() -> Result<(), KafsError> {
        let ctx = MemoryKrb5::default();
        let mut source = MemoryCache::new("FILE:/tmp/krb5cc_1000");
        source.init(&PrincipalName::user("testuser", "EXAMPLE.COM"))?;
        source.store(&afs_ticket("example.com", 100, b"ticket"))?;

        let name = convert(&ctx, &source, "keyring", 1000)?;
        assert_eq!(name, "KEYRING:session:1000");

        let target = ctx.resolve_cache(&name)?;
        assert_eq!(
            target.principal()?,
            PrincipalName::user("testuser", "EXAMPLE.COM")
        );
        assert_eq!(target.credentials()?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_convert_same_type_is_noop() -> Result<(), KafsError> {
        let ctx = MemoryKrb5::default();
        let source = MemoryCache::new("KEYRING:session:1000");
        let name = convert(&ctx, &source, "KEYRING", 1000)?;
        assert_eq!(name, "KEYRING:session:1000");
        Ok(())
    }

    #[test]
    fn test_convert_to_kcm_is_unsupported() {
        let ctx = MemoryKrb5::default();
        let source = MemoryCache::new("FILE:/tmp/krb5cc_1000");
        assert!(matches!(
            convert(&ctx, &source, "KCM", 1000),
            Err(KafsError::UnsupportedCredentialCacheType)
        ));
    }
}
