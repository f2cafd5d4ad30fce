//! In-memory stand-ins for the kernel keyring, the process credentials, the PAM
//! handle and the Kerberos library.

use crate::ccache::{Credential, CredentialCache, Krb5Context, PrincipalName};
use crate::error::KafsError;
use crate::identity::{Credentials, TargetUser};
use crate::keyring::{KeyEntry, KeySerial, KeyStore};
use crate::session::{Marker, PamContext};

use errno::Errno;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::rc::Rc;

#[derive(Debug, Clone)]
struct MemoryKey {
    serial: KeySerial,
    key_type: String,
    description: String,
    payload: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
struct MemoryRing {
    serial: KeySerial,
    name: String,
    keys: Vec<MemoryKey>,
    shared: bool,
    user_linked: bool,
    revoked: bool,
}

/// Session keyrings by name. Joining one makes it current, as the kernel does for
/// the calling process. Only keyrings opened up with `share_session` can be joined
/// again, joining any other name always makes a fresh keyring.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    rings: Vec<MemoryRing>,
    current: Option<usize>,
    next_serial: KeySerial,
    pub fail_invalidate: bool,
    pub fail_share: bool,
    pub fail_link: bool,
    /// Number of rxrpc keys added, replacements included.
    pub rxrpc_adds: usize,
}

impl MemoryKeyStore {
    fn alloc_serial(&mut self) -> KeySerial {
        self.next_serial += 1;
        0x1000 + self.next_serial
    }

    /// The current session keyring, making an anonymous one like the kernel does
    /// for a process without a session keyring.
    fn session_index(&mut self) -> usize {
        if let Some(idx) = self.current {
            return idx;
        }
        let serial = self.alloc_serial();
        self.rings.push(MemoryRing {
            serial,
            name: "_ses".to_string(),
            ..MemoryRing::default()
        });
        let idx = self.rings.len() - 1;
        self.current = Some(idx);
        idx
    }

    fn session(&self) -> Option<&MemoryRing> {
        self.current.and_then(|idx| self.rings.get(idx))
    }

    fn add_key(&mut self, key_type: &str, description: &str, payload: &[u8]) -> KeySerial {
        let idx = self.session_index();
        if let Some(key) = self.rings[idx]
            .keys
            .iter_mut()
            .find(|k| k.key_type == key_type && k.description == description)
        {
            key.payload = payload.to_vec();
            return key.serial;
        }

        let serial = self.alloc_serial();
        self.rings[idx].keys.push(MemoryKey {
            serial,
            key_type: key_type.to_string(),
            description: description.to_string(),
            payload: payload.to_vec(),
        });
        serial
    }

    pub fn add_foreign_key(&mut self, key_type: &str, description: &str) {
        self.add_key(key_type, description, b"");
    }

    pub fn payload_of(&self, description: &str) -> Option<Vec<u8>> {
        self.session()?
            .keys
            .iter()
            .find(|k| k.description == description)
            .map(|k| k.payload.clone())
    }

    pub fn key_count(&self) -> usize {
        self.session().map(|ring| ring.keys.len()).unwrap_or(0)
    }

    pub fn session_shared(&self) -> bool {
        self.session().is_some_and(|ring| ring.shared)
    }

    pub fn user_keyring_linked(&self) -> bool {
        self.session().is_some_and(|ring| ring.user_linked)
    }
}

impl KeyStore for MemoryKeyStore {
    type Scan = std::vec::IntoIter<KeyEntry>;

    fn join_session(&mut self, name: &str) -> Result<KeySerial, KafsError> {
        if let Some(idx) = self
            .rings
            .iter()
            .position(|ring| ring.name == name && ring.shared && !ring.revoked)
        {
            self.current = Some(idx);
            return Ok(self.rings[idx].serial);
        }

        let serial = self.alloc_serial();
        self.rings.push(MemoryRing {
            serial,
            name: name.to_string(),
            ..MemoryRing::default()
        });
        self.current = Some(self.rings.len() - 1);
        Ok(serial)
    }

    fn share_session(&mut self) -> Result<(), KafsError> {
        if self.fail_share {
            return Err(KafsError::KeyutilsError(Errno(libc::EACCES)));
        }
        let idx = self.session_index();
        self.rings[idx].shared = true;
        Ok(())
    }

    fn link_user_keyring(&mut self) -> Result<(), KafsError> {
        if self.fail_link {
            return Err(KafsError::KeyutilsError(Errno(libc::EACCES)));
        }
        let idx = self.session_index();
        self.rings[idx].user_linked = true;
        Ok(())
    }

    fn session_name(&self) -> Result<Option<String>, KafsError> {
        Ok(self.session().map(|ring| ring.name.clone()))
    }

    fn revoke_session(&mut self) -> Result<(), KafsError> {
        let idx = self
            .current
            .take()
            .ok_or(KafsError::KeyutilsError(Errno(libc::ENOKEY)))?;
        self.rings[idx].revoked = true;
        self.rings[idx].keys.clear();
        Ok(())
    }

    fn add_rxrpc_key(
        &mut self,
        description: &str,
        payload: &[u8],
    ) -> Result<KeySerial, KafsError> {
        self.rxrpc_adds += 1;
        Ok(self.add_key("rxrpc", description, payload))
    }

    fn search_rxrpc_key(&self, description: &str) -> Result<Option<KeySerial>, KafsError> {
        Ok(self.session().and_then(|ring| {
            ring.keys
                .iter()
                .find(|k| k.key_type == "rxrpc" && k.description == description)
                .map(|k| k.serial)
        }))
    }

    fn invalidate(&mut self, serial: KeySerial) -> Result<(), KafsError> {
        if self.fail_invalidate {
            return Err(KafsError::KeyutilsError(Errno(libc::EACCES)));
        }
        let idx = self
            .current
            .ok_or(KafsError::KeyutilsError(Errno(libc::ENOKEY)))?;
        let keys = &mut self.rings[idx].keys;
        let before = keys.len();
        keys.retain(|k| k.serial != serial);
        if keys.len() == before {
            return Err(KafsError::KeyutilsError(Errno(libc::ENOKEY)));
        }
        Ok(())
    }

    fn scan(&self) -> Result<Self::Scan, KafsError> {
        let entries: Vec<KeyEntry> = self
            .session()
            .map(|ring| {
                ring.keys
                    .iter()
                    .map(|k| KeyEntry {
                        serial: k.serial,
                        key_type: k.key_type.clone(),
                        description: k.description.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(entries.into_iter())
    }

    fn proc_keys(&self) -> Result<String, KafsError> {
        let mut text = String::new();
        for ring in self.rings.iter().filter(|ring| !ring.revoked) {
            let _ = writeln!(
                text,
                "{:08x} I--Q---     1 perm 3f030000  1000  1000 keyring   {}: {}",
                ring.serial,
                ring.name,
                ring.keys.len()
            );
            for key in ring.keys.iter() {
                let expiry = if key.key_type == "rxrpc" { "9h" } else { "perm" };
                let _ = writeln!(
                    text,
                    "{:08x} I--Q---     1 {:>4} 3b010000  1000  1000 {:<9} {}: ka",
                    key.serial, expiry, key.key_type, key.description
                );
            }
        }
        Ok(text)
    }
}

/// Process ids that follow the syscalls made on them. Only successful calls are
/// recorded.
#[derive(Debug, Clone, Default)]
pub struct MockCredentials {
    pub uid: u32,
    pub euid: u32,
    pub gid: u32,
    pub egid: u32,
    pub fail_gid: bool,
    pub fail_uid: bool,
    pub fail_euid: bool,
    pub calls: Vec<String>,
    users: BTreeMap<String, TargetUser>,
}

impl MockCredentials {
    pub fn root() -> Self {
        MockCredentials::default()
    }

    pub fn with_user(mut self, name: &str, uid: u32, gid: u32) -> Self {
        self.users.insert(
            name.to_string(),
            TargetUser {
                name: name.to_string(),
                uid,
                gid,
            },
        );
        self
    }
}

impl Credentials for MockCredentials {
    fn uid(&self) -> u32 {
        self.uid
    }

    fn euid(&self) -> u32 {
        self.euid
    }

    fn gid(&self) -> u32 {
        self.gid
    }

    fn egid(&self) -> u32 {
        self.egid
    }

    fn set_real_gid(&mut self, gid: u32) -> Result<(), Errno> {
        if self.fail_gid {
            return Err(Errno(libc::EPERM));
        }
        self.gid = gid;
        self.calls.push(format!("setregid({gid})"));
        Ok(())
    }

    fn set_real_uid(&mut self, uid: u32) -> Result<(), Errno> {
        if self.fail_uid {
            return Err(Errno(libc::EPERM));
        }
        self.uid = uid;
        self.calls.push(format!("setreuid({uid})"));
        Ok(())
    }

    fn set_effective_uid(&mut self, uid: u32) -> Result<(), Errno> {
        if self.fail_euid {
            return Err(Errno(libc::EPERM));
        }
        self.euid = uid;
        self.calls.push(format!("seteuid({uid})"));
        Ok(())
    }

    fn lookup_user(&self, name: &str) -> Option<TargetUser> {
        self.users.get(name).cloned()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockPam {
    user: Option<String>,
    service: String,
    env: BTreeMap<String, String>,
    markers: BTreeMap<Marker, bool>,
}

impl MockPam {
    pub fn new(user: &str, service: &str) -> Self {
        MockPam {
            user: Some(user.to_string()),
            service: service.to_string(),
            ..MockPam::default()
        }
    }

    pub fn with_env(mut self, name: &str, value: &str) -> Self {
        self.env.insert(name.to_string(), value.to_string());
        self
    }
}

impl PamContext for MockPam {
    fn user(&self) -> Result<String, KafsError> {
        self.user.clone().ok_or(KafsError::NoUserName)
    }

    fn service(&self) -> Result<String, KafsError> {
        Ok(self.service.clone())
    }

    fn getenv(&self, name: &str) -> Option<String> {
        self.env.get(name).cloned()
    }

    fn putenv(&mut self, name: &str, value: &str) -> Result<(), KafsError> {
        self.env.insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn marker(&self, marker: Marker) -> bool {
        self.markers.get(&marker).copied().unwrap_or(false)
    }

    fn set_marker(&mut self, marker: Marker, value: bool) -> Result<(), KafsError> {
        self.markers.insert(marker, value);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct CacheState {
    principal: Option<PrincipalName>,
    credentials: Vec<Credential>,
}

/// A credential cache whose clones share their contents.
#[derive(Debug, Clone)]
pub struct MemoryCache {
    name: String,
    state: Rc<RefCell<CacheState>>,
}

impl MemoryCache {
    pub fn new(name: &str) -> Self {
        MemoryCache {
            name: name.to_string(),
            state: Rc::default(),
        }
    }
}

impl CredentialCache for MemoryCache {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn principal(&self) -> Result<PrincipalName, KafsError> {
        self.state
            .borrow()
            .principal
            .clone()
            .ok_or(KafsError::NoCredentialCache)
    }

    fn credentials(&self) -> Result<Vec<Credential>, KafsError> {
        Ok(self.state.borrow().credentials.clone())
    }

    fn init(&mut self, principal: &PrincipalName) -> Result<(), KafsError> {
        let mut state = self.state.borrow_mut();
        state.principal = Some(principal.clone());
        state.credentials.clear();
        Ok(())
    }

    fn store(&mut self, credential: &Credential) -> Result<(), KafsError> {
        self.state.borrow_mut().credentials.push(credential.clone());
        Ok(())
    }
}

/// Fixed host to realm mappings and a set of named in-memory caches. Resolving a
/// name twice gives the same cache.
#[derive(Debug, Clone, Default)]
pub struct MemoryKrb5 {
    realms: BTreeMap<String, String>,
    caches: Rc<RefCell<BTreeMap<String, MemoryCache>>>,
}

impl MemoryKrb5 {
    pub fn with_realm(mut self, host: &str, realm: &str) -> Self {
        self.realms.insert(host.to_string(), realm.to_string());
        self
    }
}

impl Krb5Context for MemoryKrb5 {
    fn host_realm(&self, host: &str) -> Result<String, KafsError> {
        self.realms.get(host).cloned().ok_or(KafsError::NoRealm)
    }

    fn resolve_cache(&self, name: &str) -> Result<Box<dyn CredentialCache>, KafsError> {
        let cache = self
            .caches
            .borrow_mut()
            .entry(name.to_string())
            .or_insert_with(|| MemoryCache::new(name))
            .clone();
        Ok(Box::new(cache))
    }
}
