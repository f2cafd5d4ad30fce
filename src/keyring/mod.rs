//! AFS tokens in the kernel keyring.
//!
//! A process authentication group (PAG) is nothing more than a session keyring with
//! a well known name, and a token is an `rxrpc` key described `afs@<cell>` that
//! lives somewhere under it. The kernel AFS client searches the session keyring of
//! the calling process when it needs credentials for a cell.

mod kernel;
pub mod proc_keys;

pub use kernel::KernelKeyStore;

use crate::constants::{LOCAL_PAG_NAME, RXRPC_KEY_TYPE, SHARED_PAG_NAME};
use crate::error::KafsError;

use tracing::{debug, error, info, instrument, warn};

pub type KeySerial = i32;

/// One key found while walking a keyring tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEntry {
    pub serial: KeySerial,
    pub key_type: String,
    pub description: String,
}

/// The keyring primitives tokens and PAGs are built from. Every operation acts on
/// the session keyring of the calling thread.
pub trait KeyStore {
    /// A single pass over every key reachable from the session keyring.
    type Scan: Iterator<Item = KeyEntry>;

    /// Join the session keyring called `name`, creating it if no such keyring is
    /// reachable.
    fn join_session(&mut self, name: &str) -> Result<KeySerial, KafsError>;

    /// Allow other processes of the owning user to join the session keyring.
    fn share_session(&mut self) -> Result<(), KafsError>;

    /// Link the user keyring into the session keyring so that lookups which do not
    /// know about PAGs still find the user's keys.
    fn link_user_keyring(&mut self) -> Result<(), KafsError>;

    /// The description of the session keyring, or `None` if there is none.
    fn session_name(&self) -> Result<Option<String>, KafsError>;

    fn revoke_session(&mut self) -> Result<(), KafsError>;

    fn add_rxrpc_key(&mut self, description: &str, payload: &[u8])
        -> Result<KeySerial, KafsError>;

    fn search_rxrpc_key(&self, description: &str) -> Result<Option<KeySerial>, KafsError>;

    fn invalidate(&mut self, serial: KeySerial) -> Result<(), KafsError>;

    fn scan(&self) -> Result<Self::Scan, KafsError>;

    /// The kernel's textual key listing, in `/proc/keys` format.
    fn proc_keys(&self) -> Result<String, KafsError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagKind {
    None,
    Local,
    Shared,
}

impl PagKind {
    fn from_session_name(name: &str) -> Self {
        match name {
            LOCAL_PAG_NAME => PagKind::Local,
            SHARED_PAG_NAME => PagKind::Shared,
            _ => PagKind::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagHandle {
    pub kind: PagKind,
    pub serial: KeySerial,
}

/// A token as listed to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    /// The key description, `afs@<cell>`.
    pub name: String,
    /// Time to expiry as reported by the kernel, empty if the key vanished from
    /// the listing between the scan and the lookup.
    pub expiry: String,
}

pub(crate) fn token_description(cell: &str) -> String {
    format!("afs@{cell}")
}

pub struct TokenStore<K: KeyStore> {
    keys: K,
}

impl TokenStore<KernelKeyStore> {
    pub fn kernel() -> Self {
        TokenStore {
            keys: KernelKeyStore,
        }
    }
}

impl<K: KeyStore> TokenStore<K> {
    pub fn new(keys: K) -> Self {
        TokenStore { keys }
    }

    #[cfg(test)]
    pub(crate) fn key_store(&self) -> &K {
        &self.keys
    }

    /// Join (or create) a PAG and link the user keyring into it. A shared PAG is
    /// also opened up to the owning user's other processes.
    #[instrument(level = "debug", skip(self))]
    pub fn join_pag(&mut self, shared: bool) -> Result<PagHandle, KafsError> {
        let (name, kind) = if shared {
            (SHARED_PAG_NAME, PagKind::Shared)
        } else {
            (LOCAL_PAG_NAME, PagKind::Local)
        };

        let serial = self.keys.join_session(name).inspect_err(|err| {
            error!(?err, ?name, "Unable to join session keyring");
        })?;

        if shared {
            // The join already happened, a keyring that stays private is still usable.
            if let Err(err) = self.keys.share_session() {
                warn!(?err, "Unable to set permissions on shared PAG");
            }
        }
        self.keys.link_user_keyring().inspect_err(|err| {
            error!(?err, ?kind, "Unable to link user keyring into PAG");
        })?;

        info!(?kind, ?serial, "joined PAG");
        Ok(PagHandle { kind, serial })
    }

    pub fn current_pag_kind(&self) -> Result<PagKind, KafsError> {
        let kind = self
            .keys
            .session_name()?
            .map(|name| PagKind::from_session_name(&name))
            .unwrap_or(PagKind::None);
        debug!(?kind, "current PAG");
        Ok(kind)
    }

    /// Add the token for `cell` to the session keyring. A token already present for
    /// the cell in the session keyring is replaced by the kernel.
    #[instrument(level = "debug", skip(self, payload))]
    pub fn install_token(&mut self, cell: &str, payload: &[u8]) -> Result<(), KafsError> {
        let description = token_description(cell);
        let serial = self
            .keys
            .add_rxrpc_key(&description, payload)
            .inspect_err(|err| error!(?err, %cell, "Unable to add rxrpc key"))?;
        debug!(?serial, %description, "installed token");
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    pub fn revoke_token(&mut self, cell: &str) -> Result<(), KafsError> {
        let description = token_description(cell);
        let Some(serial) = self.keys.search_rxrpc_key(&description)? else {
            debug!(%cell, "no token to revoke");
            return Err(KafsError::TokenNotFound);
        };
        self.keys
            .invalidate(serial)
            .inspect_err(|err| error!(?err, %cell, "Unable to invalidate token"))
    }

    /// Invalidate every rxrpc key reachable from the session keyring. Failures are
    /// logged and skipped, this never fails.
    #[instrument(level = "debug", skip(self))]
    pub fn revoke_all_tokens(&mut self) -> Result<(), KafsError> {
        let serials: Vec<KeySerial> = match self.keys.scan() {
            Ok(scan) => scan
                .filter(|entry| entry.key_type == RXRPC_KEY_TYPE)
                .map(|entry| entry.serial)
                .collect(),
            Err(err) => {
                warn!(?err, "Unable to scan session keyring");
                return Ok(());
            }
        };

        for serial in serials {
            match self.keys.invalidate(serial) {
                Ok(()) => debug!(?serial, "invalidated token"),
                Err(err) => warn!(?err, ?serial, "Unable to invalidate token"),
            }
        }
        Ok(())
    }

    /// Every token reachable from the session keyring, paired with its expiry from
    /// the kernel key listing. The iterator walks the keyring as it is consumed.
    pub fn list_tokens(&self) -> Result<impl Iterator<Item = TokenInfo>, KafsError> {
        let listing = proc_keys::parse(&self.keys.proc_keys()?);
        let scan = self.keys.scan()?;

        Ok(scan
            .filter(|entry| entry.key_type == RXRPC_KEY_TYPE)
            .map(move |entry| match listing.get(&entry.serial) {
                Some(pk) => TokenInfo {
                    name: pk.description.clone(),
                    expiry: pk.expiry.clone(),
                },
                None => TokenInfo {
                    name: entry.description,
                    expiry: String::new(),
                },
            }))
    }

    /// Revoke the session keyring if it is a local PAG. Shared PAGs belong to every
    /// session that joined them and are left alone.
    #[instrument(level = "debug", skip(self))]
    pub fn revoke_pag(&mut self) -> Result<(), KafsError> {
        match self.current_pag_kind()? {
            PagKind::Local => self.keys.revoke_session(),
            kind => {
                debug!(?kind, "not revoking session keyring");
                Ok(())
            }
        }
    }
}
