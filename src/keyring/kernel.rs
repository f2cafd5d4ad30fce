use super::{KeyEntry, KeySerial, KeyStore};
use crate::constants::{PATH_PROC_KEYS, RXRPC_KEY_TYPE};
use crate::error::KafsError;

use errno::Errno;
use keyutils_raw::{
    add_key, keyctl_describe, keyctl_get_keyring_id, keyctl_invalidate,
    keyctl_join_session_keyring, keyctl_link, keyctl_read, keyctl_revoke, keyctl_search,
    keyctl_setperm, KeyringSerial, KEY_POS_ALL, KEY_SPEC_SESSION_KEYRING, KEY_SPEC_USER_KEYRING,
    KEY_USR_ALL,
};
use std::collections::BTreeSet;
use tracing::{debug, error, trace};

const KEYRING_KEY_TYPE: &str = "keyring";

impl From<errno::Errno> for KafsError {
    fn from(value: errno::Errno) -> Self {
        error!(errno = ?value, "kernel keyring error");
        KafsError::KeyutilsError(value)
    }
}

fn session_keyring(create: bool) -> Result<KeyringSerial, Errno> {
    keyctl_get_keyring_id(KEY_SPEC_SESSION_KEYRING, create)
}

fn attach_session() -> Result<KeyringSerial, KafsError> {
    session_keyring(true).map_err(|e| {
        error!(?e, "Failed to attach or create session keyring");
        e.into()
    })
}

/// The serials linked into a keyring, as returned by KEYCTL_READ.
fn read_keyring(serial: KeyringSerial) -> Result<Vec<KeyringSerial>, Errno> {
    let mut buffer = vec![0u8; keyctl_read(serial, None)?];
    loop {
        let len = keyctl_read(serial, Some(buffer.as_mut_slice().into()))?;
        if len <= buffer.len() {
            buffer.truncate(len);
            break;
        }
        // The keyring grew in between.
        buffer.resize(len, 0);
    }

    Ok(parse_keyring_payload(&buffer))
}

fn parse_keyring_payload(payload: &[u8]) -> Vec<KeyringSerial> {
    payload
        .chunks_exact(std::mem::size_of::<i32>())
        .filter_map(|chunk| chunk.try_into().ok())
        .map(i32::from_ne_bytes)
        .filter_map(KeyringSerial::new)
        .collect()
}

/// KEYCTL_DESCRIBE gives `type;uid;gid;perm;description`.
fn describe(serial: KeyringSerial) -> Result<(String, String), Errno> {
    let mut buffer = vec![0u8; keyctl_describe(serial, None)?];
    loop {
        let len = keyctl_describe(serial, Some(buffer.as_mut_slice().into()))?;
        if len <= buffer.len() {
            buffer.truncate(len);
            break;
        }
        buffer.resize(len, 0);
    }
    parse_description(&buffer).ok_or(Errno(libc::EINVAL))
}

fn parse_description(raw: &[u8]) -> Option<(String, String)> {
    let raw = raw.strip_suffix(&[0]).unwrap_or(raw);
    let text = String::from_utf8_lossy(raw);
    let mut fields = text.splitn(5, ';');
    let key_type = fields.next()?;
    let description = fields.nth(3)?;
    Some((key_type.to_string(), description.to_string()))
}

/// The real kernel keyring, reached through keyctl(2).
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelKeyStore;

impl KeyStore for KernelKeyStore {
    type Scan = KernelKeyScan;

    fn join_session(&mut self, name: &str) -> Result<KeySerial, KafsError> {
        let serial = keyctl_join_session_keyring(Some(name))?;
        Ok(serial.get())
    }

    fn share_session(&mut self) -> Result<(), KafsError> {
        let session = attach_session()?;
        keyctl_setperm(session, KEY_POS_ALL | KEY_USR_ALL)?;
        Ok(())
    }

    fn link_user_keyring(&mut self) -> Result<(), KafsError> {
        let session = attach_session()?;
        let user = keyctl_get_keyring_id(KEY_SPEC_USER_KEYRING, true)?;
        keyctl_link(user, session)?;
        Ok(())
    }

    fn session_name(&self) -> Result<Option<String>, KafsError> {
        let session = match session_keyring(false) {
            Ok(serial) => serial,
            Err(Errno(libc::ENOKEY)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let (_, description) = describe(session)?;
        Ok(Some(description))
    }

    fn revoke_session(&mut self) -> Result<(), KafsError> {
        let session = session_keyring(false)?;
        keyctl_revoke(session)?;
        Ok(())
    }

    fn add_rxrpc_key(
        &mut self,
        description: &str,
        payload: &[u8],
    ) -> Result<KeySerial, KafsError> {
        let session = attach_session()?;
        let serial = add_key(RXRPC_KEY_TYPE, description, payload, session)?;
        Ok(serial.get())
    }

    fn search_rxrpc_key(&self, description: &str) -> Result<Option<KeySerial>, KafsError> {
        let session = attach_session()?;
        match keyctl_search(session, RXRPC_KEY_TYPE, description, None) {
            Ok(serial) => Ok(Some(serial.get())),
            Err(Errno(libc::ENOKEY)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn invalidate(&mut self, serial: KeySerial) -> Result<(), KafsError> {
        let serial =
            KeyringSerial::new(serial).ok_or(KafsError::KeyutilsError(Errno(libc::EINVAL)))?;
        keyctl_invalidate(serial)?;
        Ok(())
    }

    fn scan(&self) -> Result<Self::Scan, KafsError> {
        let root = attach_session()?;
        Ok(KernelKeyScan {
            keys: Vec::new(),
            rings: vec![root],
            seen: BTreeSet::new(),
        })
    }

    fn proc_keys(&self) -> Result<String, KafsError> {
        std::fs::read_to_string(PATH_PROC_KEYS).map_err(|io_err| {
            error!(?io_err, "Unable to read {}", PATH_PROC_KEYS);
            KafsError::IoError
        })
    }
}

/// Depth first walk of a keyring tree. Keyrings are only read once the keys found
/// so far have been handed out.
pub struct KernelKeyScan {
    keys: Vec<KeyringSerial>,
    rings: Vec<KeyringSerial>,
    seen: BTreeSet<KeySerial>,
}

impl Iterator for KernelKeyScan {
    type Item = KeyEntry;

    fn next(&mut self) -> Option<KeyEntry> {
        loop {
            if let Some(serial) = self.keys.pop() {
                match describe(serial) {
                    Ok((key_type, _)) if key_type == KEYRING_KEY_TYPE => {
                        self.rings.push(serial);
                    }
                    Ok((key_type, description)) => {
                        return Some(KeyEntry {
                            serial: serial.get(),
                            key_type,
                            description,
                        })
                    }
                    Err(err) => {
                        // Keys we may not view still show up in the keyring, and keys
                        // can be invalidated between the read and the describe.
                        trace!(?err, ?serial, "skipping key");
                    }
                }
                continue;
            }

            let ring = self.rings.pop()?;
            if !self.seen.insert(ring.get()) {
                continue;
            }
            match read_keyring(ring) {
                Ok(children) => self.keys.extend(children),
                Err(err) => debug!(?err, ?ring, "Unable to read keyring"),
            }
        }
    }
}
