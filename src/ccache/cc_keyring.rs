/*
 * The string after "KEYRING:" is called the residual and has three parts:
 * <anchor>:<collection>:<subsidiary>
 *
 * The <anchor> is the keyring to use: process, thread, session, user or persistent.
 * A persistent residual names the uid as its collection, and the collection
 * keyring in the uid's persistent keyring is simply "_krb".
 *
 * A collection is a keyring named "_krb_<collection>" in the anchor. It holds one
 * subsidiary keyring per principal, and a "krb_ccache:primary" user key naming the
 * subsidiary to use when the residual does not give one. MIT names the first
 * subsidiary after the collection and later ones "krb_ccache_XXXXXXX".
 *
 * $ keyctl show
 * Session Keyring
 *  719031901 --alswrv   1000   100  keyring: _ses
 *  541342232 --alswrv   1000   100   \_ keyring: _krb_foo
 *  557625224 --alswrv   1000   100       \_ user: krb_ccache:primary
 *  463197567 --alswrv   1000   100       \_ keyring: foo
 *  106708269 --alswrv   1000   100           \_ user: __krb5_princ__
 *  150210269 --alswrv   1000   100           \_ user: afs/example.com@EXAMPLE.COM
 *  676215280 --alswrv   1000   100           \_ user: krbtgt/EXAMPLE.COM@EXAMPLE.COM
 *
 * Credentials are user keys holding the same big endian encoding as a FILE cache
 * credential, described by the server principal. "__krb5_princ__" holds the default
 * principal in the same encoding.
 */

use super::{Credential, CredentialCache, CredentialV4, PrincipalName, PrincipalV4};
use crate::error::KafsError;

use binrw::{binread, binwrite, BinReaderExt, BinWrite};
use errno::Errno;
use keyutils::keytypes::user::User;
use keyutils::{Keyring, SpecialKeyring};
use keyutils_raw::{keyctl_get_keyring_id, keyctl_get_persistent};
use rand::{distr::Alphanumeric, Rng};
use tracing::{debug, error, trace};
use uzers::get_effective_uid;

const PRINCIPAL_KEY: &str = "__krb5_princ__";
const TIME_OFFSETS_KEY: &str = "__krb5_time_offsets__";
const PRIMARY_KEY: &str = "krb_ccache:primary";

#[derive(Debug, Clone, Eq, PartialEq)]
struct Residual {
    anchor: String,
    collection: String,
    subsidiary: Option<String>,
}

impl Residual {
    fn parse(residual: &str) -> Result<Self, KafsError> {
        let residual = residual
            .strip_prefix("KEYRING:")
            .ok_or(KafsError::UnsupportedCredentialCacheType)?;

        let (anchor, suffix) = residual
            .split_once(':')
            .ok_or(KafsError::UnsupportedCredentialCacheType)?;
        if anchor.is_empty() {
            return Err(KafsError::UnsupportedCredentialCacheType);
        }

        let (collection, subsidiary) = suffix.split_once(':').unwrap_or((suffix, ""));
        if collection.is_empty() {
            return Err(KafsError::UnsupportedCredentialCacheType);
        }

        let subsidiary = subsidiary.split(':').next().filter(|s| !s.is_empty());

        Ok(Residual {
            anchor: anchor.to_string(),
            collection: collection.to_string(),
            subsidiary: subsidiary.map(String::from),
        })
    }

    fn subsidiary_name(&self) -> &str {
        self.subsidiary.as_deref().unwrap_or(self.collection.as_str())
    }
}

#[binwrite]
#[bw(big, magic = 1u32)]
#[binread]
#[br(big, magic = 1u32)]
struct PrimaryName {
    #[bw(calc = strval.len() as u32)]
    #[br(temp)]
    strlen: u32,
    #[br(count = strlen)]
    strval: Vec<u8>,
}

fn encode<T>(value: &T) -> Result<Vec<u8>, KafsError>
where
    T: for<'a> BinWrite<Args<'a> = ()>,
{
    let mut c = std::io::Cursor::new(Vec::new());
    value.write_be(&mut c).map_err(|binrw_err| {
        error!(?binrw_err, "Unable to encode keyring ccache entry");
        KafsError::BinRWError
    })?;
    Ok(c.into_inner())
}

fn read_user_key(keyring: &Keyring, name: &str) -> Result<Option<Vec<u8>>, KafsError> {
    match keyring.search_for_key::<User, &str, Option<&mut Keyring>>(name, None) {
        Ok(k) => Ok(Some(k.read()?)),
        Err(Errno(libc::ENOKEY)) => Ok(None),
        Err(e) => Err(KafsError::from(e)),
    }
}

/// The principal stored in a subsidiary's "__krb5_princ__" key.
fn get_subsidiary_principal(keyring: &Keyring) -> Result<Option<PrincipalName>, KafsError> {
    let Some(payload) = read_user_key(keyring, PRINCIPAL_KEY)? else {
        return Ok(None);
    };
    let mut reader = binrw::io::Cursor::new(payload);
    let name: PrincipalV4 = reader.read_be().map_err(|err| {
        error!(error = ?err, "Unable to read subsidiary principal");
        KafsError::BinRWError
    })?;
    Ok(Some((&name).into()))
}

fn get_primary_subsidiary_name(collection: &Keyring) -> Result<Option<String>, KafsError> {
    let Some(payload) = read_user_key(collection, PRIMARY_KEY)? else {
        return Ok(None);
    };
    let mut reader = binrw::io::Cursor::new(payload);
    let pn: PrimaryName = reader.read_be().map_err(|err| {
        error!(?collection, error = ?err, "Failed to read primary name");
        KafsError::BinRWError
    })?;
    Ok(Some(String::from_utf8_lossy(pn.strval.as_slice()).to_string()))
}

fn subsidiary_exists(collection: &Keyring, name: &str) -> Result<Option<Keyring>, KafsError> {
    match collection.search_for_keyring(name, None) {
        Ok(k) => Ok(Some(k)),
        Err(Errno(libc::ENOKEY)) => Ok(None),
        Err(e) => Err(KafsError::from(e)),
    }
}

fn get_random_subsidiary_name(collection: &Keyring) -> Result<String, KafsError> {
    for _ in 1..10 {
        let s: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(7)
            .map(char::from)
            .collect();
        let s = format!("krb_ccache_{s}");
        if subsidiary_exists(collection, s.as_str())?.is_none() {
            return Ok(s);
        }
    }

    error!(?collection, "Failed to generate random cache name");
    Err(KafsError::CredentialCacheError)
}

/// Pick the subsidiary to initialise for `name`. A named subsidiary must be empty
/// or already hold `name`. Without a name the collection's own subsidiary is used
/// unless another principal has it, in which case a fresh one is made.
fn get_subsidiary_cache(
    name: &PrincipalName,
    collection: &mut Keyring,
    residual: &Residual,
) -> Result<Keyring, KafsError> {
    let subsidiary_name = residual.subsidiary_name();

    let Some(subsidiary) = subsidiary_exists(collection, subsidiary_name)? else {
        return Ok(collection.add_keyring(subsidiary_name)?);
    };

    let stored_name = get_subsidiary_principal(&subsidiary)?;
    match stored_name {
        Some(stored) if !stored.same_name(name) => {
            if residual.subsidiary.is_some() {
                error!(%stored, %name, %subsidiary_name, "Stored principal do not match");
                Err(KafsError::CredentialCacheError)
            } else {
                let random = get_random_subsidiary_name(collection)?;
                Ok(collection.add_keyring(random.as_str())?)
            }
        }
        _ => Ok(subsidiary),
    }
}

fn store_primary_subsidiary_name(
    subsidiary_name: &str,
    collection: &mut Keyring,
) -> Result<(), KafsError> {
    let pn = PrimaryName {
        strval: subsidiary_name.as_bytes().to_vec(),
    };
    let payload = encode(&pn)?;
    collection.add_key::<User, &str, &[u8]>(PRIMARY_KEY, payload.as_slice())?;
    Ok(())
}

fn store_principal(name: &PrincipalName, subsidiary: &mut Keyring) -> Result<(), KafsError> {
    let princ: PrincipalV4 = name.into();
    let payload = encode(&princ)?;
    subsidiary.add_key::<User, &str, &[u8]>(PRINCIPAL_KEY, payload.as_slice())?;
    Ok(())
}

/// The uid's persistent keyring, linked into the process keyring. The collection
/// of a persistent residual is the uid, and must be ours since new keys are owned by
/// the effective uid.
fn get_persistent(collection: &str) -> Result<Keyring, KafsError> {
    let uid = collection.parse::<u32>().map_err(|e| {
        error!(%collection, ?e, "Failed to parse collection name into uid");
        KafsError::CredentialCacheError
    })?;
    let euid = get_effective_uid();
    if uid != euid {
        error!(?uid, ?euid, "The collection name (uid) does not match the effective uid");
        return Err(KafsError::CredentialCacheError);
    }

    let process = keyctl_get_keyring_id(SpecialKeyring::Process.serial(), true)
        .inspect_err(|e| error!(?e, "Failed to attach or create process keyring"))?;
    let persistent = keyctl_get_persistent(uid, process)
        .inspect_err(|e| error!(?e, "Failed to attach to persistent keyring"))?;
    // SAFETY: the serial was just handed out by the kernel for a keyring.
    Ok(unsafe { Keyring::new(persistent) })
}

fn get_anchor(residual: &Residual) -> Result<Keyring, KafsError> {
    let special = match residual.anchor.as_str() {
        "process" => SpecialKeyring::Process,
        "thread" => SpecialKeyring::Thread,
        "session" => SpecialKeyring::Session,
        "user" => SpecialKeyring::User,
        "persistent" => return get_persistent(&residual.collection),
        anchor => {
            error!(%anchor, "unsupported keyring ccache anchor");
            return Err(KafsError::UnsupportedCredentialCacheType);
        }
    };
    Keyring::attach_or_create(special).map_err(|e| {
        error!(?e, anchor = %residual.anchor, "Failed to attach or create anchor keyring");
        e.into()
    })
}

fn collection_name(residual: &Residual) -> String {
    match residual.anchor.as_str() {
        "persistent" => "_krb".to_string(),
        _ => format!("_krb_{}", residual.collection),
    }
}

/// Find or create the collection keyring within the anchor.
fn get_collection(residual: &Residual) -> Result<Keyring, KafsError> {
    let mut parent = get_anchor(residual)?;
    let collection_name = collection_name(residual);

    match parent.search_for_keyring(collection_name.as_str(), None) {
        Ok(k) => Ok(k),
        Err(Errno(libc::ENOKEY)) => parent.add_keyring(collection_name.as_str()),
        Err(e) => Err(e),
    }
    .map_err(|e| {
        error!(?e, %collection_name, "Failed to get or create collection keyring");
        e.into()
    })
}

pub(super) struct KeyringCredentialCacheContext {
    name: String,
    residual: Residual,
    collection: Keyring,
    subsidiary: Option<Keyring>,
}

impl KeyringCredentialCacheContext {
    /// The subsidiary holding the cache: the one picked by `init`, else the one
    /// named in the residual, else the collection's primary.
    fn current_subsidiary(&self) -> Result<Keyring, KafsError> {
        if let Some(subsidiary) = &self.subsidiary {
            let desc = subsidiary.description()?;
            if let Some(k) = subsidiary_exists(&self.collection, &desc.description)? {
                return Ok(k);
            }
        }

        let subsidiary_name = match &self.residual.subsidiary {
            Some(name) => name.clone(),
            None => get_primary_subsidiary_name(&self.collection)?
                .unwrap_or_else(|| self.residual.collection.clone()),
        };

        subsidiary_exists(&self.collection, &subsidiary_name)?.ok_or_else(|| {
            debug!(%subsidiary_name, "no such subsidiary credential cache");
            KafsError::NoCredentialCache
        })
    }
}

impl CredentialCache for KeyringCredentialCacheContext {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn principal(&self) -> Result<PrincipalName, KafsError> {
        let subsidiary = self.current_subsidiary()?;
        get_subsidiary_principal(&subsidiary)?.ok_or_else(|| {
            error!(?subsidiary, "Subsidiary ccache has no principal");
            KafsError::NoCredentialCache
        })
    }

    fn credentials(&self) -> Result<Vec<Credential>, KafsError> {
        let subsidiary = self.current_subsidiary()?;
        let (keys, _) = subsidiary.read()?;

        let mut creds = Vec::with_capacity(keys.len());
        for key in keys {
            let desc = key.description()?;
            if desc.type_ != "user"
                || desc.description == PRINCIPAL_KEY
                || desc.description == TIME_OFFSETS_KEY
            {
                continue;
            }
            let mut reader = binrw::io::Cursor::new(key.read()?);
            match reader.read_be::<CredentialV4>() {
                Ok(cred) => creds.push(cred.into()),
                Err(err) => trace!(?err, key = %desc.description, "skipping unparseable key"),
            }
        }
        Ok(creds)
    }

    fn init(&mut self, name: &PrincipalName) -> Result<(), KafsError> {
        let mut subsidiary = get_subsidiary_cache(name, &mut self.collection, &self.residual)?;
        subsidiary.clear()?;

        if self.residual.subsidiary.is_none() {
            let desc = subsidiary.description()?;
            debug!(?desc.description, "Set as primary subsidiary");
            store_primary_subsidiary_name(desc.description.as_str(), &mut self.collection)?;
        }

        store_principal(name, &mut subsidiary)?;
        debug!(?subsidiary, %name, "Subsidiary cache initialized");
        self.subsidiary = Some(subsidiary);
        Ok(())
    }

    fn store(&mut self, credential: &Credential) -> Result<(), KafsError> {
        let mut subsidiary = self.current_subsidiary()?;

        let stored_name = get_subsidiary_principal(&subsidiary)?.ok_or_else(|| {
            error!(?subsidiary, "Subsidiary ccache has no principal");
            KafsError::CredentialCacheError
        })?;
        let client = credential.client();
        if !stored_name.same_name(&client) {
            error!(%stored_name, %client, "Stored principal do not match");
            return Err(KafsError::CredentialCacheError);
        }

        let key_name = credential.server().to_string();
        let payload = encode(credential.as_v4())?;
        subsidiary.add_key::<User, &str, &[u8]>(key_name.as_str(), payload.as_slice())?;
        Ok(())
    }
}

pub(super) fn resolve(ccache_name: &str) -> Result<Box<dyn CredentialCache>, KafsError> {
    let residual = Residual::parse(ccache_name)?;
    debug!(?residual, "Parsed residual");

    let collection = get_collection(&residual)?;

    Ok(Box::new(KeyringCredentialCacheContext {
        name: ccache_name.to_string(),
        residual,
        collection,
        subsidiary: None,
    }))
}
