use super::{Credential, CredentialCache, CredentialV4, PrincipalName, PrincipalV4};
use crate::error::KafsError;

use binrw::helpers::until_eof;
use binrw::io::TakeSeekExt;
use binrw::{binread, binwrite, BinReaderExt, BinWrite};
use std::fs::{self, File, Permissions};
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use tracing::{debug, error, trace};

#[binwrite]
#[bw(big)]
#[binread]
#[derive(Debug)]
struct HeaderField {
    tag: u16,
    #[bw(try_calc(u16::try_from(value.len())))]
    value_len: u16,
    #[br(count = value_len)]
    value: Vec<u8>,
}

#[binwrite]
#[bw(big)]
#[binread]
#[derive(Debug)]
struct FileCredentialCacheHeader {
    #[bw(calc = fields.iter().map(|x| (x.value.len() + 4) as u16).sum::<u16>())]
    length: u16,
    #[br(map_stream = |s| s.take_seek(length as u64), parse_with = until_eof)]
    fields: Vec<HeaderField>,
}

/// The version 4 file cache, the only version MIT and Heimdal still write.
#[binwrite]
#[bw(big, magic = 0x0504u16)]
#[binread]
#[br(big, magic = 0x0504u16)]
#[derive(Debug)]
struct FileCredentialCache {
    header: FileCredentialCacheHeader,
    principal: PrincipalV4,
    #[br(parse_with = until_eof)]
    credentials: Vec<CredentialV4>,
}

impl FileCredentialCache {
    fn read(inner: &[u8]) -> Result<Self, KafsError> {
        let mut reader = binrw::io::Cursor::new(inner);
        reader.read_be().map_err(|binrw_err| {
            debug!(?binrw_err, "Failed to deserialize credential cache");
            KafsError::BinRWError
        })
    }

    fn to_bytes(&self) -> Result<Vec<u8>, KafsError> {
        let mut c = std::io::Cursor::new(Vec::new());
        self.write(&mut c).map_err(|binrw_err| {
            error!(?binrw_err, "Unable to write binary data.");
            KafsError::BinRWError
        })?;
        Ok(c.into_inner())
    }
}

pub(super) struct FileCredentialCacheContext {
    path: PathBuf,
}

impl FileCredentialCacheContext {
    fn load(&self) -> Result<FileCredentialCache, KafsError> {
        let buffer = fs::read(&self.path).map_err(|io_err| {
            if io_err.kind() == ErrorKind::NotFound {
                debug!(path = ?self.path, "credential cache does not exist");
                KafsError::NoCredentialCache
            } else {
                error!(?io_err, "Unable to read file at {:?}", &self.path);
                KafsError::IoError
            }
        })?;
        FileCredentialCache::read(&buffer)
    }

    fn save(&self, fcc: &FileCredentialCache) -> Result<(), KafsError> {
        let buffer = fcc.to_bytes()?;
        fs::write(&self.path, buffer).map_err(|io_err| {
            error!(?io_err, "Unable to write file at {:?}", &self.path);
            KafsError::IoError
        })
    }
}

impl CredentialCache for FileCredentialCacheContext {
    fn name(&self) -> String {
        format!("FILE:{}", self.path.display())
    }

    fn principal(&self) -> Result<PrincipalName, KafsError> {
        Ok((&self.load()?.principal).into())
    }

    fn credentials(&self) -> Result<Vec<Credential>, KafsError> {
        Ok(self
            .load()?
            .credentials
            .into_iter()
            .map(Credential::from)
            .collect())
    }

    fn init(&mut self, principal: &PrincipalName) -> Result<(), KafsError> {
        let fcc = FileCredentialCache {
            header: FileCredentialCacheHeader { fields: vec![] },
            principal: principal.into(),
            credentials: vec![],
        };

        let f = File::create(&self.path).map_err(|io_err| {
            error!(?io_err, "Unable to create file at {:?}", &self.path);
            KafsError::IoError
        })?;
        f.set_permissions(Permissions::from_mode(0o600))
            .map_err(|io_err| {
                error!(?io_err, "Unable to set permissions at {:?}", &self.path);
                KafsError::IoError
            })?;
        drop(f);

        self.save(&fcc)
    }

    fn store(&mut self, credential: &Credential) -> Result<(), KafsError> {
        let mut fcc = self.load()?;
        fcc.credentials.push(credential.as_v4().clone());
        self.save(&fcc)
    }
}

pub(super) fn resolve(ccache_name: &str) -> Result<Box<dyn CredentialCache>, KafsError> {
    let path = ccache_name.strip_prefix("FILE:").unwrap_or(ccache_name);
    trace!(?path, "Resolved file credential cache");

    Ok(Box::new(FileCredentialCacheContext {
        path: PathBuf::from(path),
    }))
}
