//! Getting, dropping and listing tokens for cells.

use crate::ccache::{CredentialCache, Krb5Context, PrincipalName};
use crate::cells::{resolve_realm_for_cell, CellConfig};
use crate::error::KafsError;
use crate::keyring::{KeyStore, TokenInfo, TokenStore};
use crate::token::ticket_to_token;

use tracing::{debug, error, info, instrument};

/// The service principal of a cell, `afs/<cell>@<realm>`.
pub fn afs_principal(cell: &str, realm: &str) -> PrincipalName {
    PrincipalName::service("afs", cell, realm)
}

/// Turn the cached `afs/<cell>` ticket into a token in the session keyring. The
/// realm defaults to the one the cell's name maps to.
#[instrument(level = "debug", skip(ctx, cache, tokens))]
pub fn afslog_cell<X, K>(
    ctx: &X,
    cache: &dyn CredentialCache,
    tokens: &mut TokenStore<K>,
    cell: &str,
    realm: Option<&str>,
) -> Result<(), KafsError>
where
    X: Krb5Context + ?Sized,
    K: KeyStore,
{
    let realm = match realm {
        Some(realm) => realm.to_string(),
        None => resolve_realm_for_cell(ctx, cell)?,
    };

    let server = afs_principal(cell, &realm);
    let ticket = cache.service_ticket(&server).inspect_err(|err| {
        error!(?err, %server, "Unable to get ticket");
    })?;

    let payload = ticket_to_token(cell, &ticket)?;
    tokens.install_token(cell, &payload.to_bytes()?)?;
    info!(%cell, %realm, "got token");
    Ok(())
}

/// Get a token for `cell`, or for every cell of the default set when no cell is
/// given. The default set is worked through in order and the first failure ends
/// the run.
#[instrument(level = "debug", skip(ctx, cache, tokens, cells))]
pub fn afslog<X, K>(
    ctx: &X,
    cache: &dyn CredentialCache,
    tokens: &mut TokenStore<K>,
    cells: &CellConfig,
    cell: Option<&str>,
    realm: Option<&str>,
) -> Result<(), KafsError>
where
    X: Krb5Context + ?Sized,
    K: KeyStore,
{
    if let Some(cell) = cell {
        return afslog_cell(ctx, cache, tokens, cell, realm);
    }

    for cell in cells.default_cell_set()? {
        afslog_cell(ctx, cache, tokens, &cell, realm)?;
    }
    Ok(())
}

/// Drop the token for `cell`, or every token in the session when no cell is given.
#[instrument(level = "debug", skip(tokens))]
pub fn unlog<K: KeyStore>(tokens: &mut TokenStore<K>, cell: Option<&str>) -> Result<(), KafsError> {
    match cell {
        Some(cell) => tokens.revoke_token(cell),
        None => {
            debug!("dropping all tokens");
            tokens.revoke_all_tokens()
        }
    }
}

pub fn list<K: KeyStore>(
    tokens: &TokenStore<K>,
) -> Result<impl Iterator<Item = TokenInfo>, KafsError> {
    tokens.list_tokens()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ccache::Credential;
    use crate::testing::{MemoryCache, MemoryKeyStore, MemoryKrb5};
    use crate::token::TokenPayload;
    use binrw::BinReaderExt;
    use std::fs;

    const END: u32 = 1_900_000_000;

    fn cache_with(cells: &[&str]) -> MemoryCache {
        let client = PrincipalName::user("testuser", "EXAMPLE.COM");
        let mut cache = MemoryCache::new("FILE:/tmp/krb5cc_test");
        cache.init(&client).expect("Unable to init cache");
        for cell in cells {
            let cred = Credential::new(
                &client,
                &afs_principal(cell, "EXAMPLE.COM"),
                1,
                &[0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef],
                END,
                cell.as_bytes(),
            )
            .expect("Unable to build credential");
            cache.store(&cred).expect("Unable to store credential");
        }
        cache
    }

    fn krb5() -> MemoryKrb5 {
        MemoryKrb5::default()
            .with_realm("a.com", "EXAMPLE.COM")
            .with_realm("b.com", "EXAMPLE.COM")
            .with_realm("c.com", "EXAMPLE.COM")
    }

    fn cell_config(these: &str) -> (tempfile::TempDir, CellConfig) {
        let dir = tempfile::tempdir().expect("Unable to create tempdir");
        fs::write(dir.path().join("TheseCells"), these).expect("Unable to write");
        let config = CellConfig::new(dir.path());
        (dir, config)
    }

    fn installed(tokens: &TokenStore<MemoryKeyStore>) -> Vec<String> {
        list(tokens)
            .expect("Unable to list tokens")
            .map(|t| t.name)
            .collect()
    }

    #[test]
    fn test_afslog_single_cell() -> Result<(), KafsError> {
        let ctx = krb5();
        let cache = cache_with(&["a.com"]);
        let mut tokens = TokenStore::new(MemoryKeyStore::default());
        let (_dir, cells) = cell_config("");

        afslog(&ctx, &cache, &mut tokens, &cells, Some("a.com"), None)?;
        assert_eq!(installed(&tokens), vec!["afs@a.com"]);

        let payload = tokens
            .key_store()
            .payload_of("afs@a.com")
            .expect("token missing");
        let mut reader = binrw::io::Cursor::new(payload);
        let token: TokenPayload = reader.read_ne().expect("Unable to parse token");
        assert_eq!(token.expiry, END);
        assert_eq!(token.ticket, b"a.com");
        Ok(())
    }

    #[test]
    fn test_afslog_explicit_realm() -> Result<(), KafsError> {
        // No domain_realm mapping, the realm is taken as given.
        let ctx = MemoryKrb5::default();
        let cache = cache_with(&["a.com"]);
        let mut tokens = TokenStore::new(MemoryKeyStore::default());
        let (_dir, cells) = cell_config("");

        afslog(&ctx, &cache, &mut tokens, &cells, Some("a.com"), Some("EXAMPLE.COM"))?;
        assert_eq!(installed(&tokens), vec!["afs@a.com"]);

        let r = afslog(&ctx, &cache, &mut tokens, &cells, Some("b.com"), None);
        assert!(matches!(r, Err(KafsError::NoRealm)));
        Ok(())
    }

    #[test]
    fn test_afslog_default_cells() -> Result<(), KafsError> {
        let ctx = krb5();
        let cache = cache_with(&["a.com", "b.com"]);
        let mut tokens = TokenStore::new(MemoryKeyStore::default());
        let (_dir, cells) = cell_config("a.com\nb.com\n");

        afslog(&ctx, &cache, &mut tokens, &cells, None, None)?;
        assert_eq!(installed(&tokens), vec!["afs@a.com", "afs@b.com"]);
        Ok(())
    }

    #[test]
    fn test_afslog_first_failure_aborts() {
        let ctx = krb5();
        // No ticket for b.com.
        let cache = cache_with(&["a.com", "c.com"]);
        let mut tokens = TokenStore::new(MemoryKeyStore::default());
        let (_dir, cells) = cell_config("a.com\nb.com\nc.com\n");

        let r = afslog(&ctx, &cache, &mut tokens, &cells, None, None);
        assert!(matches!(r, Err(KafsError::TicketNotFound)));
        assert_eq!(installed(&tokens), vec!["afs@a.com"]);
    }

    #[test]
    fn test_afslog_no_cells() {
        let ctx = krb5();
        let cache = cache_with(&[]);
        let mut tokens = TokenStore::new(MemoryKeyStore::default());
        let dir = tempfile::tempdir().expect("Unable to create tempdir");
        let cells = CellConfig::new(dir.path());

        let r = afslog(&ctx, &cache, &mut tokens, &cells, None, None);
        assert!(matches!(r, Err(KafsError::NoCells)));
    }

    #[test]
    fn test_afslog_twice_keeps_one_token() -> Result<(), KafsError> {
        let ctx = krb5();
        let cache = cache_with(&["a.com"]);
        let mut tokens = TokenStore::new(MemoryKeyStore::default());
        let (_dir, cells) = cell_config("a.com\n");

        afslog(&ctx, &cache, &mut tokens, &cells, None, None)?;
        afslog(&ctx, &cache, &mut tokens, &cells, None, None)?;
        assert_eq!(installed(&tokens), vec!["afs@a.com"]);
        Ok(())
    }

    #[test]
    fn test_unlog() -> Result<(), KafsError> {
        let ctx = krb5();
        let cache = cache_with(&["a.com", "b.com"]);
        let mut tokens = TokenStore::new(MemoryKeyStore::default());
        let (_dir, cells) = cell_config("a.com\nb.com\n");
        afslog(&ctx, &cache, &mut tokens, &cells, None, None)?;

        unlog(&mut tokens, Some("a.com"))?;
        assert_eq!(installed(&tokens), vec!["afs@b.com"]);

        assert!(matches!(
            unlog(&mut tokens, Some("a.com")),
            Err(KafsError::TokenNotFound)
        ));

        unlog(&mut tokens, None)?;
        assert!(installed(&tokens).is_empty());
        Ok(())
    }
}
