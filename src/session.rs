//! The login session policy behind the PAM module.
//!
//! On open the target user gets a PAG (local or shared, see [`SessionConfig`]) and
//! tokens for the default cells. The PAM handle remembers that tokens were fetched
//! so later callbacks in the same login neither fetch twice nor tear down what they
//! did not set up. Shared PAGs are never torn down, other logins may be using them.

use crate::afslog;
use crate::ccache::{self, Krb5Context};
use crate::cells::CellConfig;
use crate::constants::{DEFAULT_MINIMUM_UID, KRB5CCNAME, PAM_MODULE_NAME};
use crate::error::KafsError;
use crate::identity::{check_setuid_context, ignore_user, Credentials, IdentitySwitch, TargetUser};
use crate::keyring::{KeyStore, PagKind, TokenStore};
use crate::procfs::AfsProc;
use crate::profile::Profile;

use glob::Pattern;
use std::env;
use tracing::{debug, error, info, instrument, warn};

/// Facts recorded on the PAM handle for the rest of the login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Marker {
    /// Tokens were fetched.
    Afslog,
    /// A local PAG was chosen because of the cache's principals.
    Locpag,
}

impl Marker {
    pub fn key(self) -> &'static str {
        match self {
            Marker::Afslog => "pam-kafs-session-afslog",
            Marker::Locpag => "pam-kafs-session-locpag",
        }
    }
}

/// What the session engine needs from a PAM handle.
pub trait PamContext {
    fn user(&self) -> Result<String, KafsError>;

    fn service(&self) -> Result<String, KafsError>;

    fn getenv(&self, name: &str) -> Option<String>;

    fn putenv(&mut self, name: &str, value: &str) -> Result<(), KafsError>;

    fn marker(&self, marker: Marker) -> bool;

    fn set_marker(&mut self, marker: Marker, value: bool) -> Result<(), KafsError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PamEvent {
    OpenSession,
    CloseSession,
    EstablishCred,
    RefreshCred,
    DeleteCred,
}

impl PamEvent {
    fn is_session(self) -> bool {
        matches!(self, PamEvent::OpenSession | PamEvent::CloseSession)
    }

    /// Status to return when the session could not even be set up. Login must
    /// not fail because of AFS.
    pub fn init_failure_status(self) -> PamStatus {
        if self.is_session() {
            PamStatus::Success
        } else {
            PamStatus::Ignore
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PamStatus {
    Success,
    Ignore,
    SessionErr,
    CredErr,
}

/// Only a failure to switch identities is reported to PAM.
fn status_for(event: PamEvent, result: Result<(), KafsError>) -> PamStatus {
    match result {
        Ok(()) => PamStatus::Success,
        Err(err) if err.is_identity_error() => {
            error!(?err, ?event, "identity switch failed");
            if event.is_session() {
                PamStatus::SessionErr
            } else {
                PamStatus::CredErr
            }
        }
        Err(err) => {
            warn!(?err, ?event, "AFS session setup failed, continuing");
            PamStatus::Success
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub verbosity: u32,
    pub create_pag: bool,
    pub create_tokens: bool,
    pub minimum_uid: u32,
    pub shared_pag: bool,
    pub locpag_for_pam: Option<Pattern>,
    pub locpag_for_user: Option<Pattern>,
    pub locpag_for_principal: Option<Pattern>,
    /// Credential cache type to move the login's cache to, `FILE` or `KEYRING`.
    pub convert_cc_to: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            verbosity: 0,
            create_pag: true,
            create_tokens: true,
            minimum_uid: DEFAULT_MINIMUM_UID,
            shared_pag: false,
            locpag_for_pam: None,
            locpag_for_user: None,
            locpag_for_principal: None,
            convert_cc_to: None,
        }
    }
}

fn profile_pattern(profile: &Profile, realm: Option<&str>, option: &str) -> Option<Pattern> {
    let value = profile.appdefault_string(PAM_MODULE_NAME, realm, option)?;
    Pattern::new(value)
        .inspect_err(|err| warn!(?err, %option, %value, "ignoring invalid pattern"))
        .ok()
}

impl SessionConfig {
    /// Read the `pam-kafs-session` application defaults, with per realm overrides
    /// for the default realm.
    pub fn from_profile(profile: &Profile) -> Self {
        let app = PAM_MODULE_NAME;
        let realm = profile.default_realm();
        let d = SessionConfig::default();

        let convert_cc_to = profile
            .appdefault_string(app, realm, "convert_cc_to")
            .map(str::to_ascii_uppercase)
            .or_else(|| {
                profile
                    .appdefault_bool(app, realm, "convert_cc_to_kcm", false)
                    .then(|| "KCM".to_string())
            });

        SessionConfig {
            verbosity: profile.appdefault_number(app, realm, "verbosity", d.verbosity),
            create_pag: profile.appdefault_bool(app, realm, "create_pag", d.create_pag),
            create_tokens: profile.appdefault_bool(app, realm, "create_tokens", d.create_tokens),
            minimum_uid: profile.appdefault_number(app, realm, "minimum_uid", d.minimum_uid),
            shared_pag: profile.appdefault_bool(app, realm, "shared_pag", d.shared_pag),
            locpag_for_pam: profile_pattern(profile, realm, "locpag_for_pam"),
            locpag_for_user: profile_pattern(profile, realm, "locpag_for_user"),
            locpag_for_principal: profile_pattern(profile, realm, "locpag_for_principal"),
            convert_cc_to,
        }
    }
}

/// Everything about the login except the process identity, which is switched
/// around the work done here.
struct Login<P, K: KeyStore, X> {
    pam: P,
    config: SessionConfig,
    user: TargetUser,
    shared: bool,
    tokens: TokenStore<K>,
    krb5: X,
    cells: CellConfig,
    afs: AfsProc,
}

impl<P, K, X> Login<P, K, X>
where
    P: PamContext,
    K: KeyStore,
    X: Krb5Context,
{
    fn cache_name(&self) -> Result<String, KafsError> {
        self.pam
            .getenv(KRB5CCNAME)
            .or_else(|| env::var(KRB5CCNAME).ok())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                warn!("no KRB5CCNAME");
                KafsError::NoCredentialCache
            })
    }

    fn skip(&self) -> bool {
        if !self.afs.has_afs_support() {
            debug!("skipping, AFS apparently not available");
            return true;
        }
        ignore_user(self.user.uid, self.config.minimum_uid)
    }

    /// Whether the cache's principal, or any principal it holds a ticket for,
    /// asks for a local PAG.
    fn principal_wants_local_pag(&self) -> Result<bool, KafsError> {
        let Some(pattern) = &self.config.locpag_for_principal else {
            return Ok(false);
        };
        let cache = self.krb5.resolve_cache(&self.cache_name()?)?;

        let principal = cache.principal()?.to_string();
        if pattern.matches(&principal) {
            info!(%principal, "local PAG only for principal as requested");
            return Ok(true);
        }

        for credential in cache.credentials()? {
            if credential.is_config_entry() {
                continue;
            }
            let server = credential.server().to_string();
            if pattern.matches(&server) {
                info!(%server, "local PAG only for service principal as requested");
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn convert_cache(&mut self, target_type: &str) -> Result<(), KafsError> {
        let name = self.cache_name()?;
        let source = self.krb5.resolve_cache(&name)?;
        let converted = ccache::convert(&self.krb5, source.as_ref(), target_type, self.user.uid)?;
        if converted != name {
            self.pam.putenv(KRB5CCNAME, &converted)?;
        }
        Ok(())
    }

    fn fetch_tokens(&mut self) -> Result<(), KafsError> {
        let cache = self.krb5.resolve_cache(&self.cache_name()?)?;
        afslog::afslog(
            &self.krb5,
            cache.as_ref(),
            &mut self.tokens,
            &self.cells,
            None,
            None,
        )
    }

    /// The open work, run as the user. Returns whether the login should now be
    /// marked as having fetched tokens.
    fn create(&mut self, mut already: bool) -> Result<bool, KafsError> {
        if self.shared && self.principal_wants_local_pag()? {
            self.shared = false;
            self.pam.set_marker(Marker::Locpag, true)?;
        }

        if self.config.create_pag && self.tokens.current_pag_kind()? == PagKind::None {
            self.tokens.join_pag(self.shared)?;
            // An empty keyring, whatever was fetched before is gone.
            already = false;
        }

        if let Some(target_type) = self.config.convert_cc_to.clone() {
            if let Err(err) = self.convert_cache(&target_type) {
                warn!(?err, %target_type, "unable to convert credential cache");
            }
        }

        if self.config.create_tokens && !already {
            self.fetch_tokens().inspect_err(|err| error!(?err, "unable to afslog"))?;
        }

        Ok(!already)
    }

    fn destroy(&mut self) -> Result<(), KafsError> {
        self.tokens.revoke_all_tokens()?;
        if let Err(err) = self.tokens.revoke_pag() {
            warn!(?err, "unable to revoke PAG");
        }
        Ok(())
    }

    fn in_shared_pag(&self) -> bool {
        match self.tokens.current_pag_kind() {
            Ok(PagKind::Shared) => true,
            Ok(PagKind::Local) => false,
            Ok(PagKind::None) | Err(_) => self.shared,
        }
    }
}

pub struct Session<P, K, C, X>
where
    K: KeyStore,
    C: Credentials,
{
    identity: IdentitySwitch<C>,
    login: Login<P, K, X>,
}

impl<P, K, C, X> Session<P, K, C, X>
where
    P: PamContext,
    K: KeyStore,
    C: Credentials,
    X: Krb5Context,
{
    /// Set up the session for the PAM user. The PAG flavour is settled here from
    /// the configuration, the PAM service and the user name.
    pub fn new(
        pam: P,
        config: SessionConfig,
        keys: K,
        creds: C,
        krb5: X,
    ) -> Result<Self, KafsError> {
        check_setuid_context(&creds)?;

        let name = pam.user().inspect_err(|_| error!("no username provided"))?;
        let user = creds.lookup_user(&name).ok_or_else(|| {
            error!(%name, "unable to look up user");
            KafsError::UnknownUser
        })?;

        let mut shared = config.shared_pag;
        if shared {
            if let Some(pattern) = &config.locpag_for_pam {
                let service = pam.service()?;
                if pattern.matches(&service) {
                    info!(%service, "local PAG only for PAM service as requested");
                    shared = false;
                }
            }
        }
        if shared {
            if let Some(pattern) = &config.locpag_for_user {
                if pattern.matches(&user.name) {
                    info!(user = %user.name, "local PAG only for user as requested");
                    shared = false;
                }
            }
        }
        if pam.marker(Marker::Locpag) {
            debug!("local PAG recorded for this login");
            shared = false;
        }

        Ok(Session {
            identity: IdentitySwitch::new(creds, user.uid, user.gid),
            login: Login {
                pam,
                config,
                user,
                shared,
                tokens: TokenStore::new(keys),
                krb5,
                cells: CellConfig::default(),
                afs: AfsProc::default(),
            },
        })
    }

    pub fn with_cells(mut self, cells: CellConfig) -> Self {
        self.login.cells = cells;
        self
    }

    pub fn with_afs(mut self, afs: AfsProc) -> Self {
        self.login.afs = afs;
        self
    }

    pub fn user(&self) -> &TargetUser {
        &self.login.user
    }

    /// Whether a PAG created now would be shared.
    pub fn shared(&self) -> bool {
        self.login.shared
    }

    #[cfg(test)]
    pub(crate) fn pam(&self) -> &P {
        &self.login.pam
    }

    #[cfg(test)]
    pub(crate) fn tokens(&self) -> &TokenStore<K> {
        &self.login.tokens
    }

    #[cfg(test)]
    pub(crate) fn credentials_mut(&mut self) -> &mut C {
        self.identity.credentials_mut()
    }

    #[cfg(test)]
    pub(crate) fn credentials(&self) -> &C {
        self.identity.credentials()
    }

    /// Join a PAG if there is none and fetch tokens unless this login already has.
    #[instrument(level = "debug", skip(self), fields(user = %self.login.user.name))]
    pub fn open(&mut self) -> Result<(), KafsError> {
        if self.login.skip() {
            return Ok(());
        }

        let already = self.login.pam.marker(Marker::Afslog);
        let login = &mut self.login;
        let record = self.identity.run(|| login.create(already))?;

        if record {
            self.login.pam.set_marker(Marker::Afslog, true)?;
        }
        Ok(())
    }

    /// Fetch tokens again, leaving the PAG as it is.
    #[instrument(level = "debug", skip(self), fields(user = %self.login.user.name))]
    pub fn refresh(&mut self) -> Result<(), KafsError> {
        if self.login.skip() {
            return Ok(());
        }
        if !self.login.config.create_tokens {
            debug!("token creation disabled");
            return Ok(());
        }

        let login = &mut self.login;
        self.identity.run(|| login.fetch_tokens())
    }

    /// Drop the tokens this login fetched, and its PAG if that is local.
    #[instrument(level = "debug", skip(self), fields(user = %self.login.user.name))]
    pub fn delete(&mut self) -> Result<(), KafsError> {
        if self.login.skip() {
            return Ok(());
        }

        if !self.login.pam.marker(Marker::Afslog) {
            debug!("no tokens fetched in this login");
            return Ok(());
        }
        if self.login.in_shared_pag() {
            debug!("leaving tokens in shared PAG");
            return Ok(());
        }
        if !self.login.config.create_tokens {
            return Ok(());
        }

        let login = &mut self.login;
        self.identity.run(|| login.destroy())?;

        self.login.pam.set_marker(Marker::Afslog, false)
    }

    pub fn handle(&mut self, event: PamEvent) -> PamStatus {
        debug!(?event, "pam event");
        let result = match event {
            PamEvent::OpenSession | PamEvent::EstablishCred => self.open(),
            PamEvent::RefreshCred => self.refresh(),
            PamEvent::DeleteCred => self.delete(),
            PamEvent::CloseSession => Ok(()),
        };
        status_for(event, result)
    }
}
