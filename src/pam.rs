//! The `pam_kafs_session` module. Build with `--features pam` and install the
//! cdylib as `pam_kafs_session.so`.

use crate::error::KafsError;
use crate::identity::ProcessCredentials;
use crate::keyring::KernelKeyStore;
use crate::profile::Profile;
use crate::session::{Marker, PamContext, PamEvent, PamStatus, Session, SessionConfig};

use pamsm::{pam_module, Pam, PamData, PamError, PamFlags, PamLibExt, PamServiceModule};
use tracing::{debug, error, Level};

#[derive(Debug, Clone)]
struct MarkerData(bool);

impl PamData for MarkerData {
    fn cleanup(&self, _pam: Pam, _flags: PamFlags, _status: PamError) {}
}

struct PamHandle {
    pamh: Pam,
}

impl PamContext for PamHandle {
    fn user(&self) -> Result<String, KafsError> {
        match self.pamh.get_user(None) {
            Ok(Some(user)) => user
                .to_str()
                .map(String::from)
                .map_err(|_| KafsError::NoUserName),
            Ok(None) => Err(KafsError::NoUserName),
            Err(err) => {
                error!(?err, "pam_get_user failed");
                Err(KafsError::NoUserName)
            }
        }
    }

    fn service(&self) -> Result<String, KafsError> {
        match self.pamh.get_service() {
            Ok(Some(service)) => Ok(service.to_string_lossy().to_string()),
            Ok(None) => Err(KafsError::PamItemUnavailable),
            Err(err) => {
                error!(?err, "no PAM service name");
                Err(KafsError::PamItemUnavailable)
            }
        }
    }

    fn getenv(&self, name: &str) -> Option<String> {
        self.pamh
            .getenv(name)
            .ok()
            .flatten()
            .map(|v| v.to_string_lossy().to_string())
    }

    fn putenv(&mut self, name: &str, value: &str) -> Result<(), KafsError> {
        self.pamh.putenv(&format!("{name}={value}")).map_err(|err| {
            error!(?err, %name, "pam_putenv failed");
            KafsError::PamDataError
        })
    }

    fn marker(&self, marker: Marker) -> bool {
        // SAFETY: data under the marker keys is only ever set by this module, as
        // a MarkerData.
        let data = unsafe { self.pamh.retrieve_data::<MarkerData>(marker.key()) };
        matches!(data, Ok(MarkerData(true)))
    }

    fn set_marker(&mut self, marker: Marker, value: bool) -> Result<(), KafsError> {
        // SAFETY: as above.
        unsafe { self.pamh.send_data(marker.key(), MarkerData(value)) }.map_err(|err| {
            error!(?err, key = marker.key(), "cannot set module data");
            KafsError::PamDataError
        })
    }
}

/// 0 logs errors only, 1 adds notices, 2 and up adds debugging.
fn init_logging(verbosity: u32) {
    let level = match verbosity {
        0 => Level::ERROR,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };
    // A second module instance in the same process already installed one.
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .try_init();
}

type PamSession = Session<PamHandle, KernelKeyStore, ProcessCredentials, Profile>;

fn start(pamh: Pam) -> Result<PamSession, KafsError> {
    let profile = Profile::load()?;
    let config = SessionConfig::from_profile(&profile);
    init_logging(config.verbosity);

    Session::new(
        PamHandle { pamh },
        config,
        KernelKeyStore,
        ProcessCredentials,
        profile,
    )
}

fn run(pamh: Pam, event: PamEvent) -> PamError {
    let status = match start(pamh) {
        Ok(mut session) => session.handle(event),
        Err(err) => {
            debug!(?err, ?event, "kafs session not set up");
            event.init_failure_status()
        }
    };

    match status {
        PamStatus::Success => PamError::SUCCESS,
        PamStatus::Ignore => PamError::IGNORE,
        PamStatus::SessionErr => PamError::SESSION_ERR,
        PamStatus::CredErr => PamError::CRED_ERR,
    }
}

fn setcred_event(flags: PamFlags) -> PamEvent {
    if flags.contains(PamFlags::DELETE_CRED) {
        PamEvent::DeleteCred
    } else if flags.intersects(PamFlags::REINITIALIZE_CRED | PamFlags::REFRESH_CRED) {
        PamEvent::RefreshCred
    } else {
        PamEvent::EstablishCred
    }
}

struct PamKafsSession;

impl PamServiceModule for PamKafsSession {
    fn open_session(pamh: Pam, _flags: PamFlags, _args: Vec<String>) -> PamError {
        run(pamh, PamEvent::OpenSession)
    }

    fn close_session(_pamh: Pam, _flags: PamFlags, _args: Vec<String>) -> PamError {
        PamError::SUCCESS
    }

    fn setcred(pamh: Pam, flags: PamFlags, _args: Vec<String>) -> PamError {
        run(pamh, setcred_event(flags))
    }

    // Only here so that setcred gets called.
    fn authenticate(_pamh: Pam, _flags: PamFlags, _args: Vec<String>) -> PamError {
        PamError::SUCCESS
    }
}

pam_module!(PamKafsSession);
