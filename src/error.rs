#[derive(Debug)]
pub enum KafsError {
    // =========================================================================================
    // Keep the payload of these variants to raw errno values. Anything more descriptive
    // (cell names, paths, uids) is reported with error! at the raise site, so that the
    // variant alone tells you which step failed without dragging user data into contexts
    // like PAM return paths.
    // =========================================================================================
    /// kAFS is not loaded on this host.
    AfsNotPresent,

    // Cell and realm resolution
    NoCells,
    NoRealm,
    CellDatabaseWrite,
    RootCellWrite,

    // Kerberos credentials
    NoCredentialCache,
    CredentialCacheError,
    UnsupportedCredentialCacheType,
    TicketNotFound,
    TicketTooLarge,
    InvalidPrincipal,
    UnsupportedEncryption,
    InvalidEncryptionKey,

    // Kernel keyring
    TokenNotFound,
    KeyutilsError(errno::Errno),

    // Identity transitions. These are the only errors that PAM must surface.
    EnterUserGid(errno::Errno),
    EnterUserUid(errno::Errno),
    EnterUserEuid(errno::Errno),
    LeaveUser(errno::Errno),

    // Session setup
    NoUserName,
    UnknownUser,
    SetuidContext,
    PamItemUnavailable,
    PamDataError,

    IoError,
    BinRWError,

    /// No really, do you have a time machine? How did you go back to before 1970?
    DoYouHaveATimeMachine,
}

impl KafsError {
    /// True when the process credentials could not be switched or restored. Callers
    /// must never swallow these: the uid/gid state of the process is in question.
    pub fn is_identity_error(&self) -> bool {
        matches!(
            self,
            KafsError::EnterUserGid(_)
                | KafsError::EnterUserUid(_)
                | KafsError::EnterUserEuid(_)
                | KafsError::LeaveUser(_)
        )
    }
}
