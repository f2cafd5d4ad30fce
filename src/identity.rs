//! Switching a privileged process to the identity of the user whose keyring it is
//! about to touch, and back again.
//!
//! Keys and keyrings are owned by whoever is the effective user when they are
//! created, so a PAM module running as root has to become the target user first.
//! `enter` either applies the whole target identity or none of it. `leave` tries
//! every restoration step even if one fails.

use crate::error::KafsError;

use errno::Errno;
use tracing::{debug, error, trace};

/// A user from the passwd database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUser {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
}

/// The process credentials and the syscalls that change them.
pub trait Credentials {
    fn uid(&self) -> u32;
    fn euid(&self) -> u32;
    fn gid(&self) -> u32;
    fn egid(&self) -> u32;

    /// `setregid(gid, -1)`
    fn set_real_gid(&mut self, gid: u32) -> Result<(), Errno>;

    /// `setreuid(uid, -1)`
    fn set_real_uid(&mut self, uid: u32) -> Result<(), Errno>;

    /// `seteuid(uid)`
    fn set_effective_uid(&mut self, uid: u32) -> Result<(), Errno>;

    fn lookup_user(&self, name: &str) -> Option<TargetUser>;
}

fn check(rc: libc::c_int) -> Result<(), Errno> {
    if rc < 0 {
        Err(errno::errno())
    } else {
        Ok(())
    }
}

/// The credentials of this process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessCredentials;

impl Credentials for ProcessCredentials {
    fn uid(&self) -> u32 {
        uzers::get_current_uid()
    }

    fn euid(&self) -> u32 {
        uzers::get_effective_uid()
    }

    fn gid(&self) -> u32 {
        uzers::get_current_gid()
    }

    fn egid(&self) -> u32 {
        uzers::get_effective_gid()
    }

    fn set_real_gid(&mut self, gid: u32) -> Result<(), Errno> {
        // SAFETY: setregid has no memory safety requirements. -1 leaves the
        // effective gid unchanged.
        check(unsafe { libc::setregid(gid, libc::gid_t::MAX) })
    }

    fn set_real_uid(&mut self, uid: u32) -> Result<(), Errno> {
        // SAFETY: as above.
        check(unsafe { libc::setreuid(uid, libc::uid_t::MAX) })
    }

    fn set_effective_uid(&mut self, uid: u32) -> Result<(), Errno> {
        // SAFETY: as above.
        check(unsafe { libc::seteuid(uid) })
    }

    fn lookup_user(&self, name: &str) -> Option<TargetUser> {
        uzers::get_user_by_name(name).map(|user| TargetUser {
            name: user.name().to_string_lossy().to_string(),
            uid: user.uid(),
            gid: user.primary_group_id(),
        })
    }
}

/// Root and system accounts never get a PAG or tokens.
pub fn ignore_user(uid: u32, minimum_uid: u32) -> bool {
    let ignore = uid == 0 || uid < minimum_uid;
    if ignore {
        debug!(%uid, %minimum_uid, "ignoring low uid user");
    }
    ignore
}

/// Refuse to work for a setuid or setgid caller, whose real ids are not ours to
/// trust.
pub fn check_setuid_context<C: Credentials + ?Sized>(creds: &C) -> Result<(), KafsError> {
    if creds.uid() != creds.euid() || creds.gid() != creds.egid() {
        error!(
            uid = creds.uid(),
            euid = creds.euid(),
            gid = creds.gid(),
            egid = creds.egid(),
            "setuid context ignored"
        );
        return Err(KafsError::SetuidContext);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityState {
    Original,
    AsTarget,
}

#[derive(Debug, Clone, Copy)]
struct Snapshot {
    uid: u32,
    euid: u32,
    gid: u32,
}

pub struct IdentitySwitch<C: Credentials> {
    creds: C,
    target_uid: u32,
    target_gid: u32,
    original: Snapshot,
    state: IdentityState,
}

impl<C: Credentials> IdentitySwitch<C> {
    /// Record the current identity as the one `leave` returns to.
    pub fn new(creds: C, target_uid: u32, target_gid: u32) -> Self {
        let original = Snapshot {
            uid: creds.uid(),
            euid: creds.euid(),
            gid: creds.gid(),
        };
        IdentitySwitch {
            creds,
            target_uid,
            target_gid,
            original,
            state: IdentityState::Original,
        }
    }

    pub fn state(&self) -> IdentityState {
        self.state
    }

    #[cfg(test)]
    pub(crate) fn credentials(&self) -> &C {
        &self.creds
    }

    #[cfg(test)]
    pub(crate) fn credentials_mut(&mut self) -> &mut C {
        &mut self.creds
    }

    fn log_ids(&self, what: &str) {
        trace!(
            uid = self.creds.uid(),
            euid = self.creds.euid(),
            gid = self.creds.gid(),
            "{what}"
        );
    }

    fn restore_gid(&mut self) {
        if self.target_gid != self.original.gid {
            if let Err(errno) = self.creds.set_real_gid(self.original.gid) {
                error!(?errno, gid = self.original.gid, "unable to change GID back");
            }
        }
    }

    fn restore_uid(&mut self) {
        if self.target_uid != self.original.uid {
            if let Err(errno) = self.creds.set_real_uid(self.original.uid) {
                error!(?errno, uid = self.original.uid, "unable to change UID back");
            }
        }
    }

    /// Become the target user: real gid, then real uid, then effective uid. A
    /// failing step undoes the steps before it, in reverse order.
    pub fn enter(&mut self) -> Result<(), KafsError> {
        if self.state == IdentityState::AsTarget {
            debug!("already running as the target user");
            return Ok(());
        }
        self.log_ids("entering user");

        let (uid, gid) = (self.target_uid, self.target_gid);

        if gid != self.original.gid {
            self.creds.set_real_gid(gid).map_err(|errno| {
                error!(?errno, %gid, "unable to change GID temporarily");
                KafsError::EnterUserGid(errno)
            })?;
        }

        if uid != self.original.uid {
            if let Err(errno) = self.creds.set_real_uid(uid) {
                error!(?errno, %uid, "unable to change UID temporarily");
                self.restore_gid();
                return Err(KafsError::EnterUserUid(errno));
            }
        }

        if uid != self.original.euid {
            if let Err(errno) = self.creds.set_effective_uid(uid) {
                error!(?errno, %uid, "unable to change EUID temporarily");
                self.restore_uid();
                self.restore_gid();
                return Err(KafsError::EnterUserEuid(errno));
            }
        }

        self.state = IdentityState::AsTarget;
        self.log_ids("entered user");
        Ok(())
    }

    /// Return to the original identity: effective uid, then real uid, then real
    /// gid. Every step is attempted. The first failure is returned.
    pub fn leave(&mut self) -> Result<(), KafsError> {
        if self.state == IdentityState::Original {
            return Ok(());
        }
        self.log_ids("leaving user");

        let mut first_err: Option<Errno> = None;

        if self.target_uid != self.original.euid {
            if let Err(errno) = self.creds.set_effective_uid(self.original.euid) {
                error!(?errno, euid = self.original.euid, "unable to change EUID back");
                first_err.get_or_insert(errno);
            }
        }

        if self.target_uid != self.original.uid {
            if let Err(errno) = self.creds.set_real_uid(self.original.uid) {
                error!(?errno, uid = self.original.uid, "unable to change UID back");
                first_err.get_or_insert(errno);
            }
        }

        if self.target_gid != self.original.gid {
            if let Err(errno) = self.creds.set_real_gid(self.original.gid) {
                error!(?errno, gid = self.original.gid, "unable to change GID back");
                first_err.get_or_insert(errno);
            }
        }

        self.state = IdentityState::Original;
        self.log_ids("left user");

        match first_err {
            Some(errno) => Err(KafsError::LeaveUser(errno)),
            None => Ok(()),
        }
    }

    /// Run `work` as the target user. A failure to switch back takes precedence
    /// over the result of `work`.
    pub fn run<T, F>(&mut self, work: F) -> Result<T, KafsError>
    where
        F: FnOnce() -> Result<T, KafsError>,
    {
        self.enter()?;
        let result = work();
        self.leave()?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockCredentials;

    fn ids(creds: &MockCredentials) -> (u32, u32, u32) {
        (creds.uid, creds.euid, creds.gid)
    }

    #[test]
    fn test_ignore_user() {
        assert!(ignore_user(0, 1000));
        assert!(ignore_user(0, 0));
        assert!(ignore_user(999, 1000));
        assert!(!ignore_user(1000, 1000));
        assert!(!ignore_user(65000, 1000));
        assert!(!ignore_user(1, 0));
    }

    #[test]
    fn test_enter_leave_permutations() -> Result<(), KafsError> {
        // (target uid, target gid) against a root caller: both differ, uid only,
        // gid only, neither.
        for (uid, gid) in [(1000, 1000), (1000, 0), (0, 1000), (0, 0)] {
            let mut switch = IdentitySwitch::new(MockCredentials::root(), uid, gid);

            switch.enter()?;
            assert_eq!(switch.state(), IdentityState::AsTarget);
            assert_eq!(ids(switch.credentials()), (uid, uid, gid));

            switch.leave()?;
            assert_eq!(switch.state(), IdentityState::Original);
            assert_eq!(ids(switch.credentials()), (0, 0, 0));
        }
        Ok(())
    }

    #[test]
    fn test_enter_skips_unchanged_ids() -> Result<(), KafsError> {
        let mut switch = IdentitySwitch::new(MockCredentials::root(), 0, 0);
        switch.enter()?;
        switch.leave()?;
        assert!(switch.credentials().calls.is_empty());
        Ok(())
    }

    #[test]
    fn test_enter_order() -> Result<(), KafsError> {
        let mut switch = IdentitySwitch::new(MockCredentials::root(), 1000, 100);
        switch.enter()?;
        switch.leave()?;
        assert_eq!(
            switch.credentials().calls,
            vec![
                "setregid(100)",
                "setreuid(1000)",
                "seteuid(1000)",
                "seteuid(0)",
                "setreuid(0)",
                "setregid(0)",
            ]
        );
        Ok(())
    }

    #[test]
    fn test_enter_uid_failure_rolls_back_gid() {
        let mut creds = MockCredentials::root();
        creds.fail_uid = true;
        let mut switch = IdentitySwitch::new(creds, 1000, 100);

        let r = switch.enter();
        assert!(matches!(r, Err(KafsError::EnterUserUid(_))));
        assert_eq!(switch.state(), IdentityState::Original);
        assert_eq!(ids(switch.credentials()), (0, 0, 0));
    }

    #[test]
    fn test_enter_euid_failure_rolls_back_everything() {
        let mut creds = MockCredentials::root();
        creds.fail_euid = true;
        let mut switch = IdentitySwitch::new(creds, 1000, 100);

        let r = switch.enter();
        assert!(matches!(r, Err(KafsError::EnterUserEuid(_))));
        assert_eq!(ids(switch.credentials()), (0, 0, 0));
        assert_eq!(
            switch.credentials().calls,
            vec!["setregid(100)", "setreuid(1000)", "setreuid(0)", "setregid(0)"]
        );
    }

    #[test]
    fn test_enter_gid_failure_changes_nothing() {
        let mut creds = MockCredentials::root();
        creds.fail_gid = true;
        let mut switch = IdentitySwitch::new(creds, 1000, 100);

        assert!(matches!(switch.enter(), Err(KafsError::EnterUserGid(_))));
        assert_eq!(ids(switch.credentials()), (0, 0, 0));
    }

    #[test]
    fn test_leave_keeps_going_after_failure() -> Result<(), KafsError> {
        let mut switch = IdentitySwitch::new(MockCredentials::root(), 1000, 100);
        switch.enter()?;
        switch.credentials_mut().fail_euid = true;

        let r = switch.leave();
        assert!(matches!(r, Err(KafsError::LeaveUser(_))));
        // The real ids were still restored.
        assert_eq!(ids(switch.credentials()), (0, 1000, 0));
        Ok(())
    }

    #[test]
    fn test_run_leaves_after_work_error() {
        let mut switch = IdentitySwitch::new(MockCredentials::root(), 1000, 100);
        let r: Result<(), KafsError> = switch.run(|| Err(KafsError::TicketNotFound));
        assert!(matches!(r, Err(KafsError::TicketNotFound)));
        assert_eq!(ids(switch.credentials()), (0, 0, 0));
    }

    #[test]
    fn test_setuid_context() {
        assert!(check_setuid_context(&MockCredentials::root()).is_ok());

        let mut creds = MockCredentials::root();
        creds.uid = 1000;
        assert!(matches!(
            check_setuid_context(&creds),
            Err(KafsError::SetuidContext)
        ));

        let mut creds = MockCredentials::root();
        creds.egid = 5;
        assert!(check_setuid_context(&creds).is_err());
    }
}
