//! Scoped privilege transitions between the administrator and the build
//! user.
//!
//! The process-wide effective uid/gid is global state; it is only ever
//! mutated through guards that restore, on drop, the identity that was in
//! effect when the scope was entered. Scopes therefore stack: elevating to
//! root in the middle of a build-user scope pops back to the build user,
//! not to the administrator, and every exit path — including early returns
//! and errors — unwinds exactly one level. Raw drop/restore calls are not
//! part of the public surface.
//!
//! When the controller is not running as root the kernel would refuse every
//! identity change, so the manager degrades to a no-op and the whole
//! lifecycle runs under the invoking user. That keeps rootless smoke runs
//! and the test suite viable; a production build host runs the controller
//! as root.

use nix::unistd::{Gid, Uid, setegid, seteuid};

use crate::error::{BuildrootError, Result};

/// Mediates between the administrator identity captured at construction and
/// the unprivileged build identity from the configuration.
#[derive(Debug, Clone, Copy)]
pub struct UidManager {
    admin_uid: Uid,
    build_uid: Uid,
    build_gid: Gid,
}

impl UidManager {
    /// Capture the current effective identity as the administrator and
    /// remember the build identity for [`UidManager::drop_privs_temp`].
    pub fn new(build_uid: u32, build_gid: u32) -> Self {
        Self {
            admin_uid: Uid::effective(),
            build_uid: Uid::from_raw(build_uid),
            build_gid: Gid::from_raw(build_gid),
        }
    }

    /// Whether identity transitions are real on this host.
    pub fn privileged(&self) -> bool {
        self.admin_uid.is_root()
    }

    pub fn build_uid(&self) -> u32 {
        self.build_uid.as_raw()
    }

    pub fn build_gid(&self) -> u32 {
        self.build_gid.as_raw()
    }

    /// Temporarily assume the unprivileged build identity. The returned
    /// guard restores the enclosing identity when dropped.
    pub fn drop_privs_temp(&self) -> Result<PrivGuard> {
        self.become_user(self.build_uid.as_raw(), self.build_gid.as_raw())
    }

    /// Assume an arbitrary identity for the enclosing scope. Used when the
    /// surrounding work must run as a specific user (the build user during
    /// home population, root during dependency installation).
    ///
    /// The guard remembers the identity in effect right now and restores it
    /// on drop, so nested scopes pop one level at a time.
    ///
    /// Subprocesses that must be unable to regain privilege drop
    /// permanently inside the child instead, via the executor.
    pub fn become_user(&self, uid: u32, gid: u32) -> Result<PrivGuard> {
        if !self.privileged() {
            tracing::debug!(uid, gid, "not running as root; identity left unchanged");
            return Ok(PrivGuard { restore: None });
        }
        let enclosing = (Uid::effective(), Gid::effective());
        setegid(Gid::from_raw(gid)).map_err(|e| {
            BuildrootError::Privilege(format!("setegid({gid}) failed: {e}"))
        })?;
        if let Err(e) = seteuid(Uid::from_raw(uid)) {
            // Unwind the half-applied transition before reporting.
            let _ = setegid(enclosing.1);
            return Err(BuildrootError::Privilege(format!(
                "seteuid({uid}) failed: {e}"
            )));
        }
        tracing::trace!(uid, gid, "assumed identity");
        Ok(PrivGuard {
            restore: Some(enclosing),
        })
    }
}

/// Restores the identity captured at guard creation when dropped.
/// Restoration is idempotent: re-asserting an identity the process already
/// holds succeeds.
#[must_use = "dropping the guard immediately restores the enclosing identity"]
pub struct PrivGuard {
    restore: Option<(Uid, Gid)>,
}

impl Drop for PrivGuard {
    fn drop(&mut self) {
        let Some((uid, gid)) = self.restore.take() else {
            return;
        };
        // gid first, mirroring the transition: the real ids still belong to
        // the administrator, so the gid change is permitted from either
        // direction, while a uid-first downward restore would shed the
        // privilege the gid change needs.
        if let Err(e) = setegid(gid) {
            tracing::error!(error = %e, "failed to restore enclosing gid");
        }
        if let Err(e) = seteuid(uid) {
            tracing::error!(error = %e, "failed to restore enclosing uid");
        }
    }
}
