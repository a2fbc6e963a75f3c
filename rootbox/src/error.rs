//! Error taxonomy for buildroot operations.
//!
//! Every fatal condition maps to one variant; callers match on the kind,
//! not on message text. Best-effort operations (unmount-all, context
//! labelling, userdel/groupdel) never surface here — they are swallowed at
//! the call site.

use std::path::PathBuf;

/// Errors produced by the buildroot controller.
#[derive(Debug, thiserror::Error)]
pub enum BuildrootError {
    /// Another controller holds the exclusive lock on this buildroot.
    #[error("build root is locked by another process")]
    Locked,

    /// A chroot invariant was violated (e.g. the user-creation tool is
    /// missing after bootstrap).
    #[error("chroot error: {0}")]
    Root(String),

    /// A package-manager invocation failed; carries the underlying text.
    #[error("package manager failed: {0}")]
    Yum(String),

    /// Dependency resolution reported an unresolvable requirement.
    #[error("{0}")]
    Build(String),

    /// Unexpected spec-file cardinality or missing rebuilt source package.
    #[error("{0}")]
    Pkg(String),

    /// Plugin discovery or initialization failed.
    #[error("plugin error: {0}")]
    Plugin(String),

    /// The configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Subprocess spawn/wait plumbing failed, including timeouts.
    #[error("command failed: {0}")]
    Exec(String),

    /// Could not change or restore the process identity.
    #[error("privilege change failed: {0}")]
    Privilege(String),

    /// A path escaped the expected tree or could not be represented.
    #[error("bad path: {}", .0.display())]
    Path(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BuildrootError>;

impl BuildrootError {
    /// Whether this error kind is tolerated during early clean
    /// (pre-lock-open and result-directory creation).
    pub fn is_transient_io(&self) -> bool {
        matches!(self, BuildrootError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locked_message_is_stable() {
        let err = BuildrootError::Locked;
        assert_eq!(err.to_string(), "build root is locked by another process");
    }

    #[test]
    fn io_errors_are_transient() {
        let err = BuildrootError::from(std::io::Error::other("disk on fire"));
        assert!(err.is_transient_io());
        assert!(!BuildrootError::Locked.is_transient_io());
    }
}
