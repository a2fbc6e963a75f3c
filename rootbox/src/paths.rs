//! Chroot filesystem layout and path resolution.
//!
//! Every path that reads or writes inside the chroot must come from
//! [`ChrootLayout::chroot_path`]. Raw concatenation of the root directory
//! with caller-supplied fragments is forbidden; the single choke point makes
//! accidental escapes visible in review.

use std::path::{Path, PathBuf};

/// On-disk layout of a single buildroot.
///
/// - `basedir` contains everything the controller owns, including the lock
///   file and the chroot tree.
/// - `rootdir` (`basedir/root`) is the chroot root.
/// - `homedir` and `builddir` are chroot-internal paths where the build
///   user's tree lives (`builddir = homedir/build`).
#[derive(Debug, Clone)]
pub struct ChrootLayout {
    basedir: PathBuf,
    rootdir: PathBuf,
    homedir: String,
    builddir: String,
}

impl ChrootLayout {
    pub fn new(basedir: PathBuf, chroothome: &str) -> Self {
        let rootdir = basedir.join("root");
        let homedir = chroothome.trim_end_matches('/').to_string();
        let builddir = format!("{homedir}/build");
        Self {
            basedir,
            rootdir,
            homedir,
            builddir,
        }
    }

    pub fn basedir(&self) -> &Path {
        &self.basedir
    }

    pub fn rootdir(&self) -> &Path {
        &self.rootdir
    }

    /// Build user's home directory, as a chroot-internal path.
    pub fn homedir(&self) -> &str {
        &self.homedir
    }

    /// Build tree (`homedir/build`), as a chroot-internal path.
    pub fn builddir(&self) -> &str {
        &self.builddir
    }

    /// Resolve chroot-relative fragments to an absolute host path under
    /// `rootdir`.
    ///
    /// Fragments are joined with `/` and any doubled separator is collapsed,
    /// so callers may pass absolute chroot-internal paths (`/builddir`) or
    /// bare names (`etc`). The resolver does not interpret `..`; callers are
    /// expected to pass already-sanitized fragments.
    pub fn chroot_path<I, S>(&self, fragments: I) -> PathBuf
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut joined = self.rootdir.to_string_lossy().into_owned();
        for fragment in fragments {
            joined.push('/');
            joined.push_str(fragment.as_ref());
        }
        while joined.contains("//") {
            joined = joined.replace("//", "/");
        }
        PathBuf::from(joined)
    }
}
