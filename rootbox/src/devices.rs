//! Device node population for the chroot's `dev/` tree.
//!
//! The tree is rebuilt from scratch on every init: remove, recreate
//! `dev/pts`, create the fixed node set with umask zero, then the stdio
//! symlinks. Security-context labelling is copied from the host equivalent
//! of each node when the host supports it; hosts without mandatory access
//! control simply skip it.

use std::os::unix::fs::symlink;

use nix::sys::stat::{Mode, SFlag, makedev, mknod, umask};

use crate::error::Result;
use crate::exec::{ExecSpec, Executor};
use crate::fsutil;
use crate::paths::ChrootLayout;

/// One character device node in the chroot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceNode {
    pub path: &'static str,
    pub mode: u32,
    pub major: u64,
    pub minor: u64,
}

/// The fixed node set, created in order.
pub const CHROOT_DEVICES: &[DeviceNode] = &[
    DeviceNode { path: "dev/null", mode: 0o666, major: 1, minor: 3 },
    DeviceNode { path: "dev/zero", mode: 0o666, major: 1, minor: 5 },
    DeviceNode { path: "dev/random", mode: 0o666, major: 1, minor: 8 },
    DeviceNode { path: "dev/urandom", mode: 0o444, major: 1, minor: 9 },
    DeviceNode { path: "dev/tty", mode: 0o666, major: 5, minor: 0 },
    DeviceNode { path: "dev/console", mode: 0o600, major: 5, minor: 1 },
    DeviceNode { path: "dev/ptmx", mode: 0o666, major: 5, minor: 2 },
];

/// stdio symlinks created after the nodes, `(link under dev/, target)`.
pub const STDIO_LINKS: &[(&str, &str)] = &[
    ("dev/stdin", "/proc/self/fd/0"),
    ("dev/stdout", "/proc/self/fd/1"),
    ("dev/stderr", "/proc/self/fd/2"),
];

/// Restores the previous process umask on drop.
struct UmaskGuard {
    previous: Mode,
}

impl UmaskGuard {
    fn set(mode: Mode) -> Self {
        Self {
            previous: umask(mode),
        }
    }
}

impl Drop for UmaskGuard {
    fn drop(&mut self) {
        umask(self.previous);
    }
}

/// Reset and repopulate the chroot's `dev/` tree.
///
/// Requires the administrator identity (mknod). The previous umask is
/// restored on every exit path.
pub fn setup_dev<E: Executor>(layout: &ChrootLayout, executor: &E) -> Result<()> {
    fsutil::rmtree_if_exists(&layout.chroot_path(["dev"]))?;
    fsutil::mkdir_if_absent(&layout.chroot_path(["dev", "pts"]))?;

    let _umask = UmaskGuard::set(Mode::empty());

    for node in CHROOT_DEVICES {
        let target = layout.chroot_path([node.path]);
        mknod(
            &target,
            SFlag::S_IFCHR,
            Mode::from_bits_truncate(node.mode),
            makedev(node.major, node.minor),
        )
        .map_err(std::io::Error::from)?;

        // Label from the host's node. No MAC on the host is fine.
        let chcon = ExecSpec::new([
            "chcon".to_string(),
            format!("--reference=/{}", node.path),
            target.to_string_lossy().into_owned(),
        ])
        .check(false);
        if let Err(e) = executor.run(&chcon, None) {
            tracing::debug!(node = node.path, error = %e, "context copy skipped");
        }
    }

    for (link, target) in STDIO_LINKS {
        symlink(target, layout.chroot_path([*link]))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_table_matches_contract() {
        let expected: &[(&str, u32, u64, u64)] = &[
            ("dev/null", 0o666, 1, 3),
            ("dev/zero", 0o666, 1, 5),
            ("dev/random", 0o666, 1, 8),
            ("dev/urandom", 0o444, 1, 9),
            ("dev/tty", 0o666, 5, 0),
            ("dev/console", 0o600, 5, 1),
            ("dev/ptmx", 0o666, 5, 2),
        ];
        assert_eq!(CHROOT_DEVICES.len(), expected.len());
        for (node, (path, mode, major, minor)) in CHROOT_DEVICES.iter().zip(expected) {
            assert_eq!(node.path, *path);
            assert_eq!(node.mode, *mode, "{}", node.path);
            assert_eq!((node.major, node.minor), (*major, *minor), "{}", node.path);
        }
    }

    #[test]
    fn stdio_links_point_at_proc_fds() {
        assert_eq!(
            STDIO_LINKS,
            &[
                ("dev/stdin", "/proc/self/fd/0"),
                ("dev/stdout", "/proc/self/fd/1"),
                ("dev/stderr", "/proc/self/fd/2"),
            ]
        );
    }

    #[test]
    fn umask_guard_restores() {
        let original = umask(Mode::from_bits_truncate(0o022));
        umask(Mode::from_bits_truncate(0o022));
        {
            let _guard = UmaskGuard::set(Mode::empty());
            // while held, the umask is zero
            let observed = umask(Mode::empty());
            assert_eq!(observed, Mode::empty());
        }
        let restored = umask(original);
        assert_eq!(restored, Mode::from_bits_truncate(0o022));
    }
}
