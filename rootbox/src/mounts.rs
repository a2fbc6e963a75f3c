//! Registry of the virtual-filesystem mounts inside the chroot.
//!
//! Two parallel ordered lists: mount commands and unmount commands. Mounting
//! is all-or-nothing at every observable boundary — a failed mount aborts
//! and the caller runs the unmount list, which is best-effort in list order
//! so a crashed phase never leaves kernel mounts behind.
//!
//! The commands go through the external `mount`/`umount` binaries rather
//! than direct syscalls; the kernel mount table then matches what sibling
//! tooling expects to find and clean up.

use crate::paths::ChrootLayout;

/// One mount invocation, stored as the exact argv it renders to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec(Vec<String>);

/// One unmount invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UmountSpec(Vec<String>);

impl MountSpec {
    fn new(fstype: &str, tag: &str, target: &std::path::Path) -> Self {
        Self(vec![
            "mount".into(),
            "-n".into(),
            "-t".into(),
            fstype.into(),
            tag.into(),
            target.to_string_lossy().into_owned(),
        ])
    }

    pub fn argv(&self) -> &[String] {
        &self.0
    }
}

impl UmountSpec {
    fn new(target: &std::path::Path) -> Self {
        Self(vec![
            "umount".into(),
            "-n".into(),
            target.to_string_lossy().into_owned(),
        ])
    }

    pub fn argv(&self) -> &[String] {
        &self.0
    }
}

/// Ordered mount/unmount command lists for one chroot.
#[derive(Debug, Clone)]
pub struct MountRegistry {
    mounts: Vec<MountSpec>,
    umounts: Vec<UmountSpec>,
}

impl MountRegistry {
    /// The initial set: `proc` and `sysfs` bound into the chroot.
    pub fn for_chroot(layout: &ChrootLayout) -> Self {
        Self {
            mounts: vec![
                MountSpec::new("proc", "mock_chroot_proc", &layout.chroot_path(["proc"])),
                MountSpec::new("sysfs", "mock_chroot_sysfs", &layout.chroot_path(["sys"])),
            ],
            umounts: vec![
                UmountSpec::new(&layout.chroot_path(["proc"])),
                UmountSpec::new(&layout.chroot_path(["sys"])),
            ],
        }
    }

    /// Append the `devpts` pair used when device population is enabled.
    /// Appending the same pair twice is a no-op (deduplicated by exact
    /// spec).
    pub fn enable_devpts(&mut self, layout: &ChrootLayout) {
        let target = layout.chroot_path(["/dev/pts"]);
        let mount = MountSpec::new("devpts", "mock_chroot_devpts", &target);
        let umount = UmountSpec::new(&target);
        if !self.mounts.contains(&mount) {
            self.mounts.push(mount);
        }
        if !self.umounts.contains(&umount) {
            self.umounts.push(umount);
        }
    }

    pub fn mounts(&self) -> &[MountSpec] {
        &self.mounts
    }

    /// Unmount commands, issued in list order — deliberately not the
    /// reverse of the mount order.
    pub fn umounts(&self) -> &[UmountSpec] {
        &self.umounts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn layout() -> ChrootLayout {
        ChrootLayout::new(PathBuf::from("/var/lib/rootbox/f-x86_64"), "/builddir")
    }

    #[test]
    fn initial_set_is_proc_then_sys() {
        let reg = MountRegistry::for_chroot(&layout());
        let argvs: Vec<_> = reg.mounts().iter().map(|m| m.argv().join(" ")).collect();
        assert_eq!(
            argvs,
            [
                "mount -n -t proc mock_chroot_proc /var/lib/rootbox/f-x86_64/root/proc",
                "mount -n -t sysfs mock_chroot_sysfs /var/lib/rootbox/f-x86_64/root/sys",
            ]
        );
        let umounts: Vec<_> = reg.umounts().iter().map(|m| m.argv().join(" ")).collect();
        assert_eq!(
            umounts,
            [
                "umount -n /var/lib/rootbox/f-x86_64/root/proc",
                "umount -n /var/lib/rootbox/f-x86_64/root/sys",
            ]
        );
    }

    #[test]
    fn devpts_is_appended_once() {
        let l = layout();
        let mut reg = MountRegistry::for_chroot(&l);
        reg.enable_devpts(&l);
        reg.enable_devpts(&l);
        assert_eq!(reg.mounts().len(), 3);
        assert_eq!(reg.umounts().len(), 3);
        assert_eq!(
            reg.mounts()[2].argv().join(" "),
            "mount -n -t devpts mock_chroot_devpts /var/lib/rootbox/f-x86_64/root/dev/pts"
        );
    }
}
