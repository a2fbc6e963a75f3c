//! Build user provisioning inside the chroot.
//!
//! The account is recreated from scratch on every init: blow away the home
//! tree, delete any stale user/group (ignoring failure), then groupadd and
//! the configured useradd template. The account comes out of useradd
//! locked; the password field's `!!` prefix is stripped so the build tool
//! can switch into it while the account keeps no usable password.

use std::fs;
use std::os::unix::fs::PermissionsExt;

use nix::unistd::Uid;

use crate::buildroot::Buildroot;
use crate::error::{BuildrootError, Result};
use crate::exec::Executor;
use crate::fsutil;

pub const BUILD_USER: &str = "rootbuild";
pub const BUILD_GROUP: &str = "rootbuild";

/// Subdirectories of the build tree, created in order.
pub const BUILD_SUBDIRS: &[&str] = &["RPMS", "SRPMS", "SOURCES", "SPECS", "BUILD", "originals"];

/// Render the configured useradd template with the account details.
pub(crate) fn render_useradd(
    template: &str,
    uid: u32,
    gid: u32,
    user: &str,
    group: &str,
    home: &str,
) -> String {
    template
        .replace("{uid}", &uid.to_string())
        .replace("{gid}", &gid.to_string())
        .replace("{user}", user)
        .replace("{group}", group)
        .replace("{home}", home)
}

impl<E: Executor> Buildroot<E> {
    /// Create the unprivileged build account inside the chroot.
    pub(crate) fn make_build_user(&mut self) -> Result<()> {
        if !self.layout.chroot_path(["usr/sbin/useradd"]).exists() {
            return Err(BuildrootError::Root(
                "could not find useradd in chroot, maybe the install failed?".into(),
            ));
        }

        fsutil::rmtree_if_exists(&self.layout.chroot_path([self.layout.homedir()]))?;

        let uid = self.uid.build_uid();
        let gid = self.uid.build_gid();

        // stale accounts from a previous run may or may not exist
        let userdel = self
            .chroot_spec(vec![
                "/usr/sbin/userdel".into(),
                "-r".into(),
                BUILD_USER.into(),
            ])
            .check(false);
        let _ = self.executor.run(&userdel, None);
        let groupdel = self
            .chroot_spec(vec!["/usr/sbin/groupdel".into(), BUILD_GROUP.into()])
            .check(false);
        let _ = self.executor.run(&groupdel, None);

        let groupadd = self.chroot_spec(vec![
            "/usr/sbin/groupadd".into(),
            "-g".into(),
            gid.to_string(),
            BUILD_GROUP.into(),
        ]);
        self.executor.run(&groupadd, None)?;

        let rendered = render_useradd(
            &self.config.useradd,
            uid,
            gid,
            BUILD_USER,
            BUILD_GROUP,
            self.layout.homedir(),
        );
        let argv = shell_words::split(&rendered)
            .map_err(|e| BuildrootError::Config(format!("useradd template does not tokenize: {e}")))?;
        let useradd = self.chroot_spec(argv);
        self.executor.run(&useradd, None)?;

        // unlock the fresh account: strip the leading !! from its password field
        let unlock = self.chroot_spec(vec![
            "sed".into(),
            "-i".into(),
            format!("s/^{BUILD_USER}:!!/{BUILD_USER}:/"),
            "/etc/passwd".into(),
        ]);
        self.executor.run(&unlock, None)?;
        Ok(())
    }

    /// Populate the build user's home tree, running as the build user.
    pub(crate) fn build_dir_setup(&mut self) -> Result<()> {
        let guard = self
            .uid
            .become_user(self.uid.build_uid(), self.uid.build_gid())?;
        let result = self.build_dir_setup_unprivileged();
        drop(guard);
        result
    }

    fn build_dir_setup_unprivileged(&mut self) -> Result<()> {
        for subdir in BUILD_SUBDIRS {
            fsutil::mkdir_if_absent(&self.layout.chroot_path([self.layout.builddir(), *subdir]))?;
        }

        let home = self.layout.chroot_path([self.layout.homedir()]);
        let build_uid = Uid::from_raw(self.uid.build_uid());
        for entry in walkdir::WalkDir::new(&home).min_depth(1) {
            let entry = entry
                .map_err(|e| BuildrootError::Root(format!("walking {}: {e}", home.display())))?;
            nix::unistd::chown(entry.path(), Some(build_uid), None)
                .map_err(std::io::Error::from)?;
            fs::set_permissions(entry.path(), fs::Permissions::from_mode(0o755))?;
        }

        let mut body = String::new();
        for (key, value) in &self.config.macros {
            body.push_str(key);
            body.push(' ');
            body.push_str(value);
            body.push('\n');
        }
        fs::write(
            self.layout.chroot_path([self.layout.homedir(), ".rpmmacros"]),
            body,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buildroot::Buildroot;
    use crate::config::tests::test_config;
    use crate::exec::testing::{RecordingExecutor, Script};
    use crate::plugins::PluginRegistry;

    fn controller(
        basedir: &std::path::Path,
    ) -> (Buildroot<RecordingExecutor>, RecordingExecutor) {
        let executor = RecordingExecutor::new(Script::all_ok());
        let handle = executor.clone();
        let root =
            Buildroot::with_executor(test_config(basedir), executor, PluginRegistry::builtin())
                .unwrap();
        (root, handle)
    }

    #[test]
    fn useradd_template_substitutes_details() {
        let rendered = render_useradd(
            "/usr/sbin/useradd -m -u {uid} -g {gid} -d {home} -n {user}",
            1024,
            1025,
            "rootbuild",
            "rootbuild",
            "/builddir",
        );
        assert_eq!(
            rendered,
            "/usr/sbin/useradd -m -u 1024 -g 1025 -d /builddir -n rootbuild"
        );
    }

    #[test]
    fn missing_useradd_in_chroot_is_root_error() {
        let dir = tempfile::tempdir().unwrap();
        let (mut root, _handle) = controller(dir.path());

        let err = root.make_build_user().unwrap_err();
        match err {
            BuildrootError::Root(msg) => assert!(msg.contains("useradd"), "{msg}"),
            other => panic!("expected Root error, got {other:?}"),
        }
    }

    #[test]
    fn account_recreation_command_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let (mut root, handle) = controller(dir.path());
        fsutil::mkdir_if_absent(&root.layout().chroot_path(["usr/sbin"])).unwrap();
        std::fs::write(root.layout().chroot_path(["usr/sbin/useradd"]), "").unwrap();

        root.make_build_user().unwrap();

        let calls = handle.calls();
        let programs: Vec<&str> = calls.iter().map(|c| c.argv[0].as_str()).collect();
        assert_eq!(
            programs,
            [
                "/usr/sbin/userdel",
                "/usr/sbin/groupdel",
                "/usr/sbin/groupadd",
                "/usr/sbin/useradd",
                "sed",
            ]
        );
        // deletions tolerate absence, creations do not
        assert!(!calls[0].check);
        assert!(!calls[1].check);
        assert!(calls[2].check);
        // everything runs inside the chroot
        assert!(calls.iter().all(|c| c.chroot.is_some()));
        // the unlock edit targets the passwd file
        assert!(calls[4].argv.contains(&"/etc/passwd".to_string()));
    }

    #[test]
    fn build_dir_setup_creates_tree_and_macros() {
        let dir = tempfile::tempdir().unwrap();
        let (mut root, _handle) = controller(dir.path());
        root.config
            .macros
            .insert("%_topdir".into(), "/builddir/build".into());
        root.config
            .macros
            .insert("%_rpmfilename".into(), "%%{NAME}.rpm".into());

        root.build_dir_setup().unwrap();

        for subdir in BUILD_SUBDIRS {
            assert!(
                root.layout()
                    .chroot_path(["/builddir/build", *subdir])
                    .is_dir(),
                "{subdir} missing"
            );
        }
        let macros =
            std::fs::read_to_string(root.layout().chroot_path(["/builddir", ".rpmmacros"]))
                .unwrap();
        assert_eq!(macros, "%_rpmfilename %%{NAME}.rpm\n%_topdir /builddir/build\n");
    }

    #[test]
    fn build_tree_entries_are_world_readable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let (mut root, _handle) = controller(dir.path());
        root.build_dir_setup().unwrap();

        let specs = root.layout().chroot_path(["/builddir/build", "SPECS"]);
        let mode = std::fs::metadata(&specs).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
