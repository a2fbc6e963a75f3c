//! Package-manager bridge.
//!
//! Every package-manager invocation is composed here: installroot pointing
//! at the chroot, the cache-only flag when offline, hook notification
//! around the subprocess, and translation of any underlying failure into
//! the package-manager error kind.

use std::path::Path;

use crate::buildroot::Buildroot;
use crate::error::{BuildrootError, Result};
use crate::exec::{ExecSpec, Executor};
use crate::hooks::Stage;
use crate::srpm::uniq_requires;

pub const YUM_PATH: &str = "/usr/bin/yum";

impl<E: Executor> Buildroot<E> {
    /// Run one package-manager command against the chroot.
    ///
    /// Fires `preyum` immediately before and `postyum` immediately after a
    /// successful invocation. Returns the captured output when
    /// `return_output` is set.
    pub fn yum(&mut self, args: &[String], return_output: bool) -> Result<String> {
        let mut argv = vec![
            YUM_PATH.to_string(),
            "--installroot".to_string(),
            self.rootdir().to_string_lossy().into_owned(),
        ];
        if !self.config.online {
            argv.push("-C".to_string());
        }
        argv.extend(args.iter().cloned());

        let spec = ExecSpec::new(argv).personality(self.personality);
        self.root_note("DEBUG", &spec.display());

        self.fire_hooks(Stage::PreYum)?;
        let output = self
            .executor
            .run(&spec, None)
            .map_err(|e| BuildrootError::Yum(e.to_string()))?;
        self.fire_hooks(Stage::PostYum)?;

        Ok(if return_output {
            output.output
        } else {
            String::new()
        })
    }

    /// Install the named packages into the chroot, with the mount set held
    /// for the duration.
    pub fn yum_install(&mut self, packages: &[String]) -> Result<()> {
        let mut args = vec!["install".to_string()];
        args.extend(packages.iter().cloned());
        self.with_mounts(|this| this.yum(&args, true).map(|_| ()))
    }

    /// Bring the chroot's package set up to date.
    pub fn yum_update(&mut self) -> Result<()> {
        self.with_mounts(|this| this.yum(&["update".to_string()], true).map(|_| ()))
    }

    /// Resolve and install the build requirements of the given source
    /// packages.
    ///
    /// The argument list is seeded with the pre-existing dependency
    /// fragment; each package's textual build requirements are merged with
    /// the configured additions. An unresolvable requirement aborts before
    /// anything is installed; installation itself runs elevated to root,
    /// and on every exit path the enclosing identity is re-assumed — called
    /// from the build pipeline, that is the build user, which goes on to
    /// copy the artifacts out.
    pub fn install_srpm_deps(&mut self, srpms: &[&Path]) -> Result<()> {
        let mut args = shell_words::split(&self.pre_existing_deps).map_err(|e| {
            BuildrootError::Build(format!("bad pre-existing dependency fragment: {e}"))
        })?;

        for srpm in srpms {
            let header = self.inspector.inspect(srpm)?;
            let extra = self
                .config
                .more_buildreqs
                .get(&header.name)
                .cloned()
                .unwrap_or_default();
            args.extend(uniq_requires([header.build_requires, extra]));
        }

        if args.is_empty() {
            return Ok(());
        }

        let mut resolve = vec!["resolvedep".to_string()];
        resolve.extend(args.iter().cloned());
        let output = self.yum(&resolve, true)?;
        for line in output.lines() {
            if line.to_lowercase().contains("no package found for") {
                return Err(BuildrootError::Build(format!(
                    "Bad build req: {line}. Exiting."
                )));
            }
        }

        let guard = self.uid.become_user(0, 0)?;
        let mut install = vec!["install".to_string()];
        install.extend(args);
        let result = self.yum(&install, true);
        drop(guard);
        result.map(|_| ())
    }

    /// Run `body` with the chroot mount set held; unmount on every exit
    /// path.
    pub(crate) fn with_mounts<T>(
        &mut self,
        body: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let result = self.mount_all().and_then(|_| body(self));
        self.umount_all();
        result
    }
}
