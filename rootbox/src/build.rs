//! The source-package rebuild pipeline.
//!
//! Everything here runs as the build user — permanently dropped inside the
//! chroot for the rpm and rpmbuild children — with the mount set held and
//! unwound on every exit path. The two rpmbuild invocations are the only
//! timeout-enforced subprocesses.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::buildroot::{Buildroot, State};
use crate::error::{BuildrootError, Result};
use crate::exec::{ExecOutput, ExecSpec, Executor};
use crate::fsutil;
use crate::hooks::Stage;

impl<E: Executor> Buildroot<E> {
    /// Rebuild `srpm` into binary packages, capturing the build log and
    /// copying artifacts to the result directory.
    pub fn build(&mut self, srpm: &Path, timeout: Option<Duration>) -> Result<()> {
        self.fire_hooks(Stage::EarlyPrebuild)?;

        let result = self
            .mount_all()
            .and_then(|_| self.build_as_user(srpm, timeout));
        self.umount_all();
        result?;

        self.fire_hooks(Stage::Postbuild)?;
        Ok(())
    }

    /// Run the pipeline under the build identity; the administrator
    /// identity is restored on every exit path.
    fn build_as_user(&mut self, srpm: &Path, timeout: Option<Duration>) -> Result<()> {
        let guard = self
            .uid
            .become_user(self.uid.build_uid(), self.uid.build_gid())?;
        let result = self.build_phases(srpm, timeout);
        drop(guard);
        result
    }

    fn build_phases(&mut self, srpm: &Path, timeout: Option<Duration>) -> Result<()> {
        self.enter_state(State::Setup);

        let chroot_srpm = self.copy_srpm_into_chroot(srpm)?;
        let srpm_basename = chroot_srpm
            .rsplit('/')
            .next()
            .unwrap_or(chroot_srpm.as_str())
            .to_string();

        // install the source package; the child cannot regain privilege
        let install = self.build_user_spec(vec![
            "rpm".into(),
            "-Uvh".into(),
            "--nodeps".into(),
            chroot_srpm.clone(),
        ]);
        self.executor.run(&install, None)?;

        let spec_file = self.find_spec_file(&srpm_basename)?;
        let chroot_spec_file = self.chroot_relative(&spec_file)?;

        // rebuild the source package with the build log attached
        let rebuild_src = self
            .build_user_spec(vec![
                "rpmbuild".into(),
                "-bs".into(),
                "--target".into(),
                self.config.target_arch.clone(),
                "--nodeps".into(),
                chroot_spec_file.clone(),
            ])
            .timeout(timeout);
        self.run_logged(&rebuild_src)?;

        let rebuilt = self.find_rebuilt_srpm()?;
        self.install_srpm_deps(&[rebuilt.as_path()])?;

        self.enter_state(State::Build);
        self.fire_hooks(Stage::Prebuild)?;

        let rebuild_bin = self
            .build_user_spec(vec![
                "rpmbuild".into(),
                "-bb".into(),
                "--target".into(),
                self.config.target_arch.clone(),
                "--nodeps".into(),
                chroot_spec_file,
            ])
            .timeout(timeout);
        self.run_logged(&rebuild_bin)?;

        self.copy_artifacts_out()?;
        Ok(())
    }

    /// Spec for a command in the chroot, permanently dropped to the build
    /// user, with the build user's HOME.
    fn build_user_spec(&self, argv: Vec<String>) -> ExecSpec {
        self.chroot_spec(argv)
            .run_as(self.uid.build_uid(), self.uid.build_gid())
            .env("HOME", self.layout.homedir())
    }

    fn run_logged(&self, spec: &ExecSpec) -> Result<ExecOutput> {
        self.executor.run(spec, self.logs.build())
    }

    /// Copy the source package into `builddir/originals`, preserving
    /// metadata; returns the chroot-internal path.
    pub(crate) fn copy_srpm_into_chroot(&self, srpm: &Path) -> Result<String> {
        let filename = srpm
            .file_name()
            .ok_or_else(|| BuildrootError::Path(srpm.to_path_buf()))?
            .to_string_lossy()
            .into_owned();
        let dest = self
            .layout
            .chroot_path([self.layout.builddir(), "originals", filename.as_str()]);
        fsutil::copy_preserving(srpm, &dest)?;
        Ok(format!("{}/originals/{}", self.layout.builddir(), filename))
    }

    /// Exactly one spec file is expected under `SPECS`. None is fatal; more
    /// than one is an operator error and the first lexicographically is
    /// used, deterministically.
    fn find_spec_file(&self, srpm_basename: &str) -> Result<PathBuf> {
        let specs_dir = self.layout.chroot_path([self.layout.builddir(), "SPECS"]);
        let mut specs = files_with_suffix(&specs_dir, ".spec")?;
        specs.sort();
        match specs.len() {
            0 => Err(BuildrootError::Pkg(format!(
                "No Spec file found in srpm: {srpm_basename}"
            ))),
            1 => Ok(specs.remove(0)),
            n => {
                tracing::warn!(
                    count = n,
                    using = %specs[0].display(),
                    "multiple spec files in srpm; using the first"
                );
                Ok(specs.remove(0))
            }
        }
    }

    /// Exactly one rebuilt source package is expected under `SRPMS`.
    fn find_rebuilt_srpm(&self) -> Result<PathBuf> {
        let srpms_dir = self.layout.chroot_path([self.layout.builddir(), "SRPMS"]);
        let mut srpms = files_with_suffix(&srpms_dir, ".src.rpm")?;
        srpms.sort();
        if srpms.len() != 1 {
            return Err(BuildrootError::Pkg(format!(
                "expected exactly one rebuilt srpm, found {}",
                srpms.len()
            )));
        }
        Ok(srpms.remove(0))
    }

    /// Strip the rootdir prefix, yielding the path as seen inside the
    /// chroot.
    fn chroot_relative(&self, path: &Path) -> Result<String> {
        let relative = path
            .strip_prefix(self.layout.rootdir())
            .map_err(|_| BuildrootError::Path(path.to_path_buf()))?;
        Ok(format!("/{}", relative.display()))
    }

    fn copy_artifacts_out(&self) -> Result<()> {
        self.root_note("DEBUG", "copying packages to result dir");
        for subdir in ["RPMS", "SRPMS"] {
            let dir = self.layout.chroot_path([self.layout.builddir(), subdir]);
            for package in files_with_suffix(&dir, ".rpm")? {
                let Some(filename) = package.file_name() else {
                    continue;
                };
                fsutil::copy_preserving(&package, &self.resultdir.join(filename))?;
            }
        }
        Ok(())
    }
}

/// Regular files in `dir` whose name ends with `suffix`. A missing
/// directory yields the empty set.
fn files_with_suffix(dir: &Path, suffix: &str) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && entry.file_name().to_string_lossy().ends_with(suffix) {
            files.push(path);
        }
    }
    Ok(files)
}
