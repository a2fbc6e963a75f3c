//! The buildroot controller.
//!
//! One controller owns one buildroot: the exclusive lock, the chroot tree,
//! the mount set, the log sinks, and the hook pipeline. Operations execute
//! on a single administrative thread; concurrency exists only in spawned
//! subprocesses and in sibling controller processes contending for the
//! same base directory.
//!
//! The lifecycle `impl` is split across this file (construction, state,
//! `clean`, `init`), `yum.rs` (package-manager bridge), `user.rs` (build
//! user provisioning), and `build.rs` (the rebuild pipeline).

use std::fmt;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use crate::config::BuildrootConfig;
use crate::error::Result;
use crate::exec::{ExecOutput, ExecSpec, Executor, HostExecutor, Personality};
use crate::fsutil;
use crate::hooks::{Hook, HookRegistry, Stage};
use crate::lock::BuildrootLock;
use crate::logging::BuildLogs;
use crate::mounts::MountRegistry;
use crate::paths::ChrootLayout;
use crate::plugins::{self, PluginRegistry};
use crate::srpm::{RpmQueryInspector, SrpmInspector};
use crate::uid::UidManager;

/// Lifecycle states, logged to the state sink on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unstarted,
    InitPlugins,
    Start,
    Clean,
    LockBuildroot,
    Init,
    RunningYum,
    Setup,
    Build,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Unstarted => "unstarted",
            State::InitPlugins => "init plugins",
            State::Start => "start",
            State::Clean => "clean",
            State::LockBuildroot => "lock buildroot",
            State::Init => "init",
            State::RunningYum => "running yum",
            State::Setup => "setup",
            State::Build => "build",
        })
    }
}

/// Skeleton directories created inside the chroot during init.
const SKELETON_DIRS: &[&str] = &[
    "var/lib/rpm",
    "var/lib/yum",
    "var/log",
    "var/lock/rpm",
    "etc/rpm",
    "tmp",
    "var/tmp",
    "etc/yum.repos.d",
    "etc/yum",
    "proc",
    "sys",
];

/// Files touched (created empty if absent) during init.
const TOUCH_FILES: &[&[&str]] = &[
    &["etc", "mtab"],
    &["etc", "fstab"],
    &["var", "log", "yum.log"],
];

/// Controls setup and teardown of one chroot build environment.
pub struct Buildroot<E: Executor> {
    pub(crate) config: BuildrootConfig,
    pub(crate) layout: ChrootLayout,
    pub(crate) shared_root_name: String,
    pub(crate) resultdir: PathBuf,
    pub(crate) personality: Option<Personality>,
    pub(crate) uid: UidManager,
    pub(crate) lock: Option<BuildrootLock>,
    pub(crate) state: State,
    pub(crate) was_cleaned: bool,
    /// Whitespace-quoted argument fragment prepended to every dependency
    /// resolution.
    pub(crate) pre_existing_deps: String,
    pub(crate) hooks: HookRegistry,
    pub(crate) mounts: MountRegistry,
    pub(crate) logs: BuildLogs,
    pub(crate) executor: E,
    pub(crate) inspector: Box<dyn SrpmInspector>,
}

impl Buildroot<HostExecutor> {
    /// Build a controller running real subprocesses, with the built-in
    /// plugin set.
    pub fn new(config: BuildrootConfig) -> Result<Self> {
        Self::with_executor(config, HostExecutor::new(), PluginRegistry::builtin())
    }
}

impl<E: Executor> Buildroot<E> {
    /// Build a controller with an injected executor and plugin registry.
    ///
    /// Plugin initialization runs here: the controller passes through
    /// `init plugins` and reaches `start` before this returns.
    pub fn with_executor(
        config: BuildrootConfig,
        executor: E,
        plugin_registry: PluginRegistry,
    ) -> Result<Self> {
        config.validate()?;

        let shared_root_name = config.shared_root_name();
        let basedir = config.basedir.join(&shared_root_name);
        let layout = ChrootLayout::new(basedir, &config.chroothome);
        let resultdir = config.interpolated_resultdir()?;
        let personality = config
            .internal_setarch
            .then(|| Personality::for_arch(&config.target_arch));
        let uid = UidManager::new(config.chrootuid, config.chrootgid);
        let mounts = MountRegistry::for_chroot(&layout);

        let mut controller = Self {
            config,
            layout,
            shared_root_name,
            resultdir,
            personality,
            uid,
            lock: None,
            state: State::Unstarted,
            was_cleaned: false,
            pre_existing_deps: String::new(),
            hooks: HookRegistry::new(),
            mounts,
            logs: BuildLogs::default(),
            executor,
            inspector: Box::new(RpmQueryInspector::new()),
        };

        controller.enter_state(State::InitPlugins);
        plugins::init_plugins(
            &controller.config,
            &plugin_registry,
            &mut controller.hooks,
        )?;

        controller.enter_state(State::Start);
        Ok(controller)
    }

    /// Replace the source-package header collaborator.
    pub fn set_srpm_inspector(&mut self, inspector: Box<dyn SrpmInspector>) {
        self.inspector = inspector;
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn state(&self) -> State {
        self.state
    }

    pub fn layout(&self) -> &ChrootLayout {
        &self.layout
    }

    pub fn basedir(&self) -> &Path {
        self.layout.basedir()
    }

    pub fn rootdir(&self) -> &Path {
        self.layout.rootdir()
    }

    pub fn resultdir(&self) -> &Path {
        &self.resultdir
    }

    pub fn shared_root_name(&self) -> &str {
        &self.shared_root_name
    }

    pub fn was_cleaned(&self) -> bool {
        self.was_cleaned
    }

    /// Register a lifecycle hook. Duplicate keys per stage register once.
    pub fn add_hook(&mut self, stage: Stage, key: impl Into<String>, hook: Hook) {
        self.hooks.add(stage, key, hook);
    }

    /// Seed the whitespace-quoted argument fragment prepended to every
    /// dependency resolution.
    pub fn set_pre_existing_deps(&mut self, fragment: impl Into<String>) {
        self.pre_existing_deps = fragment.into();
    }

    // =========================================================================
    // State machine & logging
    // =========================================================================

    pub(crate) fn enter_state(&mut self, state: State) {
        self.state = state;
        tracing::info!(state = %state, root = %self.shared_root_name, "state changed");
        if let Some(log) = self.logs.state() {
            log.write_line("INFO", &format!("State Changed: {state}"));
        }
    }

    /// Write a record to the root log (and the library diagnostics).
    pub(crate) fn root_note(&self, level: &str, message: &str) {
        match level {
            "DEBUG" => tracing::debug!("{message}"),
            _ => tracing::info!("{message}"),
        }
        if let Some(log) = self.logs.root() {
            log.write_line(level, message);
        }
    }

    /// Attach the state/root/build file sinks under the result directory.
    /// Runs under temporarily-dropped privilege; attaching more than once
    /// is a no-op.
    pub fn reset_logging(&mut self) -> Result<()> {
        if self.logs.attached() {
            return Ok(());
        }
        let _guard = self.uid.drop_privs_temp()?;
        self.logs.attach(
            &self.resultdir,
            &self.config.state_log_fmt_str,
            &self.config.root_log_fmt_str,
            &self.config.build_log_fmt_str,
        )?;
        Ok(())
    }

    // =========================================================================
    // Locking
    // =========================================================================

    /// Take the exclusive lock on the base directory. A lock already held
    /// and still current is kept; a handle made stale by `clean` is
    /// replaced. Failure to open the lock file is tolerated (the base
    /// directory may not exist yet); contention is fatal.
    pub(crate) fn try_lock_buildroot(&mut self) -> Result<()> {
        self.enter_state(State::LockBuildroot);
        if let Some(lock) = &self.lock {
            if lock.is_current(self.layout.basedir()) {
                return Ok(());
            }
        }
        if let Some(lock) = BuildrootLock::acquire(self.layout.basedir())? {
            self.lock = Some(lock);
        }
        Ok(())
    }

    // =========================================================================
    // Hooks & subprocess plumbing
    // =========================================================================

    pub(crate) fn fire_hooks(&mut self, stage: Stage) -> Result<()> {
        self.hooks.fire(stage)
    }

    /// Spec for an argv executed inside the chroot with the controller's
    /// personality, as the administrator.
    pub(crate) fn chroot_spec(&self, argv: Vec<String>) -> ExecSpec {
        ExecSpec::new(argv)
            .chroot(self.layout.rootdir())
            .personality(self.personality)
    }

    /// Execute an argv inside the chroot.
    pub fn chroot_exec(&self, argv: &[String]) -> Result<ExecOutput> {
        let spec = self.chroot_spec(argv.to_vec());
        self.executor.run(&spec, None)
    }

    /// Issue every mount command in order; the first failure aborts and the
    /// caller must run [`Buildroot::umount_all`].
    pub(crate) fn mount_all(&self) -> Result<()> {
        for mount in self.mounts.mounts() {
            let spec = ExecSpec::new(mount.argv().iter().cloned());
            self.root_note("DEBUG", &spec.display());
            self.executor.run(&spec, None)?;
        }
        Ok(())
    }

    /// Issue every unmount command in list order, best-effort.
    pub(crate) fn umount_all(&self) {
        for umount in self.mounts.umounts() {
            let spec = ExecSpec::new(umount.argv().iter().cloned()).check(false);
            self.root_note("DEBUG", &spec.display());
            if let Err(e) = self.executor.run(&spec, None) {
                tracing::debug!(error = %e, "unmount failed (ignored)");
            }
        }
    }

    // =========================================================================
    // Lifecycle: clean & init
    // =========================================================================

    /// Remove the buildroot entirely. Safe when it does not exist.
    pub fn clean(&mut self) -> Result<()> {
        self.try_lock_buildroot()?;
        self.enter_state(State::Clean);
        fsutil::rmtree_if_exists(self.layout.basedir())?;
        self.was_cleaned = true;
        Ok(())
    }

    /// Construct the chroot: directory skeleton, package-manager
    /// configuration, device nodes, bootstrap package set, and the build
    /// user's tree.
    pub fn init(&mut self) -> Result<()> {
        self.enter_state(State::Init);

        fsutil::mkdir_if_absent(self.layout.basedir())?;
        fsutil::mkdir_if_absent(self.layout.rootdir())?;

        {
            let _guard = self.uid.drop_privs_temp()?;
            if let Err(e) = fsutil::mkdir_if_absent(&self.resultdir) {
                tracing::debug!(error = %e, "result dir creation tolerated failure");
            }
        }

        self.try_lock_buildroot()?;
        self.reset_logging()?;

        self.root_note("DEBUG", &format!("rootdir = {}", self.rootdir().display()));
        self.root_note("DEBUG", &format!("resultdir = {}", self.resultdir.display()));

        self.fire_hooks(Stage::PreInit)?;

        self.root_note("DEBUG", "create skeleton dirs");
        for dir in SKELETON_DIRS {
            fsutil::mkdir_if_absent(&self.layout.chroot_path([*dir]))?;
        }

        self.root_note("DEBUG", "touch required files");
        for fragments in TOUCH_FILES {
            fsutil::touch(&self.layout.chroot_path(fragments.iter().copied()))?;
        }

        self.write_yum_config()?;
        if self.config.use_host_resolv {
            self.propagate_resolv_conf()?;
        }
        self.write_configured_files()?;

        if self.config.internal_dev_setup {
            crate::devices::setup_dev(&self.layout, &self.executor)?;
            self.mounts.enable_devpts(&self.layout);
        }

        self.enter_state(State::RunningYum);
        let bootstrap = self.bootstrap_command()?;
        let result = self
            .mount_all()
            .and_then(|_| self.yum(&bootstrap, true).map(|_| ()));
        self.umount_all();
        result?;

        self.make_build_user()?;
        self.build_dir_setup()?;

        self.fire_hooks(Stage::PostInit)?;
        Ok(())
    }

    /// The package-manager bootstrap: the configured setup command after a
    /// clean, a plain update otherwise.
    pub(crate) fn bootstrap_command(&self) -> Result<Vec<String>> {
        if self.was_cleaned {
            shell_words::split(&self.config.chroot_setup_cmd).map_err(|e| {
                crate::error::BuildrootError::Config(format!(
                    "chroot_setup_cmd does not tokenize: {e}"
                ))
            })
        } else {
            Ok(vec!["update".to_string()])
        }
    }

    fn write_yum_config(&self) -> Result<()> {
        self.root_note("DEBUG", "configure yum");
        // always truncate and overwrite
        fs::write(
            self.layout.chroot_path(["etc", "yum", "yum.conf"]),
            &self.config.yum_conf,
        )?;

        // relative symlink etc/yum.conf -> yum/yum.conf
        let alias = self.layout.chroot_path(["etc", "yum.conf"]);
        match fs::remove_file(&alias) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        symlink("yum/yum.conf", &alias)?;
        Ok(())
    }

    fn propagate_resolv_conf(&self) -> Result<()> {
        let target = self.layout.chroot_path(["etc", "resolv.conf"]);
        match fs::remove_file(&target) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        fsutil::copy_preserving(Path::new("/etc/resolv.conf"), &target)?;
        Ok(())
    }

    /// Write each configured file body that does not already exist.
    fn write_configured_files(&self) -> Result<()> {
        for (path, body) in &self.config.files {
            let target = self.layout.chroot_path([path.as_str()]);
            if !target.exists() {
                fs::write(&target, body)?;
            }
        }
        Ok(())
    }
}
