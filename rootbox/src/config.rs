//! Validated buildroot configuration.
//!
//! The controller is constructed from a [`BuildrootConfig`] that has passed
//! [`BuildrootConfig::validate`]. Option names follow the configuration-file
//! vocabulary (`unique-ext`, `yum.conf`), mapped onto struct fields via
//! serde renames.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{BuildrootError, Result};

fn default_true() -> bool {
    true
}

fn default_resultdir() -> String {
    "%(basedir)s/%(root)s/result".to_string()
}

fn default_chroot_setup_cmd() -> String {
    "install buildsys-build".to_string()
}

fn default_useradd() -> String {
    "/usr/sbin/useradd -m -u {uid} -g {gid} -d {home} -n {user}".to_string()
}

fn default_build_log_fmt() -> String {
    "%(message)s".to_string()
}

fn default_root_log_fmt() -> String {
    "%(asctime)s %(levelname)s %(message)s".to_string()
}

fn default_state_log_fmt() -> String {
    "%(asctime)s - %(message)s".to_string()
}

/// Recognized configuration options for one buildroot.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildrootConfig {
    /// Stable name identifying the buildroot (e.g. `fedora-x86_64`).
    pub root: String,

    /// Optional uniqueness tag appended to `root`, for running several
    /// controllers against distinct copies of the same configuration.
    #[serde(rename = "unique-ext", default)]
    pub unique_ext: Option<String>,

    /// Parent directory under which the buildroot lives; the controller's
    /// base directory is `basedir/<shared root name>`.
    pub basedir: PathBuf,

    /// Architecture passed to the build tool's `--target`.
    pub target_arch: String,

    /// Build user's home directory inside the chroot.
    #[serde(default = "default_chroothome")]
    pub chroothome: String,

    /// Apply an execution personality matching `target_arch` to
    /// subprocesses.
    #[serde(default)]
    pub internal_setarch: bool,

    /// Result directory template, interpolated with `%(key)s` references to
    /// the other options. Every scalar option is addressable (strings,
    /// paths, booleans, ids); the collection-valued options (`files`,
    /// `macros`, `more_buildreqs`, `plugins`, `plugin_conf`) are not.
    #[serde(default = "default_resultdir")]
    pub resultdir: String,

    pub chrootuid: u32,
    pub chrootgid: u32,

    /// Body of the package manager configuration written into the chroot.
    #[serde(rename = "yum.conf", default)]
    pub yum_conf: String,

    /// Copy the host's `/etc/resolv.conf` into the chroot during init.
    #[serde(default = "default_true")]
    pub use_host_resolv: bool,

    /// Extra files written during init when absent, keyed by
    /// chroot-relative path.
    #[serde(default)]
    pub files: BTreeMap<String, String>,

    /// Package-manager command that bootstraps a freshly cleaned chroot.
    #[serde(default = "default_chroot_setup_cmd")]
    pub chroot_setup_cmd: String,

    /// `key value` lines materialized into the build user's macros file.
    #[serde(default)]
    pub macros: BTreeMap<String, String>,

    /// Additional build requirements merged in per source-package name.
    #[serde(default)]
    pub more_buildreqs: BTreeMap<String, Vec<String>>,

    /// Parent directory for per-buildroot caches; plugins receive
    /// `cache_topdir/<shared root name>` as their cache directory.
    #[serde(default = "default_cache_topdir")]
    pub cache_topdir: PathBuf,

    /// Command template used to create the build user inside the chroot.
    /// `{uid}`, `{gid}`, `{user}`, `{group}` and `{home}` are substituted
    /// before the template is split into argv tokens.
    #[serde(default = "default_useradd")]
    pub useradd: String,

    /// When false, the package manager runs with its cache-only flag.
    #[serde(default = "default_true")]
    pub online: bool,

    /// Populate `dev/` with device nodes during init.
    #[serde(default = "default_true")]
    pub internal_dev_setup: bool,

    /// Plugin names to consider at construction time.
    #[serde(default)]
    pub plugins: Vec<String>,

    /// Per-plugin settings: `<name>_enable` booleans and `<name>_opts`
    /// objects.
    #[serde(default)]
    pub plugin_conf: serde_json::Map<String, serde_json::Value>,

    /// Directory external plugin bundles would live in; recorded for
    /// diagnostics. Resolution itself is by name against the compiled-in
    /// registry.
    #[serde(default)]
    pub plugin_dir: PathBuf,

    #[serde(default = "default_build_log_fmt")]
    pub build_log_fmt_str: String,
    #[serde(default = "default_root_log_fmt")]
    pub root_log_fmt_str: String,
    #[serde(default = "default_state_log_fmt")]
    pub state_log_fmt_str: String,
}

fn default_chroothome() -> String {
    "/builddir".to_string()
}

fn default_cache_topdir() -> PathBuf {
    PathBuf::from("/var/cache/rootbox")
}

impl BuildrootConfig {
    /// The buildroot name with the uniqueness tag applied.
    pub fn shared_root_name(&self) -> String {
        match &self.unique_ext {
            Some(ext) => format!("{}-{}", self.root, ext),
            None => self.root.clone(),
        }
    }

    /// Interpolate the `resultdir` template against this configuration.
    pub fn interpolated_resultdir(&self) -> Result<PathBuf> {
        interpolate(&self.resultdir, self).map(PathBuf::from)
    }

    /// Reject configurations the controller cannot operate on.
    pub fn validate(&self) -> Result<()> {
        if self.root.is_empty() {
            return Err(BuildrootError::Config("root must not be empty".into()));
        }
        if !self.basedir.is_absolute() {
            return Err(BuildrootError::Config(format!(
                "basedir must be absolute, got {}",
                self.basedir.display()
            )));
        }
        if !self.chroothome.starts_with('/') {
            return Err(BuildrootError::Config(format!(
                "chroothome must be absolute, got {}",
                self.chroothome
            )));
        }
        if self.target_arch.is_empty() {
            return Err(BuildrootError::Config("target_arch must not be empty".into()));
        }
        let resultdir = self.interpolated_resultdir()?;
        if !resultdir.is_absolute() {
            return Err(BuildrootError::Config(format!(
                "resultdir must interpolate to an absolute path, got {}",
                resultdir.display()
            )));
        }
        shell_words::split(&self.chroot_setup_cmd).map_err(|e| {
            BuildrootError::Config(format!("chroot_setup_cmd does not tokenize: {e}"))
        })?;
        Ok(())
    }
}

/// Expand `%(key)s` references in a template against the full
/// configuration.
///
/// Every scalar option expands to its value (`unique-ext` to the empty
/// string when unset). The collection-valued options have no sensible
/// string form and are rejected, as is an unknown key — a configuration
/// error rather than an empty expansion.
fn interpolate(template: &str, config: &BuildrootConfig) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("%(") {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        let Some(end) = tail.find(")s") else {
            return Err(BuildrootError::Config(format!(
                "unterminated %(key)s reference in {template:?}"
            )));
        };
        let key = &tail[..end];
        let value = match key {
            "root" => config.root.clone(),
            "unique-ext" => config.unique_ext.clone().unwrap_or_default(),
            "basedir" => config.basedir.to_string_lossy().into_owned(),
            "target_arch" => config.target_arch.clone(),
            "chroothome" => config.chroothome.clone(),
            "internal_setarch" => config.internal_setarch.to_string(),
            "chrootuid" => config.chrootuid.to_string(),
            "chrootgid" => config.chrootgid.to_string(),
            "yum.conf" => config.yum_conf.clone(),
            "use_host_resolv" => config.use_host_resolv.to_string(),
            "chroot_setup_cmd" => config.chroot_setup_cmd.clone(),
            "cache_topdir" => config.cache_topdir.to_string_lossy().into_owned(),
            "useradd" => config.useradd.clone(),
            "online" => config.online.to_string(),
            "internal_dev_setup" => config.internal_dev_setup.to_string(),
            "plugin_dir" => config.plugin_dir.to_string_lossy().into_owned(),
            "build_log_fmt_str" => config.build_log_fmt_str.clone(),
            "root_log_fmt_str" => config.root_log_fmt_str.clone(),
            "state_log_fmt_str" => config.state_log_fmt_str.clone(),
            "resultdir" => {
                return Err(BuildrootError::Config(
                    "resultdir cannot reference itself".into(),
                ));
            }
            "files" | "macros" | "more_buildreqs" | "plugins" | "plugin_conf" => {
                return Err(BuildrootError::Config(format!(
                    "%({key})s is not interpolatable: {key} is not a scalar option"
                )));
            }
            other => {
                return Err(BuildrootError::Config(format!(
                    "unknown interpolation key %({other})s"
                )));
            }
        };
        out.push_str(&value);
        rest = &tail[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}
