//! rootbox — chroot buildroot controller.
//!
//! A [`Buildroot`] constructs and owns an isolated filesystem tree in which
//! an untrusted source package is rebuilt into binary packages: it takes an
//! exclusive lock on the on-disk state, installs the dependency closure
//! with the package manager, drops privilege to a dedicated build user, and
//! runs the build tool inside the chroot with structured log capture.
//!
//! ```ignore
//! use rootbox::{Buildroot, BuildrootConfig};
//!
//! let config: BuildrootConfig = serde_json::from_str(&config_text)?;
//! let mut root = Buildroot::new(config)?;
//! root.clean()?;
//! root.init()?;
//! root.build(Path::new("widget-1.0-1.src.rpm"), Some(timeout))?;
//! ```
//!
//! External collaborators — process execution and source-package header
//! parsing — enter through the [`exec::Executor`] and
//! [`srpm::SrpmInspector`] seams; command-line parsing and configuration
//! loading live in the CLI crate.

pub mod buildroot;
pub mod config;
pub mod devices;
pub mod error;
pub mod exec;
pub mod fsutil;
pub mod hooks;
pub mod lock;
pub mod logging;
pub mod mounts;
pub mod paths;
pub mod plugins;
pub mod srpm;
pub mod uid;

mod build;
mod user;
mod yum;

pub use buildroot::{Buildroot, State};
pub use config::BuildrootConfig;
pub use error::{BuildrootError, Result};
pub use exec::{ExecOutput, ExecSpec, Executor, HostExecutor, Personality};
pub use hooks::{Hook, Stage};
pub use plugins::{PLUGIN_API_VERSION, Plugin, PluginContext, PluginRegistry};
pub use srpm::{SrpmHeader, SrpmInspector};
