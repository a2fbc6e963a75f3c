//! Source-package header inspection.
//!
//! Header parsing is an external collaborator: the controller only needs a
//! package name and its textual build requirements. The default
//! implementation queries the host's `rpm` binary; tests inject canned
//! headers.

use std::path::Path;
use std::process::Command;

use crate::error::{BuildrootError, Result};

/// The slice of a source package's header the controller consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrpmHeader {
    pub name: String,
    /// Textual build requirements, internal `rpmlib(...)` markers already
    /// filtered out.
    pub build_requires: Vec<String>,
}

/// Yields headers for source packages on the host filesystem.
pub trait SrpmInspector {
    fn inspect(&self, srpm: &Path) -> Result<SrpmHeader>;
}

/// Inspector backed by `rpm -qp` queries against the host rpm stack.
#[derive(Debug, Default)]
pub struct RpmQueryInspector;

impl RpmQueryInspector {
    pub fn new() -> Self {
        Self
    }

    fn query(&self, srpm: &Path, args: &[&str]) -> Result<String> {
        let output = Command::new("rpm")
            .args(args)
            .arg(srpm)
            .output()
            .map_err(|e| BuildrootError::Exec(format!("failed to run rpm: {e}")))?;
        if !output.status.success() {
            return Err(BuildrootError::Pkg(format!(
                "rpm query on {} failed: {}",
                srpm.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl SrpmInspector for RpmQueryInspector {
    fn inspect(&self, srpm: &Path) -> Result<SrpmHeader> {
        let name = self
            .query(srpm, &["-qp", "--qf", "%{NAME}", "--nosignature"])?
            .trim()
            .to_string();
        let requires = self.query(srpm, &["-qpR", "--nosignature"])?;
        Ok(SrpmHeader {
            name,
            build_requires: filter_requires(requires.lines()),
        })
    }
}

/// Drop rpm-internal capability markers; keep everything else verbatim
/// (including version qualifiers like `libfoo >= 2`).
fn filter_requires<'a>(lines: impl Iterator<Item = &'a str>) -> Vec<String> {
    lines
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("rpmlib("))
        .map(str::to_string)
        .collect()
}

/// Order-preserving union of requirement lists.
pub fn uniq_requires<I, S>(lists: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: IntoIterator<Item = String>,
{
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for list in lists {
        for req in list {
            if seen.insert(req.clone()) {
                out.push(req);
            }
        }
    }
    out
}
