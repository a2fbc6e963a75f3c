//! Narrow process-execution interface.
//!
//! The controller never assembles shell command strings; every invocation
//! is an argv vector wrapped in an [`ExecSpec`] describing where it runs
//! (host or chroot), as whom, under which personality, for how long, and
//! where its output goes. The [`Executor`] trait is the seam: the real
//! [`HostExecutor`] spawns processes, tests inject a recording double.
//!
//! # Safety
//!
//! The pre-exec hook runs between `fork()` and `exec()` and therefore only
//! uses async-signal-safe syscalls: `personality`, `chroot`, `chdir`,
//! `setgroups`, `setgid`, `setuid`. All strings it needs are prepared as
//! `CString`s before the fork. No allocation, no logging inside the hook.

use std::ffi::CString;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use wait_timeout::ChildExt;

use crate::error::{BuildrootError, Result};
use crate::logging::LogFile;

/// Execution personality applied to subprocesses when internal
/// arch-switching is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Personality {
    Linux,
    Linux32,
}

impl Personality {
    /// The personality matching a target architecture string.
    pub fn for_arch(arch: &str) -> Self {
        match arch {
            "i386" | "i486" | "i586" | "i686" | "athlon" | "ppc" | "sparc" | "sparcv9"
            | "s390" => Personality::Linux32,
            _ => Personality::Linux,
        }
    }
}

const PER_LINUX32: libc::c_ulong = 0x0008;

/// One subprocess invocation.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub argv: Vec<String>,
    /// Chroot into this directory before exec.
    pub chroot: Option<PathBuf>,
    /// Permanently drop to this (uid, gid) in the child before exec; the
    /// process cannot regain privilege afterwards.
    pub run_as: Option<(u32, u32)>,
    pub personality: Option<Personality>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    /// Treat a non-zero exit as an error. Best-effort invocations clear
    /// this and inspect (or ignore) the outcome themselves.
    pub check: bool,
}

impl ExecSpec {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            chroot: None,
            run_as: None,
            personality: None,
            env: Vec::new(),
            timeout: None,
            check: true,
        }
    }

    pub fn chroot(mut self, rootdir: impl Into<PathBuf>) -> Self {
        self.chroot = Some(rootdir.into());
        self
    }

    pub fn run_as(mut self, uid: u32, gid: u32) -> Self {
        self.run_as = Some((uid, gid));
        self
    }

    pub fn personality(mut self, personality: Option<Personality>) -> Self {
        self.personality = personality;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn check(mut self, check: bool) -> Self {
        self.check = check;
        self
    }

    /// The rendered command line, for logging.
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

/// Outcome of a completed (not timed out) subprocess.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub success: bool,
    pub code: Option<i32>,
    /// Interleaved stdout + stderr.
    pub output: String,
}

/// The process-execution collaborator.
pub trait Executor {
    /// Run the command to completion, streaming its output to `log` when
    /// given. With `check` set, a non-zero exit is an error.
    fn run(&self, spec: &ExecSpec, log: Option<&LogFile>) -> Result<ExecOutput>;
}

/// Real executor: spawns the argv on the host with the requested isolation
/// applied in the child.
#[derive(Debug, Default)]
pub struct HostExecutor;

impl HostExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Executor for HostExecutor {
    fn run(&self, spec: &ExecSpec, log: Option<&LogFile>) -> Result<ExecOutput> {
        let Some(program) = spec.argv.first() else {
            return Err(BuildrootError::Exec("empty argv".into()));
        };

        let chroot_dir = spec
            .chroot
            .as_ref()
            .map(|p| CString::new(p.as_os_str().as_bytes()))
            .transpose()
            .map_err(|_| BuildrootError::Exec(format!("chroot path contains NUL: {spec:?}")))?;
        let set_linux32 = spec.personality == Some(Personality::Linux32);
        let run_as = spec.run_as;

        let mut cmd = Command::new(program);
        cmd.args(&spec.argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        // SAFETY: the hook only performs async-signal-safe syscalls on
        // pre-computed values; see the module documentation.
        unsafe {
            cmd.pre_exec(move || {
                if set_linux32 && libc::personality(PER_LINUX32) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                if let Some(dir) = &chroot_dir {
                    if libc::chroot(dir.as_ptr()) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    if libc::chdir(c"/".as_ptr()) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                if let Some((uid, gid)) = run_as {
                    let gid = gid as libc::gid_t;
                    if libc::setgroups(1, &gid) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    if libc::setgid(gid) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    if libc::setuid(uid as libc::uid_t) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }

        tracing::debug!(command = %spec.display(), "spawning");
        let mut child = cmd
            .spawn()
            .map_err(|e| BuildrootError::Exec(format!("failed to run {program}: {e}")))?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        let lines: Mutex<Vec<String>> = Mutex::new(Vec::new());

        let status: Option<ExitStatus> = std::thread::scope(|scope| {
            scope.spawn(|| drain(stdout, &lines, log));
            scope.spawn(|| drain(stderr, &lines, log));

            match spec.timeout {
                Some(limit) => match child.wait_timeout(limit) {
                    Ok(Some(status)) => Ok(Some(status)),
                    Ok(None) => {
                        let _ = child.kill();
                        let _ = child.wait();
                        Ok(None)
                    }
                    Err(e) => Err(BuildrootError::Exec(format!("wait on {program}: {e}"))),
                },
                None => child
                    .wait()
                    .map(Some)
                    .map_err(|e| BuildrootError::Exec(format!("wait on {program}: {e}"))),
            }
        })?;

        let output = {
            let lines = lines.into_inner().unwrap_or_default();
            let mut joined = lines.join("\n");
            if !lines.is_empty() {
                joined.push('\n');
            }
            joined
        };

        let Some(status) = status else {
            return Err(BuildrootError::Exec(format!(
                "{} timed out after {:?}",
                spec.display(),
                spec.timeout.unwrap_or_default()
            )));
        };

        let result = ExecOutput {
            success: status.success(),
            code: status.code(),
            output,
        };

        if spec.check && !result.success {
            let tail: Vec<&str> = result.output.lines().rev().take(5).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            return Err(BuildrootError::Exec(format!(
                "{} failed (exit {:?}): {}",
                spec.display(),
                result.code,
                tail.join(" | ")
            )));
        }
        Ok(result)
    }
}

fn drain<R: Read>(pipe: R, lines: &Mutex<Vec<String>>, log: Option<&LogFile>) {
    let reader = BufReader::new(pipe);
    for line in reader.lines() {
        let Ok(line) = line else { break };
        if let Some(log) = log {
            log.write_line("INFO", &line);
        }
        if let Ok(mut lines) = lines.lock() {
            lines.push(line);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn captures_interleaved_output() {
        let spec = ExecSpec::new(["/bin/sh", "-c", "echo out; echo err >&2"]);
        let result = HostExecutor::new().run(&spec, None).unwrap();
        assert!(result.success);
        assert!(result.output.contains("out"));
        assert!(result.output.contains("err"));
    }

    #[test]
    fn checked_failure_is_an_error() {
        let spec = ExecSpec::new(["/bin/sh", "-c", "echo boom >&2; exit 3"]);
        let err = HostExecutor::new().run(&spec, None).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("exit"), "unexpected message: {msg}");
        assert!(msg.contains("boom"), "output tail missing: {msg}");
    }

    #[test]
    fn unchecked_failure_reports_status() {
        let spec = ExecSpec::new(["/bin/sh", "-c", "exit 3"]).check(false);
        let result = HostExecutor::new().run(&spec, None).unwrap();
        assert!(!result.success);
        assert_eq!(result.code, Some(3));
    }

    #[test]
    fn missing_program_is_exec_error() {
        let spec = ExecSpec::new(["/no/such/binary-here"]);
        match HostExecutor::new().run(&spec, None) {
            Err(BuildrootError::Exec(msg)) => assert!(msg.contains("/no/such/binary-here")),
            other => panic!("expected Exec error, got {other:?}"),
        }
    }

    #[test]
    fn timeout_kills_and_errors() {
        let spec = ExecSpec::new(["/bin/sleep", "30"]).timeout(Some(Duration::from_millis(100)));
        let start = std::time::Instant::now();
        let err = HostExecutor::new().run(&spec, None).unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn output_streams_to_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("build.log");
        let log = LogFile::append(&path, "%(message)s").unwrap();

        let spec = ExecSpec::new(["/bin/echo", "compiling widget"]);
        HostExecutor::new().run(&spec, Some(&log)).unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        assert_eq!(body, "compiling widget\n");
    }

    #[test]
    fn personality_mapping() {
        assert_eq!(Personality::for_arch("i386"), Personality::Linux32);
        assert_eq!(Personality::for_arch("ppc"), Personality::Linux32);
        assert_eq!(Personality::for_arch("x86_64"), Personality::Linux);
        assert_eq!(Personality::for_arch("aarch64"), Personality::Linux);
    }

    #[test]
    fn spec_builder_chains() {
        let spec = ExecSpec::new(["rpm", "-Uvh"])
            .chroot("/var/lib/rootbox/f/root")
            .run_as(1024, 1024)
            .env("HOME", "/builddir")
            .check(false);
        assert_eq!(spec.argv, ["rpm", "-Uvh"]);
        assert_eq!(spec.run_as, Some((1024, 1024)));
        assert!(!spec.check);
        assert_eq!(spec.display(), "rpm -Uvh");
    }
}
