//! File sinks for the state, root, and build log streams.
//!
//! The three files under the result directory are user-visible artifacts of
//! a build, separate from the library's own `tracing` diagnostics. Each
//! sink formats records through a small template with `%(asctime)s`,
//! `%(levelname)s` and `%(message)s` tokens and appends to its file.
//!
//! Attachment happens exactly once per controller regardless of how many
//! times it is requested, and runs under temporarily-dropped privilege so
//! the files are owned by the build user.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

use chrono::Local;

#[derive(Debug, Clone)]
enum Token {
    Literal(String),
    Asctime,
    Level,
    Message,
}

/// Parsed record template.
#[derive(Debug, Clone)]
pub struct LogTemplate {
    tokens: Vec<Token>,
}

impl LogTemplate {
    pub fn parse(fmt: &str) -> Self {
        let mut tokens = Vec::new();
        let mut rest = fmt;
        while let Some(start) = rest.find("%(") {
            if start > 0 {
                tokens.push(Token::Literal(rest[..start].to_string()));
            }
            let tail = &rest[start..];
            let (token, consumed) = if let Some(t) = tail.strip_prefix("%(asctime)s") {
                (Token::Asctime, tail.len() - t.len())
            } else if let Some(t) = tail.strip_prefix("%(levelname)s") {
                (Token::Level, tail.len() - t.len())
            } else if let Some(t) = tail.strip_prefix("%(message)s") {
                (Token::Message, tail.len() - t.len())
            } else {
                // Unknown reference: keep it verbatim so the operator can
                // see what their format string said.
                (Token::Literal("%(".to_string()), 2)
            };
            tokens.push(token);
            rest = &rest[start + consumed..];
        }
        if !rest.is_empty() {
            tokens.push(Token::Literal(rest.to_string()));
        }
        Self { tokens }
    }

    fn render(&self, level: &str, message: &str) -> String {
        let mut out = String::with_capacity(message.len() + 32);
        for token in &self.tokens {
            match token {
                Token::Literal(s) => out.push_str(s),
                Token::Asctime => {
                    out.push_str(&Local::now().format("%Y-%m-%d %H:%M:%S").to_string())
                }
                Token::Level => out.push_str(level),
                Token::Message => out.push_str(message),
            }
        }
        out
    }
}

/// Append-mode log file with a record template.
///
/// Writing is infallible from the caller's point of view: a sink that has
/// started failing must not take the build down with it, so errors are
/// reported once through `tracing` and otherwise swallowed.
#[derive(Debug)]
pub struct LogFile {
    file: Mutex<File>,
    template: LogTemplate,
}

impl LogFile {
    pub fn append(path: &Path, fmt: &str) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            template: LogTemplate::parse(fmt),
        })
    }

    pub fn write_line(&self, level: &str, message: &str) {
        let line = self.template.render(level, message);
        let mut file = match self.file.lock() {
            Ok(f) => f,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(file, "{line}") {
            tracing::warn!(error = %e, "log sink write failed");
        }
    }
}

pub const STATE_LOG: &str = "state.log";
pub const ROOT_LOG: &str = "root.log";
pub const BUILD_LOG: &str = "build.log";

/// The controller's three artifact sinks.
#[derive(Debug, Default)]
pub struct BuildLogs {
    state: Option<LogFile>,
    root: Option<LogFile>,
    build: Option<LogFile>,
}

impl BuildLogs {
    /// Attach the three append-mode sinks under `resultdir`. Idempotent:
    /// later calls leave the already-attached sinks alone.
    pub fn attach(
        &mut self,
        resultdir: &Path,
        state_fmt: &str,
        root_fmt: &str,
        build_fmt: &str,
    ) -> io::Result<()> {
        if self.attached() {
            return Ok(());
        }
        self.state = Some(LogFile::append(&resultdir.join(STATE_LOG), state_fmt)?);
        self.root = Some(LogFile::append(&resultdir.join(ROOT_LOG), root_fmt)?);
        self.build = Some(LogFile::append(&resultdir.join(BUILD_LOG), build_fmt)?);
        Ok(())
    }

    pub fn attached(&self) -> bool {
        self.state.is_some()
    }

    pub fn state(&self) -> Option<&LogFile> {
        self.state.as_ref()
    }

    pub fn root(&self) -> Option<&LogFile> {
        self.root.as_ref()
    }

    pub fn build(&self) -> Option<&LogFile> {
        self.build.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn template_renders_tokens() {
        let t = LogTemplate::parse("%(levelname)s: %(message)s");
        assert_eq!(t.render("INFO", "hello"), "INFO: hello");
    }

    #[test]
    fn template_keeps_unknown_references() {
        let t = LogTemplate::parse("%(name)s %(message)s");
        assert_eq!(t.render("INFO", "x"), "%(name)s x");
    }

    #[test]
    fn message_only_template() {
        let t = LogTemplate::parse("%(message)s");
        assert_eq!(t.render("DEBUG", "mount -n ..."), "mount -n ...");
    }

    #[test]
    fn write_line_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("root.log");
        let log = LogFile::append(&path, "%(message)s").unwrap();
        log.write_line("INFO", "first");
        log.write_line("INFO", "second");
        let body = std::fs::read_to_string(&path).unwrap();
        assert_eq!(body, "first\nsecond\n");
    }

    #[test]
    fn attach_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut logs = BuildLogs::default();
        logs.attach(dir.path(), "%(message)s", "%(message)s", "%(message)s")
            .unwrap();
        assert!(logs.attached());

        logs.state().unwrap().write_line("INFO", "once");
        logs.attach(dir.path(), "%(message)s", "%(message)s", "%(message)s")
            .unwrap();
        logs.state().unwrap().write_line("INFO", "twice");

        let body = std::fs::read_to_string(dir.path().join(STATE_LOG)).unwrap();
        assert_eq!(body, "once\ntwice\n");
        assert!(dir.path().join(ROOT_LOG).exists());
        assert!(dir.path().join(BUILD_LOG).exists());
    }
}
