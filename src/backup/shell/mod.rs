//! Privileged command execution.
//!
//! Every command line goes through one wrapper (`su -c` on a rooted device, plain
//! `sh -c` when the process is already privileged). The session is opened lazily
//! and at most once: the root check and the utility-box probe run on the first
//! call, and their outcome, including failure, is kept for the process lifetime.

pub mod process;

use crate::backup::function_path;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFnName, AddMsg};
use crate::backup::shell::process::{to_lines, ShellReader, ShellWriter};
use function_name::named;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::Path;
use std::process::{Command, Stdio};
use std::result;
use std::sync::OnceLock;
use validator::{Validate, ValidationError};

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ShellConfig {
    /// Wrapper argv the command line is appended to; `None` runs `sh -c` directly
    #[serde(default = "default_su")]
    #[validate(custom(function = validate_su))]
    pub su: Option<Vec<String>>,
    /// Multi-call binaries tried in order; the first one answering is the prefix
    #[serde(default = "default_util_boxes")]
    pub util_boxes: Vec<String>,
    #[serde(default = "default_require_root")]
    pub require_root: bool,
}

fn default_su() -> Option<Vec<String>> {
    Some(vec!["su".into(), "-c".into()])
}

fn default_util_boxes() -> Vec<String> {
    vec!["toybox".into(), "busybox".into()]
}

fn default_require_root() -> bool {
    true
}

fn validate_su(su: &Vec<String>) -> result::Result<(), ValidationError> {
    if su.is_empty() || su[0].trim().is_empty() {
        return Err(ValidationError::new("InvalidSu")
            .with_message("su wrapper needs at least a program name".into()));
    }
    Ok(())
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            su: default_su(),
            util_boxes: default_util_boxes(),
            require_root: default_require_root(),
        }
    }
}

impl ShellConfig {
    /// Runs commands as the current user with plain tools, no root check.
    pub fn unprivileged() -> Self {
        Self {
            su: None,
            util_boxes: vec![],
            require_root: false,
        }
    }
}

/// Outcome of one command line. A non-zero exit code is a normal result.
#[derive(Clone, Debug, PartialEq, Eq, Getters, CopyGetters)]
pub struct ShellResult {
    #[getset(get_copy = "pub")]
    exit_code: i32,
    #[getset(get = "pub")]
    out: Vec<String>,
    #[getset(get = "pub")]
    err: Vec<String>,
}

/// Outcome of one command line with stdout left as raw bytes.
#[derive(Clone, Debug, PartialEq, Eq, Getters, CopyGetters)]
pub struct RawShellResult {
    #[getset(get_copy = "pub")]
    exit_code: i32,
    #[getset(get = "pub")]
    out: Vec<u8>,
    #[getset(get = "pub")]
    err: Vec<String>,
}

impl RawShellResult {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

impl ShellResult {
    pub fn new(exit_code: i32, out: Vec<String>, err: Vec<String>) -> Self {
        Self {
            exit_code,
            out,
            err,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug)]
struct Session {
    util_box: String,
}

#[derive(Debug)]
pub struct ShellHandler {
    config: ShellConfig,
    session: OnceLock<result::Result<Session, String>>,
}

impl ShellHandler {
    pub fn new(config: ShellConfig) -> Self {
        Self {
            config,
            session: OnceLock::new(),
        }
    }

    /// Opens the privileged session. Calls after the first one are no-ops.
    pub fn init(&self) -> Result<()> {
        self.session().map(|_| ())
    }

    /// Prefix placed in front of tool names, empty when no util box answered.
    pub fn util_box(&self) -> Result<&str> {
        self.session().map(|s| s.util_box.as_str())
    }

    /// `tar` becomes `toybox tar` when toybox is the util box.
    pub fn tool(&self, name: &str) -> Result<String> {
        let util_box = self.util_box()?;
        Ok(if util_box.is_empty() {
            name.to_string()
        } else {
            format!("{util_box} {name}")
        })
    }

    #[named]
    pub fn run<S: AsRef<OsStr>>(&self, command_line: S) -> Result<ShellResult> {
        let raw = self.run_raw(command_line).add_fn_name(function_path!())?;
        Ok(ShellResult::new(raw.exit_code, to_lines(&raw.out), raw.err))
    }

    /// Like `run`, but stdout is kept as the bytes the command printed.
    pub fn run_raw<S: AsRef<OsStr>>(&self, command_line: S) -> Result<RawShellResult> {
        let command_line = command_line.as_ref();
        self.session()?;
        tracing::trace!("Running: {}", command_line.to_string_lossy());
        self.run_unchecked(command_line)
            .map_err(Error::from)
            .add_msg(format!("Cannot start {command_line:?}"))
    }

    /// Like `run`, but a non-zero exit code becomes `ShellCommandFailed`.
    pub fn run_checked<S: AsRef<OsStr>>(&self, command_line: S) -> Result<ShellResult> {
        let res = self.run(&command_line)?;
        if res.is_success() {
            Ok(res)
        } else {
            Err(Error::shell_command_failed(
                command_line.as_ref().to_string_lossy(),
                res.exit_code,
                res.err,
            ))
        }
    }

    pub fn spawn_reader<S: AsRef<OsStr>>(&self, command_line: S) -> Result<ShellReader> {
        let command_line = command_line.as_ref();
        self.session()?;
        tracing::trace!("Streaming from: {}", command_line.to_string_lossy());
        ShellReader::spawn(
            self.command(command_line),
            command_line.to_string_lossy().into_owned(),
        )
        .map_err(Error::from)
        .add_msg(format!("Cannot start {command_line:?}"))
    }

    pub fn spawn_writer<S: AsRef<OsStr>>(&self, command_line: S) -> Result<ShellWriter> {
        let command_line = command_line.as_ref();
        self.session()?;
        tracing::trace!("Streaming into: {}", command_line.to_string_lossy());
        ShellWriter::spawn(
            self.command(command_line),
            command_line.to_string_lossy().into_owned(),
        )
        .map_err(Error::from)
        .add_msg(format!("Cannot start {command_line:?}"))
    }

    fn session(&self) -> Result<&Session> {
        match self.session.get_or_init(|| self.open_session()) {
            Ok(session) => Ok(session),
            Err(reason) => Err(Error::PrivilegeUnavailable {
                reason: reason.clone(),
            }),
        }
    }

    fn open_session(&self) -> result::Result<Session, String> {
        if self.config.require_root {
            let res = self
                .run_unchecked(OsStr::new("id -u"))
                .map_err(|e| format!("cannot start privileged shell: {e}"))?;
            let uid = to_lines(&res.out).first().map(|l| l.trim().to_string());
            if !res.is_success() || uid.as_deref() != Some("0") {
                tracing::error!("Root access denied: {:?}", res);
                return Err(format!(
                    "`id -u` answered {:?} with exit code {}",
                    uid.unwrap_or_default(),
                    res.exit_code
                ));
            }
        }

        let util_box = self
            .config
            .util_boxes
            .iter()
            .find(|candidate| {
                self.run_unchecked(OsStr::new(&format!("{} echo ok", quote(candidate))))
                    .map(|res| res.is_success() && res.out == b"ok\n")
                    .unwrap_or(false)
            })
            .cloned();

        match &util_box {
            Some(b) => tracing::info!("Privileged session ready, util box {:?}", b),
            None if self.config.util_boxes.is_empty() => {
                tracing::info!("Privileged session ready, using plain tools")
            }
            None => tracing::warn!(
                "None of {:?} answered, falling back to plain tools",
                self.config.util_boxes
            ),
        }

        Ok(Session {
            util_box: util_box.map(|b| quote(&b)).unwrap_or_default(),
        })
    }

    fn command(&self, command_line: &OsStr) -> Command {
        match &self.config.su {
            Some(su) => {
                let mut cmd = Command::new(&su[0]);
                cmd.args(&su[1..]).arg(command_line);
                cmd
            }
            None => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(command_line);
                cmd
            }
        }
    }

    fn run_unchecked(&self, command_line: &OsStr) -> std::io::Result<RawShellResult> {
        let output = self
            .command(command_line)
            .stdin(Stdio::null())
            .output()?;
        Ok(RawShellResult {
            exit_code: output.status.code().unwrap_or(-1),
            out: output.stdout,
            err: to_lines(&output.stderr),
        })
    }
}

/// Single-quotes `s` for the shell.
pub fn quote<S: AsRef<str>>(s: S) -> String {
    format!("'{}'", s.as_ref().replace('\'', r"'\''"))
}

/// Single-quotes a path byte for byte; names need not be UTF-8.
pub fn quote_os<S: AsRef<OsStr>>(s: S) -> OsString {
    let mut quoted = Vec::with_capacity(s.as_ref().len() + 2);
    quoted.push(b'\'');
    for &byte in s.as_ref().as_bytes() {
        if byte == b'\'' {
            quoted.extend_from_slice(br"'\''");
        } else {
            quoted.push(byte);
        }
    }
    quoted.push(b'\'');
    OsString::from_vec(quoted)
}

/// A command line built from literal words and quoted paths.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandLine(OsString);

impl CommandLine {
    pub fn new<S: AsRef<str>>(program: S) -> Self {
        Self(OsString::from(program.as_ref()))
    }

    /// Appends `text` unquoted.
    pub fn arg<S: AsRef<str>>(mut self, text: S) -> Self {
        self.push_separator();
        self.0.push(text.as_ref());
        self
    }

    pub fn path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.push_separator();
        self.0.push(quote_os(path.as_ref()));
        self
    }

    pub fn as_os_str(&self) -> &OsStr {
        &self.0
    }

    fn push_separator(&mut self) {
        if !self.0.is_empty() {
            self.0.push(" ");
        }
    }
}

impl AsRef<OsStr> for CommandLine {
    fn as_ref(&self) -> &OsStr {
        &self.0
    }
}

/// Joins commands into one script, one per line.
pub fn script<'a, I: IntoIterator<Item = &'a CommandLine>>(prelude: &str, lines: I) -> OsString {
    let mut script = OsString::from(prelude);
    for line in lines {
        script.push("\n");
        script.push(&line.0);
    }
    script
}
