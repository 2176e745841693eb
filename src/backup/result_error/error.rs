use crate::backup::result_error::{AddFnName, AddMsg};
use itertools::Itertools;
use std::path::PathBuf;
use std::sync::mpsc::SendError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Rusqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    ValidationError(#[from] validator::ValidationErrors),
    #[error(transparent)]
    ThreadPoolBuildError(#[from] rayon::ThreadPoolBuildError),
    #[error(transparent)]
    SerdeYml(#[from] serde_yml::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    Globset(#[from] globset::Error),
    #[error(transparent)]
    LettreError(#[from] lettre::error::Error),
    #[error(transparent)]
    SmtpError(#[from] lettre::transport::smtp::Error),
    #[error("smtp server rejected message: {0}")]
    SmtpSendError(String),
    #[error("privileged shell unavailable: {reason}")]
    PrivilegeUnavailable { reason: String },
    #[error("command `{command}` exited with code {exit_code}{}", format_stderr(.stderr))]
    ShellCommandFailed {
        command: String,
        exit_code: i32,
        stderr: Vec<String>,
    },
    #[error("archive corrupt: {0}")]
    ArchiveCorrupt(String),
    #[error("unsupported entry type {kind} for {path:?}")]
    UnsupportedEntryType { path: PathBuf, kind: String },
    #[error("schedule misconfigured: {0}")]
    ScheduleMisconfigured(String),
    #[error("alarm class {0} is not available")]
    AlarmUnavailable(String),
    #[error("{path:?} changed while archiving, bytes specified in the header were not all written")]
    DataChanged { path: PathBuf },
    #[error("archive {0:?} is encrypted but no encryption key is configured")]
    EncryptionKeyMissing(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("batch rejected item: {0}")]
    BatchRejected(String),
    #[error("{0} panicked")]
    ItemPanicked(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("{0}")]
    ChannelSendError(String),
    #[error("{}:\n{}", msg, indent::indent_all_with("  ", error.to_string()))]
    WithMsg { msg: String, error: Box<Error> },
    #[error("{} failed:\n{}", fn_name, indent::indent_all_with("  ", error.to_string()))]
    WithFnName { fn_name: String, error: Box<Error> },
    #[error("{}", itertools::join(.0, "\n\n"))]
    LotsOfError(Vec<Error>),
}

fn format_stderr(stderr: &[String]) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(":\n{}", indent::indent_all_with("  ", stderr.join("\n")))
    }
}

impl<S: Into<String>> AddMsg<S> for Error {
    fn add_msg(self, msg: S) -> Self {
        Self::WithMsg {
            msg: msg.into(),
            error: Box::new(self),
        }
    }
}

impl<S: Into<String>> AddFnName<S> for Error {
    fn add_fn_name(self, fn_name: S) -> Self {
        Self::WithFnName {
            fn_name: fn_name.into(),
            error: Box::new(self),
        }
    }
}

impl<D> From<SendError<D>> for Error {
    fn from(_: SendError<D>) -> Self {
        Self::ChannelSendError("receiver hung up".into())
    }
}

impl From<Vec<Error>> for Error {
    fn from(errors: Vec<Error>) -> Self {
        if errors.is_empty() {
            panic!("Should not create lots of errors when error is empty")
        }
        Self::LotsOfError(errors.into_iter().flat_map(Error::into_iter).collect_vec())
    }
}

impl Error {
    pub fn shell_command_failed<S: Into<String>>(
        command: S,
        exit_code: i32,
        stderr: Vec<String>,
    ) -> Self {
        Self::ShellCommandFailed {
            command: command.into(),
            exit_code,
            stderr,
        }
    }

    pub fn archive_corrupt<S: Into<String>>(msg: S) -> Self {
        Self::ArchiveCorrupt(msg.into())
    }

    pub fn into_iter(self) -> Box<dyn Iterator<Item = Error>> {
        match self {
            Error::LotsOfError(v) => Box::new(v.into_iter().flat_map(Error::into_iter)),
            e => Box::new(std::iter::once(e)),
        }
    }

    pub fn chain(self, other: Error) -> Error {
        Error::LotsOfError(self.into_iter().chain(other.into_iter()).collect_vec())
    }

    /// Strips `WithMsg`/`WithFnName` context down to the error that caused it.
    pub fn root(&self) -> &Error {
        match self {
            Error::WithMsg { error, .. } | Error::WithFnName { error, .. } => error.root(),
            e => e,
        }
    }

    /// Privilege loss is permanent for the process; everything else is per call.
    pub fn is_fatal(&self) -> bool {
        match self.root() {
            Error::PrivilegeUnavailable { .. } => true,
            Error::LotsOfError(v) => v.iter().any(Error::is_fatal),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Error::Cancelled)
    }

    pub fn is_archive_corrupt(&self) -> bool {
        matches!(self.root(), Error::ArchiveCorrupt(_))
    }
}

/// Message shown next to a failed item's label.
pub fn human_readable(error: &Error) -> String {
    match error.root() {
        Error::DataChanged { path } => {
            format!("data changed during the operation ({})", path.display())
        }
        Error::ArchiveCorrupt(msg) => {
            format!("backup is broken or the encryption password is wrong ({msg})")
        }
        Error::ShellCommandFailed {
            exit_code, stderr, ..
        } => match stderr.iter().rev().find(|l| !l.trim().is_empty()) {
            Some(line) => format!("{} (exit code {exit_code})", line.trim()),
            None => format!("shell command failed with exit code {exit_code}"),
        },
        Error::LotsOfError(v) => v.iter().map(human_readable).join("; "),
        e => e.to_string(),
    }
}
