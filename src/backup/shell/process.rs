//! Long-running shell commands whose stdout or stdin is streamed in-process.
//!
//! Both handles kill and reap the child when dropped without `finish`, so an
//! aborted archive operation never leaves a privileged process behind.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use std::io::{self, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;

pub struct ShellReader {
    command: String,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    stderr: Option<JoinHandle<Vec<String>>>,
}

impl ShellReader {
    pub(crate) fn spawn(mut cmd: Command, command: String) -> io::Result<Self> {
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take().map(collect_lines_in_background);
        Ok(Self {
            command,
            child: Some(child),
            stdout,
            stderr,
        })
    }

    /// Drains remaining output, reaps the process and checks its exit code.
    ///
    /// Returns how many bytes were left unread.
    pub fn finish(mut self) -> Result<u64> {
        let drained = match self.stdout.take() {
            Some(mut stdout) => io::copy(&mut stdout, &mut io::sink())?,
            None => 0,
        };
        match self.child.take() {
            Some(mut child) => {
                let status = child.wait()?;
                check_exit(&self.command, status, self.stderr.take())?;
                Ok(drained)
            }
            None => Ok(drained),
        }
    }
}

impl Read for ShellReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stdout.as_mut() {
            Some(stdout) => stdout.read(buf),
            None => Ok(0),
        }
    }
}

impl Drop for ShellReader {
    fn drop(&mut self) {
        if let Some(child) = self.child.take() {
            reap(child, &self.command);
        }
    }
}

pub struct ShellWriter {
    command: String,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stderr: Option<JoinHandle<Vec<String>>>,
}

impl ShellWriter {
    pub(crate) fn spawn(mut cmd: Command, command: String) -> io::Result<Self> {
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        let stdin = child.stdin.take();
        let stderr = child.stderr.take().map(collect_lines_in_background);
        Ok(Self {
            command,
            child: Some(child),
            stdin,
            stderr,
        })
    }

    /// Closes stdin, reaps the process and checks its exit code.
    pub fn finish(mut self) -> Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            // a command that already exited reports through its status below
            let _ = stdin.flush();
        }
        match self.child.take() {
            Some(mut child) => {
                let status = child.wait()?;
                check_exit(&self.command, status, self.stderr.take())
            }
            None => Ok(()),
        }
    }
}

impl Write for ShellWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.write(buf),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "stdin closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for ShellWriter {
    fn drop(&mut self) {
        self.stdin.take();
        if let Some(child) = self.child.take() {
            reap(child, &self.command);
        }
    }
}

fn reap(mut child: Child, command: &str) {
    if let Ok(None) = child.try_wait() {
        tracing::debug!("Killing unfinished command: {}", command);
        let _ = child.kill();
    }
    let _ = child.wait();
}

pub(crate) fn collect_lines_in_background<R: Read + Send + 'static>(
    mut reader: R,
) -> JoinHandle<Vec<String>> {
    std::thread::spawn(move || {
        let mut bytes = Vec::new();
        let _ = reader.read_to_end(&mut bytes);
        to_lines(&bytes)
    })
}

pub(crate) fn to_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(String::from)
        .collect()
}

fn check_exit(
    command: &str,
    status: ExitStatus,
    stderr: Option<JoinHandle<Vec<String>>>,
) -> Result<()> {
    let stderr = stderr.and_then(|h| h.join().ok()).unwrap_or_default();
    if status.success() {
        stderr
            .iter()
            .for_each(|line| tracing::debug!("{}: {}", command, line));
        Ok(())
    } else {
        Err(Error::shell_command_failed(
            command,
            status.code().unwrap_or(-1),
            stderr,
        ))
    }
}
